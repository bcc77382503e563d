/// Sentinel used for a host IP or DNS name that has not been observed
pub const UNKNOWN: &str = "unknown";

/// Label carrying the target host IP of a service
pub const LABEL_HOST_IP: &str = "pihole.hostip";

/// Label carrying the comma-separated DNS names of a service
pub const LABEL_DNS: &str = "pihole.dns";

/// Prefix shared by all pihole labels, including named groups
/// (`pihole.<group>.hostip`, `pihole.<group>.dns`)
pub const LABEL_PREFIX: &str = "pihole.";

/// Suffix-less key fragments used inside named groups
pub const GROUP_HOST_IP: &str = "hostip";
pub const GROUP_DNS: &str = "dns";

/// Traefik router rules live at `traefik.http.routers.<router>.rule`
pub const TRAEFIK_ROUTER_PREFIX: &str = "traefik.http.routers.";
pub const TRAEFIK_RULE_SUFFIX: &str = ".rule";

/// Joins a service name and a group name into one entity key.
/// Compose service names are limited to `[a-zA-Z0-9._-]`.
pub const GROUP_SEPARATOR: char = '/';
