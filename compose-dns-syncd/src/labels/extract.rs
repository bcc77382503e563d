use std::collections::{BTreeMap, BTreeSet};
use shared::protocol::{
    GROUP_DNS, GROUP_HOST_IP, LABEL_DNS, LABEL_HOST_IP, LABEL_PREFIX, TRAEFIK_ROUTER_PREFIX,
    TRAEFIK_RULE_SUFFIX, UNKNOWN,
};
use shared::types::{is_token, EntityKey, EntityRecord, LabelSnapshot};

/// Normalized labels of every service, keyed by service name
pub type ServiceLabels = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub process_traefik: bool,
    pub default_host_ip: Option<String>,
}

/// Labels of one named group (`pihole.<group>.hostip` / `pihole.<group>.dns`)
#[derive(Default)]
struct GroupLabels<'a> {
    host_ip: Option<&'a str>,
    dns: Option<&'a str>,
}

/// Build the snapshot for all services.
/// Services without any DNS-relevant label produce no entity.
pub fn extract_snapshot(services: &ServiceLabels, options: &ExtractOptions) -> LabelSnapshot {
    let mut snapshot = LabelSnapshot::new();
    for (service, labels) in services {
        extract_service(service, labels, options, &mut snapshot);
    }
    snapshot
}

fn extract_service(
    service: &str,
    labels: &BTreeMap<String, String>,
    options: &ExtractOptions,
    snapshot: &mut LabelSnapshot,
) {
    let service_ip = labels
        .get(LABEL_HOST_IP)
        .and_then(|v| host_ip_token(service, LABEL_HOST_IP, v));
    let fallback_ip = service_ip
        .clone()
        .or_else(|| options.default_host_ip.clone())
        .unwrap_or_else(|| UNKNOWN.to_string());

    let mut names: BTreeSet<String> = labels
        .get(LABEL_DNS)
        .map(|v| split_names(v))
        .unwrap_or_default();

    let mut traefik_seen = false;
    if options.process_traefik {
        for (key, rule) in labels {
            if key.starts_with(TRAEFIK_ROUTER_PREFIX) && key.ends_with(TRAEFIK_RULE_SUFFIX) {
                let hosts = traefik_hosts(rule);
                if !hosts.is_empty() {
                    tracing::debug!("Service {} router rule {} yields {:?}", service, key, hosts);
                    traefik_seen = true;
                    names.extend(hosts);
                }
            }
        }
    }

    if service_ip.is_some() || labels.contains_key(LABEL_DNS) || traefik_seen {
        snapshot.insert(
            EntityKey::service(service),
            EntityRecord {
                host_ip: fallback_ip.clone(),
                dns_names: names,
            },
        );
    }

    for (group, group_labels) in collect_groups(labels) {
        let host_ip = group_labels
            .host_ip
            .and_then(|v| host_ip_token(service, group, v))
            .unwrap_or_else(|| fallback_ip.clone());
        let dns_names = group_labels.dns.map(split_names).unwrap_or_default();

        snapshot.insert(EntityKey::group(service, group), EntityRecord { host_ip, dns_names });
    }
}

fn collect_groups(labels: &BTreeMap<String, String>) -> BTreeMap<&str, GroupLabels<'_>> {
    let mut groups: BTreeMap<&str, GroupLabels<'_>> = BTreeMap::new();
    for (key, value) in labels {
        let Some(rest) = key.strip_prefix(LABEL_PREFIX) else {
            continue;
        };
        let Some((group, field)) = rest.split_once('.') else {
            continue;
        };
        if group.is_empty() || field.contains('.') {
            continue;
        }
        match field {
            GROUP_HOST_IP => groups.entry(group).or_default().host_ip = Some(value.as_str()),
            GROUP_DNS => groups.entry(group).or_default().dns = Some(value.as_str()),
            _ => {}
        }
    }
    groups
}

/// Split a multi-valued DNS label: `a.local,b.local`, `"a.local", "b.local"`,
/// `` `a.local`,`b.local` `` or `(a.local, b.local)`.
/// Entries containing whitespace after cleaning are dropped.
pub fn split_names(value: &str) -> BTreeSet<String> {
    let trimmed = value
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);

    trimmed
        .split(',')
        .map(clean_token)
        .filter(|name| {
            if name.chars().any(char::is_whitespace) {
                tracing::debug!("Ignoring malformed DNS name '{}'", name);
                return false;
            }
            !name.is_empty()
        })
        .collect()
}

/// Hosts named in a traefik router rule, e.g.
/// ``Host(`a.example.com`) || Host(`b.example.com`)`` or ``Host(`a.example.com`, `b.example.com`)``
pub fn traefik_hosts(rule: &str) -> Vec<String> {
    const MATCHER: &str = "Host(";

    let mut hosts = Vec::new();
    let mut rest = rule;
    while let Some(start) = rest.find(MATCHER) {
        let preceded_by_ident = rest[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric());
        let after = &rest[start + MATCHER.len()..];
        let end = after.find(')').unwrap_or(after.len());

        if !preceded_by_ident {
            hosts.extend(split_names(&after[..end]));
        }
        rest = &after[end..];
    }
    hosts
}

/// A host IP label value usable as the first token of an output line.
/// Lists and values with embedded whitespace are rejected.
fn host_ip_token(service: &str, label: &str, raw: &str) -> Option<String> {
    let value = clean_token(raw);
    if value.is_empty() {
        return None;
    }
    if !is_token(&value) || value.contains(',') {
        tracing::warn!("Service {}: ignoring malformed host IP '{}' in {}", service, raw, label);
        return None;
    }
    Some(value)
}

fn clean_token(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '(' || c == ')' || c.is_whitespace())
        .to_string()
}
