use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::{GROUP_SEPARATOR, UNKNOWN};

/// Stable identifier of a tracked entity.
/// Either a compose service name (`web`) or a service plus a named DNS group (`web/admin`).
/// Compose service names cannot contain `/`, so the two forms never collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn service(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn group(service: &str, group: &str) -> Self {
        Self(format!("{}{}{}", service, GROUP_SEPARATOR, group))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// DNS-relevant data extracted from one entity's labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Target host IP, `unknown` when no label supplied one
    pub host_ip: String,

    /// DNS names published by the entity
    pub dns_names: BTreeSet<String>,
}

impl EntityRecord {
    pub fn new(host_ip: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            dns_names: BTreeSet::new(),
        }
    }

    /// One pair per DNS name, all sharing the record's host IP.
    /// Names that cannot form a well-formed pair are left out.
    pub fn pairs(&self) -> BTreeSet<Pair> {
        self.dns_names
            .iter()
            .filter_map(|name| Pair::checked(&self.host_ip, name))
            .collect()
    }
}

impl Default for EntityRecord {
    fn default() -> Self {
        Self::new(UNKNOWN)
    }
}

/// A `"<host-ip> <dns-name>"` line, the unit written to the output document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pair(String);

impl Pair {
    pub fn new(host_ip: &str, dns_name: &str) -> Self {
        Self(format!("{} {}", host_ip, dns_name))
    }

    /// Build a pair only when both tokens are non-empty and free of whitespace
    pub fn checked(host_ip: &str, dns_name: &str) -> Option<Self> {
        (is_token(host_ip) && is_token(dns_name)).then(|| Self::new(host_ip, dns_name))
    }

    /// The pair recorded for an entity that has never been observed
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN)
    }

    /// Parse a line holding exactly two whitespace-separated tokens
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let host_ip = tokens.next()?;
        let dns_name = tokens.next()?;
        if tokens.next().is_some() {
            return None;
        }
        Some(Self::new(host_ip, dns_name))
    }

    pub fn host_ip(&self) -> &str {
        self.0.split_once(' ').map(|(ip, _)| ip).unwrap_or(&self.0)
    }

    pub fn dns_name(&self) -> &str {
        self.0.split_once(' ').map(|(_, name)| name).unwrap_or("")
    }

    pub fn is_unknown_host(&self) -> bool {
        self.host_ip() == UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single output-line token: non-empty, no whitespace
pub fn is_token(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(char::is_whitespace)
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything extracted from the label source in one cycle, ordered by key
/// so that processing order is deterministic.
pub type LabelSnapshot = BTreeMap<EntityKey, EntityRecord>;

/// What the reconciler remembers about an entity between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorEntry {
    /// Pairs derived in the most recent cycle that changed this entity
    pub current_pairs: BTreeSet<Pair>,

    /// The `current_pairs` value those pairs replaced
    pub previous_pairs: BTreeSet<Pair>,

    /// When `current_pairs` last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PriorEntry {
    /// Entry assumed for an entity with no recorded history
    pub fn first_observation() -> Self {
        Self {
            current_pairs: BTreeSet::from([Pair::unknown()]),
            previous_pairs: BTreeSet::new(),
            updated_at: None,
        }
    }
}

pub type PriorState = BTreeMap<EntityKey, PriorEntry>;
