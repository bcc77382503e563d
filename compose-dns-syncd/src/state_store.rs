use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use serde::Deserialize;
use shared::types::{EntityKey, Pair, PriorEntry, PriorState};
use crate::error::StateStoreError;
use crate::fsutil::write_atomic;

/// Entry shapes accepted when reading a state file.
/// Older files recorded a single pair per entity instead of pair sets.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Current(PriorEntry),
    SinglePair {
        current: String,
        #[serde(default)]
        previous: Option<String>,
    },
    Bare(String),
}

impl StoredEntry {
    fn into_entry(self) -> PriorEntry {
        match self {
            StoredEntry::Current(entry) => entry,
            StoredEntry::SinglePair { current, previous } => PriorEntry {
                current_pairs: pair_set(&current),
                previous_pairs: previous.as_deref().map(pair_set).unwrap_or_default(),
                updated_at: None,
            },
            StoredEntry::Bare(current) => PriorEntry {
                current_pairs: pair_set(&current),
                previous_pairs: BTreeSet::from([Pair::unknown()]),
                updated_at: None,
            },
        }
    }
}

fn pair_set(line: &str) -> BTreeSet<Pair> {
    Pair::parse(line).into_iter().collect()
}

/// JSON file holding the reconciler's prior state.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. Missing, unreadable or corrupt files yield an empty state.
    pub fn load(&self) -> PriorState {
        match self.try_load() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Starting from empty state: {}", e);
                PriorState::new()
            }
        }
    }

    fn try_load(&self) -> Result<PriorState, StateStoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("No state file at {}, starting fresh", self.path.display());
                return Ok(PriorState::new());
            }
            Err(source) => {
                return Err(StateStoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if contents.trim().is_empty() {
            return Ok(PriorState::new());
        }

        let stored: BTreeMap<EntityKey, StoredEntry> =
            serde_json::from_str(&contents).map_err(|source| StateStoreError::Decode {
                path: self.path.clone(),
                source,
            })?;

        Ok(stored
            .into_iter()
            .map(|(key, entry)| (key, entry.into_entry()))
            .collect())
    }

    /// Persist the state atomically
    pub fn save(&self, state: &PriorState) -> Result<(), StateStoreError> {
        let mut json = serde_json::to_string_pretty(state)?;
        json.push('\n');

        write_atomic(&self.path, json.as_bytes()).map_err(|source| StateStoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
