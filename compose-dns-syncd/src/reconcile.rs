use std::collections::BTreeSet;
use chrono::{DateTime, Utc};
use shared::types::{EntityKey, LabelSnapshot, Pair, PriorEntry, PriorState};
use crate::config::RetentionPolicy;

/// Line-level edits for the output document.
/// Removals are applied before additions; additions are applied in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditSet {
    pub removals: BTreeSet<Pair>,
    pub additions: Vec<Pair>,
}

impl EditSet {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }

    /// Combine with a later edit set so that applying the result equals applying `self` then `next`.
    pub fn then(self, next: EditSet) -> EditSet {
        let mut removals: BTreeSet<Pair> = self
            .removals
            .into_iter()
            .filter(|pair| !next.additions.contains(pair))
            .collect();
        removals.extend(next.removals.iter().cloned());

        let mut additions: Vec<Pair> = self
            .additions
            .into_iter()
            .filter(|pair| !next.removals.contains(pair))
            .collect();
        for pair in next.additions {
            if !additions.contains(&pair) {
                additions.push(pair);
            }
        }

        EditSet { removals, additions }
    }

    fn push_addition(&mut self, pair: Pair) {
        if !self.additions.contains(&pair) {
            self.additions.push(pair);
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub state: PriorState,
    pub changed: bool,
    pub edits: EditSet,
    /// Entities whose pairs changed, in processing order
    pub updated: Vec<EntityKey>,
    /// Entities dropped under [`RetentionPolicy::Purge`]
    pub purged: Vec<EntityKey>,
}

/// Compare `snapshot` with `prior`, advancing state only for entities whose
/// pairs changed, and derive the line edits the output document needs.
pub fn reconcile(
    snapshot: &LabelSnapshot,
    prior: &PriorState,
    retention: RetentionPolicy,
    now: DateTime<Utc>,
) -> Reconciliation {
    let mut state = prior.clone();
    let mut updated = Vec::new();
    let mut purged = Vec::new();
    let mut removal_candidates = BTreeSet::new();
    let mut edits = EditSet::default();

    for (key, record) in snapshot {
        let new_pairs = record.pairs();
        let old_entry = prior
            .get(key)
            .cloned()
            .unwrap_or_else(PriorEntry::first_observation);

        if new_pairs == old_entry.current_pairs {
            continue;
        }

        tracing::debug!(
            "Entity {} changed: {:?} -> {:?}",
            key,
            old_entry.current_pairs,
            new_pairs
        );

        removal_candidates.extend(old_entry.current_pairs.difference(&new_pairs).cloned());
        for pair in new_pairs.difference(&old_entry.current_pairs) {
            edits.push_addition(pair.clone());
        }

        state.insert(
            key.clone(),
            PriorEntry {
                current_pairs: new_pairs,
                previous_pairs: old_entry.current_pairs,
                updated_at: Some(now),
            },
        );
        updated.push(key.clone());
    }

    if retention == RetentionPolicy::Purge {
        if snapshot.is_empty() && !prior.is_empty() {
            tracing::warn!("Label snapshot is empty, skipping purge of {} entities", prior.len());
        } else {
            let stale: Vec<EntityKey> = prior
                .keys()
                .filter(|key| !snapshot.contains_key(*key))
                .cloned()
                .collect();
            for key in stale {
                if let Some(entry) = state.remove(&key) {
                    tracing::debug!("Purging entity {}", key);
                    removal_candidates.extend(entry.current_pairs);
                    purged.push(key);
                }
            }
        }
    }

    // A pair some entity still holds keeps its line
    let held: BTreeSet<&Pair> = state.values().flat_map(|e| e.current_pairs.iter()).collect();
    edits.removals = removal_candidates
        .into_iter()
        .filter(|pair| !pair.is_unknown_host() && !held.contains(pair))
        .collect();

    // Names whose line is going away are offered to other entities that also claim them
    let retired: BTreeSet<&str> = edits.removals.iter().map(Pair::dns_name).collect();
    let handover: Vec<Pair> = state
        .values()
        .flat_map(|e| e.current_pairs.iter())
        .filter(|pair| retired.contains(pair.dns_name()))
        .cloned()
        .collect();
    for pair in handover {
        edits.push_addition(pair);
    }

    Reconciliation {
        changed: !updated.is_empty() || !purged.is_empty(),
        state,
        edits,
        updated,
        purged,
    }
}
