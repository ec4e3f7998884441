use std::collections::HashMap;

use parking_lot::RwLock;

use crate::flag::{FlagKey, FlagRecord, FlagSlot};

/// Outcome of a conditional put against the in-memory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    Conflict { current: Option<u64> },
}

/// In-memory authoritative cache of flag definitions, keyed by
/// [`FlagKey`] and versioned for optimistic concurrency.
///
/// Reads and writes never perform I/O and never suspend; the lock is
/// held only for the map operation itself. Tombstones stay in the map
/// so the per-key version counter survives deletion, but they are
/// invisible to `get` and `snapshot`.
#[derive(Default)]
pub struct FlagRegistry {
    slots: RwLock<HashMap<FlagKey, FlagSlot>>,
}

impl FlagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest locally-applied live record for a key. Tombstoned and
    /// unknown keys both read as `None`.
    pub fn get(&self, key: &FlagKey) -> Option<FlagRecord> {
        let slots = self.slots.read();
        slots.get(key).and_then(FlagSlot::live).cloned()
    }

    /// The raw slot, tombstones included.
    pub fn slot(&self, key: &FlagKey) -> Option<FlagSlot> {
        let slots = self.slots.read();
        slots.get(key).cloned()
    }

    /// Applies a mutation only if the current version for the key equals
    /// `expected`, the optimistic-concurrency primitive everything else
    /// builds on. `expected == None` means the key must be absent or
    /// tombstoned. Atomic with respect to concurrent `get` and
    /// `put_if_version` calls.
    pub fn put_if_version(&self, slot: FlagSlot, expected: Option<u64>) -> PutOutcome {
        let mut slots = self.slots.write();
        let current = slots.get(slot.key());

        let matches = match expected {
            Some(version) => current.map(FlagSlot::version) == Some(version),
            None => !matches!(current, Some(FlagSlot::Live(_))),
        };
        if !matches {
            return PutOutcome::Conflict {
                current: current.map(FlagSlot::version),
            };
        }

        slots.insert(slot.key().clone(), slot);
        PutOutcome::Applied
    }

    /// Folds an already-committed slot into the cache, last writer wins
    /// by version. Used for startup scans, feed catch-up and installing
    /// a slot that just won the storage-level race, where the local copy
    /// may be arbitrarily stale. Returns false if the cache already held
    /// this version or newer.
    pub fn apply_committed(&self, slot: FlagSlot) -> bool {
        let mut slots = self.slots.write();
        match slots.get(slot.key()) {
            Some(existing) if existing.version() >= slot.version() => false,
            _ => {
                slots.insert(slot.key().clone(), slot);
                true
            }
        }
    }

    /// Point-in-time view of all live records, ordered by environment
    /// then name. Concurrent puts are blocked only for the duration of
    /// the map copy.
    pub fn snapshot(&self) -> Vec<FlagRecord> {
        let mut records: Vec<FlagRecord> = {
            let slots = self.slots.read();
            slots.values().filter_map(FlagSlot::live).cloned().collect()
        };
        records.sort_by(|a, b| {
            (a.key.environment(), a.key.name()).cmp(&(b.key.environment(), b.key.name()))
        });
        records
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let slots = self.slots.read();
        slots.values().filter(|slot| slot.live().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::flag::{Rollout, Tombstone};

    fn key(name: &str) -> FlagKey {
        FlagKey::new(name, "prod").unwrap()
    }

    fn live(name: &str, version: u64) -> FlagSlot {
        FlagSlot::Live(FlagRecord {
            key: key(name),
            enabled: true,
            rollout: Rollout::FULL,
            version,
            updated_at: Utc::now(),
        })
    }

    fn tombstone(name: &str, version: u64) -> FlagSlot {
        FlagSlot::Tombstone(Tombstone {
            key: key(name),
            version,
            deleted_at: Utc::now(),
        })
    }

    #[test]
    fn put_then_get() {
        let registry = FlagRegistry::new();
        assert_eq!(
            registry.put_if_version(live("checkout_v2", 1), None),
            PutOutcome::Applied
        );
        assert_eq!(registry.get(&key("checkout_v2")).unwrap().version, 1);
    }

    #[test]
    fn stale_expected_version_is_rejected_without_mutating() {
        let registry = FlagRegistry::new();
        registry.put_if_version(live("checkout_v2", 1), None);
        registry.put_if_version(live("checkout_v2", 2), Some(1));

        let outcome = registry.put_if_version(live("checkout_v2", 3), Some(1));
        assert_eq!(outcome, PutOutcome::Conflict { current: Some(2) });
        assert_eq!(registry.get(&key("checkout_v2")).unwrap().version, 2);
    }

    #[test]
    fn none_expected_means_absent_or_tombstoned() {
        let registry = FlagRegistry::new();
        registry.put_if_version(live("checkout_v2", 1), None);

        // Live record blocks a second create.
        assert_eq!(
            registry.put_if_version(live("checkout_v2", 1), None),
            PutOutcome::Conflict { current: Some(1) }
        );

        // A tombstone does not.
        registry.put_if_version(tombstone("checkout_v2", 2), Some(1));
        assert_eq!(
            registry.put_if_version(live("checkout_v2", 3), None),
            PutOutcome::Applied
        );
    }

    #[test]
    fn tombstones_are_invisible_to_reads() {
        let registry = FlagRegistry::new();
        registry.put_if_version(live("checkout_v2", 1), None);
        registry.put_if_version(tombstone("checkout_v2", 2), Some(1));

        assert!(registry.get(&key("checkout_v2")).is_none());
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.slot(&key("checkout_v2")).unwrap().version(), 2);
    }

    #[test]
    fn apply_committed_is_last_writer_by_version() {
        let registry = FlagRegistry::new();
        assert!(registry.apply_committed(live("checkout_v2", 3)));
        assert!(!registry.apply_committed(live("checkout_v2", 2)));
        assert!(!registry.apply_committed(live("checkout_v2", 3)));
        assert!(registry.apply_committed(live("checkout_v2", 4)));
        assert_eq!(registry.get(&key("checkout_v2")).unwrap().version, 4);
    }

    #[test]
    fn snapshot_is_ordered_by_environment_then_name() {
        let registry = FlagRegistry::new();
        for (name, env) in [("b", "prod"), ("a", "staging"), ("a", "prod")] {
            registry.apply_committed(FlagSlot::Live(FlagRecord {
                key: FlagKey::new(name, env).unwrap(),
                enabled: false,
                rollout: Rollout::ZERO,
                version: 1,
                updated_at: Utc::now(),
            }));
        }
        let names: Vec<(String, String)> = registry
            .snapshot()
            .into_iter()
            .map(|r| (r.key.environment().to_string(), r.key.name().to_string()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("prod".into(), "a".into()),
                ("prod".into(), "b".into()),
                ("staging".into(), "a".into()),
            ]
        );
    }

    #[test]
    fn racing_writers_with_same_expected_version_produce_one_winner() {
        let registry = Arc::new(FlagRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry.put_if_version(live("checkout_v2", 1), None)
            }));
        }
        let outcomes: Vec<PutOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = outcomes
            .iter()
            .filter(|o| matches!(o, PutOutcome::Applied))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(registry.get(&key("checkout_v2")).unwrap().version, 1);
    }
}
