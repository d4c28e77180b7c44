//! Per-room presence table.
//!
//! Presence blobs (cursor, display name, color) are opaque. Each awareness
//! client id carries a monotonic clock; an entry is accepted only if its
//! clock is strictly greater than the last one seen for that id, so stale or
//! reordered presence updates are dropped silently.
//!
//! Clocks outlive the states they belong to: after a tombstone, a late update
//! carrying an older clock is still rejected.

use std::collections::HashMap;

use crate::protocol::{AwarenessEntry, AwarenessUpdate};

/// Presence state of one awareness client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessRecord {
    pub clock: u64,
    pub state: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct AwarenessTable {
    /// Live presence, by awareness client id
    states: HashMap<u64, Vec<u8>>,
    /// Highest accepted clock per id, including removed ones
    clocks: HashMap<u64, u64>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every entry whose clock is newer than the stored one.
    ///
    /// Returns only the accepted entries, in their original order; an empty
    /// result means nothing should be rebroadcast.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> AwarenessUpdate {
        let mut accepted = Vec::with_capacity(update.entries.len());

        for entry in &update.entries {
            if let Some(&stored) = self.clocks.get(&entry.client_id) {
                if entry.clock <= stored {
                    log::trace!(
                        "Dropping stale awareness for {} (clock {} <= {stored})",
                        entry.client_id,
                        entry.clock
                    );
                    continue;
                }
            }

            self.clocks.insert(entry.client_id, entry.clock);
            match &entry.state {
                Some(state) => {
                    self.states.insert(entry.client_id, state.clone());
                }
                None => {
                    self.states.remove(&entry.client_id);
                }
            }
            accepted.push(entry.clone());
        }

        AwarenessUpdate::new(accepted)
    }

    /// Remove the given ids and return their tombstones (clock bumped by one).
    ///
    /// Ids that were already removed or never seen produce no tombstone.
    pub fn remove<'a>(&mut self, client_ids: impl IntoIterator<Item = &'a u64>) -> AwarenessUpdate {
        let mut tombstones = Vec::new();

        for &client_id in client_ids {
            if self.states.remove(&client_id).is_none() {
                continue;
            }
            let clock = self.clocks.get(&client_id).map_or(1, |c| c + 1);
            self.clocks.insert(client_id, clock);
            tombstones.push(AwarenessEntry::tombstone(client_id, clock));
        }

        tombstones.sort_by_key(|e| e.client_id);
        AwarenessUpdate::new(tombstones)
    }

    /// Every live entry, ordered by client id.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .states
            .iter()
            .map(|(&client_id, state)| AwarenessEntry {
                client_id,
                clock: self.clocks.get(&client_id).copied().unwrap_or_default(),
                state: Some(state.clone()),
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        AwarenessUpdate::new(entries)
    }

    pub fn get(&self, client_id: u64) -> Option<AwarenessRecord> {
        let state = self.states.get(&client_id)?;
        Some(AwarenessRecord {
            clock: self.clocks.get(&client_id).copied().unwrap_or_default(),
            state: state.clone(),
        })
    }

    /// Last accepted clock for `client_id`, live or removed.
    pub fn clock(&self, client_id: u64) -> Option<u64> {
        self.clocks.get(&client_id).copied()
    }

    /// Number of live presence entries.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(entries: Vec<AwarenessEntry>) -> AwarenessUpdate {
        AwarenessUpdate::new(entries)
    }

    #[test]
    fn test_newer_clock_replaces() {
        let mut table = AwarenessTable::new();
        let first = table.apply(&update(vec![AwarenessEntry::new(1, 1, b"a".to_vec())]));
        assert_eq!(first.entries.len(), 1);

        let second = table.apply(&update(vec![AwarenessEntry::new(1, 2, b"b".to_vec())]));
        assert_eq!(second.entries.len(), 1);
        assert_eq!(
            table.get(1),
            Some(AwarenessRecord {
                clock: 2,
                state: b"b".to_vec()
            })
        );
    }

    #[test]
    fn test_stale_and_equal_clock_dropped() {
        let mut table = AwarenessTable::new();
        table.apply(&update(vec![AwarenessEntry::new(1, 5, b"fresh".to_vec())]));

        let equal = table.apply(&update(vec![AwarenessEntry::new(1, 5, b"dup".to_vec())]));
        assert!(equal.is_empty());
        let older = table.apply(&update(vec![AwarenessEntry::new(1, 4, b"old".to_vec())]));
        assert!(older.is_empty());

        assert_eq!(table.get(1).unwrap().state, b"fresh".to_vec());
    }

    #[test]
    fn test_mixed_batch_keeps_only_accepted() {
        let mut table = AwarenessTable::new();
        table.apply(&update(vec![AwarenessEntry::new(1, 3, b"x".to_vec())]));

        let accepted = table.apply(&update(vec![
            AwarenessEntry::new(1, 2, b"stale".to_vec()),
            AwarenessEntry::new(2, 1, b"new".to_vec()),
        ]));
        assert_eq!(accepted.entries, vec![AwarenessEntry::new(2, 1, b"new".to_vec())]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_client_tombstone_removes_state() {
        let mut table = AwarenessTable::new();
        table.apply(&update(vec![AwarenessEntry::new(1, 1, b"x".to_vec())]));
        let accepted = table.apply(&update(vec![AwarenessEntry::tombstone(1, 2)]));
        assert_eq!(accepted.entries.len(), 1);
        assert!(table.get(1).is_none());
        assert_eq!(table.clock(1), Some(2));

        // A delayed update from before the removal stays rejected
        let late = table.apply(&update(vec![AwarenessEntry::new(1, 2, b"late".to_vec())]));
        assert!(late.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_emits_bumped_tombstones() {
        let mut table = AwarenessTable::new();
        table.apply(&update(vec![
            AwarenessEntry::new(10, 4, b"a".to_vec()),
            AwarenessEntry::new(11, 9, b"b".to_vec()),
        ]));

        let tombstones = table.remove(&[11, 10, 99]);
        assert_eq!(
            tombstones.entries,
            vec![AwarenessEntry::tombstone(10, 5), AwarenessEntry::tombstone(11, 10)]
        );
        assert!(table.is_empty());

        // Removing twice yields nothing new
        assert!(table.remove(&[10]).is_empty());
    }

    #[test]
    fn test_snapshot_sorted_live_entries() {
        let mut table = AwarenessTable::new();
        table.apply(&update(vec![
            AwarenessEntry::new(3, 1, b"c".to_vec()),
            AwarenessEntry::new(1, 7, b"a".to_vec()),
            AwarenessEntry::tombstone(2, 1),
        ]));

        let snapshot = table.snapshot();
        assert_eq!(
            snapshot.entries,
            vec![
                AwarenessEntry::new(1, 7, b"a".to_vec()),
                AwarenessEntry::new(3, 1, b"c".to_vec()),
            ]
        );
    }
}
