//! In-memory batch of deltas awaiting persistence.
//!
//! Deltas enqueued within one debounce window collect here. Deltas for the
//! same `(user, entity type, entity id)` coalesce with [`merge_deltas`] as they
//! arrive, so a flush writes at most one delta per entity.

use crate::{merge::merge_deltas, SyncDelta, UserId};

/// A delta together with the user it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub user_id: UserId,
    pub delta: SyncDelta,
}

impl BatchEntry {
    fn same_key(&self, user_id: &str, delta: &SyncDelta) -> bool {
        self.user_id == user_id && self.delta.same_entity(delta)
    }
}

/// Coalescing buffer of pending deltas, in first-arrival order.
#[derive(Debug, Clone, Default)]
pub struct DeltaBatch {
    entries: Vec<BatchEntry>,
}

impl DeltaBatch {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a delta, merging it into an existing entry for the same entity.
    ///
    /// Returns `true` when the delta was coalesced.
    pub fn push(&mut self, user_id: impl Into<UserId>, delta: SyncDelta) -> bool {
        let user_id = user_id.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.same_key(&user_id, &delta))
        {
            if let Ok(merged) = merge_deltas(&entry.delta, &delta) {
                entry.delta = merged;
                return true;
            }
        }
        self.entries.push(BatchEntry { user_id, delta });
        false
    }

    /// Number of distinct entities buffered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Remove and return every buffered entry.
    pub fn take(&mut self) -> Vec<BatchEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Put entries from a failed flush back ahead of anything buffered since.
    pub fn restore(&mut self, entries: Vec<BatchEntry>) {
        let newer = self.take();
        for entry in entries.into_iter().chain(newer) {
            self.push(entry.user_id, entry.delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityType, HlcTimestamp, Operation, Payload};
    use serde_json::json;

    fn update(id: &str, entity_id: &str, key: &str, value: i64, wall: u64) -> SyncDelta {
        SyncDelta::new(
            id,
            EntityType::Progress,
            entity_id,
            Operation::Update,
            Payload::new().with(key, value),
            HlcTimestamp::new(wall, 0, "device-1"),
        )
    }

    #[test]
    fn same_entity_coalesces() {
        let mut batch = DeltaBatch::new();
        assert!(!batch.push("user-1", update("d-1", "p-1", "a", 1, 1000)));
        assert!(batch.push("user-1", update("d-2", "p-1", "b", 2, 2000)));

        assert_eq!(batch.len(), 1);
        let entry = &batch.entries()[0];
        assert_eq!(entry.delta.id, "d-2");
        assert_eq!(entry.delta.payload.get("a"), Some(&json!(1)));
        assert_eq!(entry.delta.payload.get("b"), Some(&json!(2)));
    }

    #[test]
    fn different_users_do_not_coalesce() {
        let mut batch = DeltaBatch::new();
        batch.push("user-1", update("d-1", "p-1", "a", 1, 1000));
        batch.push("user-2", update("d-2", "p-1", "a", 2, 2000));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn different_entities_keep_arrival_order() {
        let mut batch = DeltaBatch::new();
        batch.push("user-1", update("d-1", "p-2", "a", 1, 1000));
        batch.push("user-1", update("d-2", "p-1", "a", 1, 1001));

        let ids: Vec<_> = batch.entries().iter().map(|e| e.delta.id.as_str()).collect();
        assert_eq!(ids, vec!["d-1", "d-2"]);
    }

    #[test]
    fn take_empties_the_batch() {
        let mut batch = DeltaBatch::new();
        batch.push("user-1", update("d-1", "p-1", "a", 1, 1000));
        let taken = batch.take();
        assert_eq!(taken.len(), 1);
        assert!(batch.is_empty());
        assert!(batch.take().is_empty());
    }

    #[test]
    fn restore_puts_failed_entries_first_and_recoalesces() {
        let mut batch = DeltaBatch::new();
        batch.push("user-1", update("d-1", "p-1", "a", 1, 1000));
        batch.push("user-1", update("d-2", "p-2", "a", 1, 1001));
        let failed = batch.take();

        batch.push("user-1", update("d-3", "p-1", "b", 2, 3000));
        batch.restore(failed);

        assert_eq!(batch.len(), 2);
        let first = &batch.entries()[0].delta;
        assert_eq!(first.entity_id, "p-1");
        assert_eq!(first.id, "d-3");
        assert_eq!(first.payload.len(), 2);
    }
}
