use std::sync::Arc;

use super::entry::{Entry, EntryStatus};

/// Unordered set of stale eviction candidates, sorted on demand so victims
/// sit at the tail. May contain tombstones: references to entries that were
/// reprotected after being listed; the eviction worker skips those by
/// checking `status`.
#[derive(Default)]
pub(super) struct EvictionList {
    entries: Vec<Arc<Entry>>,
}

/// The victim ranking: an entry is a better eviction candidate the larger it
/// is and the less it is accessed. Sorting ascending by this burden puts the
/// strongest keeps first and the victim last.
fn burden(entry: &Entry) -> i64 {
    entry.body_len() as i64 - entry.access_count() as i64
}

impl EvictionList {
    pub(super) fn append(&mut self, entry: Arc<Entry>) {
        self.entries.push(entry);
    }

    pub(super) fn pop_back(&mut self) -> Option<Arc<Entry>> {
        self.entries.pop()
    }

    pub(super) fn sort_by_victim_score(&mut self) {
        self.entries.sort_unstable_by_key(|entry| burden(entry));
    }

    /// Bytes the list can currently contribute toward an eviction goal;
    /// tombstones carry no weight.
    pub(super) fn stale_bytes(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status() == EntryStatus::Stale)
            .map(|entry| entry.body_len())
            .sum()
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}
