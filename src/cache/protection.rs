use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use super::entry::{Entry, EntryStatus, clock_millis};
use super::eviction::EvictionList;

/// FIFO of entries shielded from eviction. Fresh admissions and reprotected
/// entries are appended; pushes stamp `protected_at`, so the queue stays
/// ordered by protection time and draining from the head visits the oldest
/// first.
#[derive(Default)]
pub(super) struct ProtectionList {
    queue: VecDeque<Arc<Entry>>,
}

impl ProtectionList {
    pub(super) fn push(&mut self, entry: &Arc<Entry>) {
        entry.set_protected_at(clock_millis());
        entry.set_status(EntryStatus::Protected);
        self.queue.push_back(entry.clone());
    }

    /// Pops entries from the head while the predicate holds, marking each
    /// `Stale` and handing it to the eviction list.
    pub(super) fn drain_while(
        &mut self,
        mut predicate: impl FnMut(&Arc<Entry>) -> bool,
        eviction: &mut EvictionList,
    ) {
        while self.queue.front().map_or(false, |head| predicate(head)) {
            if let Some(entry) = self.queue.pop_front() {
                entry.set_status(EntryStatus::Stale);
                trace!(key = %entry.first_key(), "protection expired, entry now evictable");
                eviction.append(entry);
            }
        }
    }

    pub(super) fn len(&self) -> usize {
        self.queue.len()
    }
}
