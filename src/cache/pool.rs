use std::collections::HashMap;
use std::sync::Arc;

use super::entry::{ContentHash, Entry, EntryStatus};

/// The pool index: key → entry, content-hash → entry (dedup mode), and the
/// aggregate byte total over distinct entries. All mutation happens under
/// the pool write lock held by the caller.
#[derive(Default)]
pub(super) struct PoolIndex {
    entries: HashMap<String, Arc<Entry>>,
    hashes: HashMap<ContentHash, Arc<Entry>>,
    size: usize,
}

impl PoolIndex {
    pub(super) fn lookup(&self, key: &str) -> Option<Arc<Entry>> {
        self.entries.get(key).cloned()
    }

    /// Lookup that treats `Invalid` leftovers as absent; such a slot is fair
    /// game for a retrying placeholder.
    pub(super) fn lookup_live(&self, key: &str) -> Option<Arc<Entry>> {
        self.entries
            .get(key)
            .filter(|entry| entry.status() != EntryStatus::Invalid)
            .cloned()
    }

    pub(super) fn insert(&mut self, key: String, entry: Arc<Entry>) {
        self.entries.insert(key, entry);
    }

    /// Removes `key` only while it still maps to `entry`. A slot taken over
    /// by a retrying placeholder or rewired by a dedup merge is left alone.
    pub(super) fn remove_key_if(&mut self, key: &str, entry: &Arc<Entry>) -> bool {
        match self.entries.get(key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(super) fn lookup_hash(&self, hash: &ContentHash) -> Option<Arc<Entry>> {
        self.hashes.get(hash).cloned()
    }

    pub(super) fn record_hash(&mut self, hash: ContentHash, entry: Arc<Entry>) {
        self.hashes.insert(hash, entry);
    }

    pub(super) fn remove_hash_if(&mut self, hash: &ContentHash, entry: &Arc<Entry>) -> bool {
        match self.hashes.get(hash) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                self.hashes.remove(hash);
                true
            }
            _ => false,
        }
    }

    /// Dedup merge: rewires the placeholder's key to the already-pooled
    /// entry carrying the same content hash and reverses the placeholder's
    /// provisional byte accounting. The placeholder itself is dropped by the
    /// caller.
    pub(super) fn merge(&mut self, placeholder: &Arc<Entry>, existing: &Arc<Entry>) {
        let key = placeholder.first_key();
        existing.push_key(key.clone());
        self.entries.insert(key, existing.clone());
        self.sub_size(placeholder.body_len());
    }

    pub(super) fn size(&self) -> usize {
        self.size
    }

    pub(super) fn add_size(&mut self, bytes: usize) {
        self.size = self.size.saturating_add(bytes);
    }

    pub(super) fn sub_size(&mut self, bytes: usize) {
        self.size = self.size.saturating_sub(bytes);
    }

    pub(super) fn adjust_size(&mut self, delta: i64) {
        if delta >= 0 {
            self.add_size(delta as usize);
        } else {
            self.sub_size(delta.unsigned_abs() as usize);
        }
    }

    pub(super) fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn hash_count(&self) -> usize {
        self.hashes.len()
    }

    pub(super) fn iter_keys(&self) -> impl Iterator<Item = (&String, &Arc<Entry>)> {
        self.entries.iter()
    }
}
