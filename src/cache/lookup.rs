use std::sync::Arc;

use http::{StatusCode, header};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::origin::ProxyRequest;

use super::entry::{CancelSignal, Entry, EntryStatus, clock_millis, content_hash};
use super::{CacheError, CacheState, key};

impl CacheState {
    /// The lookup/admission pipeline. Hit: count the access and hand out the
    /// pooled entry. Miss: install a placeholder so concurrent readers for
    /// the same key pile up on its ready signal instead of fetching, then
    /// fetch and admit in a detached task that survives caller cancellation.
    pub(super) async fn get(
        self: &Arc<Self>,
        request: &ProxyRequest,
        mut cancel: CancelSignal,
    ) -> Result<(Arc<Entry>, Option<StatusCode>), CacheError> {
        let key = key::derive(&self.config, request);

        let hit = { self.index.read().lookup_live(&key) };
        if let Some(entry) = hit {
            if !self.count_access(&entry, &mut cancel).await {
                return Err(CacheError::ReaderCancelled);
            }
            return Ok((entry, None));
        }

        // The gap between dropping the read lock and taking the write lock
        // is a legal window for another task to have installed a
        // placeholder; re-check before claiming the miss.
        let claimed = {
            let mut index = self.index.write();
            match index.lookup_live(&key) {
                Some(existing) => Err(existing),
                None => {
                    let placeholder = Entry::placeholder(key.clone());
                    index.insert(key.clone(), placeholder.clone());
                    Ok(placeholder)
                }
            }
        };
        let placeholder = match claimed {
            Err(existing) => {
                if !self.count_access(&existing, &mut cancel).await {
                    return Err(CacheError::ReaderCancelled);
                }
                return Ok((existing, None));
            }
            Ok(placeholder) => placeholder,
        };

        let (result_tx, result_rx) = oneshot::channel();
        let state = self.clone();
        let owned_request = request.clone();
        tokio::spawn(async move {
            let outcome = state.fetch_and_admit(placeholder, owned_request, key).await;
            let _ = result_tx.send(outcome);
        });

        tokio::select! {
            result = result_rx => result.map_err(|_| CacheError::ReaderCancelled),
            _ = cancel.cancelled() => Err(CacheError::ReaderCancelled),
        }
    }

    async fn fetch_and_admit(
        self: Arc<Self>,
        placeholder: Arc<Entry>,
        request: ProxyRequest,
        key: String,
    ) -> (Arc<Entry>, Option<StatusCode>) {
        let origin_status = self.fill_from_origin(&placeholder, &request).await;

        if placeholder.status() == EntryStatus::Invalid {
            {
                let mut index = self.index.write();
                index.remove_key_if(&key, &placeholder);
            }
            placeholder.fire_ready();
            return (placeholder, origin_status);
        }

        let served = self.admit(&placeholder);
        placeholder.fire_ready();
        (served, origin_status)
    }

    /// Performs the origin round-trip and fills the entry. Transport errors
    /// leave the body empty; a non-200 keeps its body for one in-band relay
    /// but the entry is `Invalid` either way and never admitted.
    pub(super) async fn fill_from_origin(
        &self,
        entry: &Arc<Entry>,
        request: &ProxyRequest,
    ) -> Option<StatusCode> {
        match self.origin.fetch(request).await {
            Err(err) => {
                warn!(
                    method = %request.method,
                    uri = %request.request_uri,
                    error = %err,
                    "caching target unreachable"
                );
                entry.set_status(EntryStatus::Invalid);
                None
            }
            Ok(mut response) => {
                response.headers.remove(header::SET_COOKIE);
                response.headers.remove(header::EXPIRES);
                entry.reset_access();
                if response.status == StatusCode::OK {
                    entry.set_status(EntryStatus::Fresh);
                    if self.config.cache_unique {
                        entry.set_hash(content_hash(&response.body));
                    }
                } else {
                    entry.set_status(EntryStatus::Invalid);
                }
                entry.fill(response.headers, response.body);
                Some(response.status)
            }
        }
    }

    /// Admission: account the bytes, wake the evictor when over budget, then
    /// either merge into an entry with the same content hash or protect the
    /// newcomer. Returns the entry that ends up serving the key.
    pub(super) fn admit(&self, entry: &Arc<Entry>) -> Arc<Entry> {
        let body_len = entry.body_len();
        let mut index = self.index.write();
        index.add_size(body_len);
        if index.size() > self.config.cache_size {
            self.wake_evictor();
        }

        if !self.config.cache_unique {
            drop(index);
            self.protection.lock().push(entry);
            return entry.clone();
        }

        let hash = match entry.hash() {
            Some(hash) => *hash,
            None => {
                drop(index);
                self.protection.lock().push(entry);
                return entry.clone();
            }
        };
        if let Some(existing) = index.lookup_hash(&hash) {
            if !Arc::ptr_eq(&existing, entry) {
                index.merge(entry, &existing);
                debug!(
                    key = %entry.first_key(),
                    into = %existing.first_key(),
                    "duplicate content, merged into existing entry"
                );
                // The existing entry is already protected or stale; no push.
                return existing;
            }
        }
        index.record_hash(hash, entry.clone());
        drop(index);
        self.protection.lock().push(entry);
        debug!(key = %entry.first_key(), bytes = body_len, "new cache entry added");
        entry.clone()
    }

    /// Counts one access once the entry settles. Inside the window the
    /// counter just increments; past it the count restarts and a no longer
    /// protected entry is put back under protection. Two concurrent
    /// reprotections may both enqueue the entry; the eviction worker skips
    /// the leftover reference by checking `status`. Returns false when the
    /// caller was cancelled while waiting.
    pub(super) async fn count_access(
        &self,
        entry: &Arc<Entry>,
        cancel: &mut CancelSignal,
    ) -> bool {
        if !entry.wait_ready(cancel).await {
            return false;
        }
        if entry.status() == EntryStatus::Invalid {
            return true;
        }

        let window = self.config.lfu_time.as_millis() as u64;
        let elapsed = clock_millis().saturating_sub(entry.protected_at());
        if elapsed <= window {
            entry.record_access();
            return true;
        }

        entry.reset_access();
        if entry.status() != EntryStatus::Protected {
            self.protection.lock().push(entry);
        }
        true
    }
}
