use std::sync::Arc;

use http::StatusCode;
use tokio::sync::oneshot;
use tracing::debug;

use crate::origin::ProxyRequest;

use super::entry::{CancelSignal, Entry, EntryStatus};
use super::{CacheState, key};

impl CacheState {
    /// Force-fetches the key and updates the pooled entry in place. Runs in
    /// a detached task: once the pooled entry's ready signal has been
    /// swapped out, abandoning the work would leave readers blocked forever.
    pub(super) async fn refresh(
        self: &Arc<Self>,
        request: &ProxyRequest,
    ) -> (Arc<Entry>, Option<StatusCode>) {
        let key = key::derive(&self.config, request);
        let (result_tx, result_rx) = oneshot::channel();
        let state = self.clone();
        let owned_request = request.clone();
        let owned_key = key.clone();
        tokio::spawn(async move {
            let outcome = state.refresh_inner(owned_request, owned_key).await;
            let _ = result_tx.send(outcome);
        });
        match result_rx.await {
            Ok(outcome) => outcome,
            // The refresh task died; report an invalid scratch entry so the
            // caller can answer 404 without touching the pool.
            Err(_) => {
                let scratch = Entry::placeholder(key);
                scratch.set_status(EntryStatus::Invalid);
                scratch.fire_ready();
                (scratch, None)
            }
        }
    }

    async fn refresh_inner(
        self: Arc<Self>,
        request: ProxyRequest,
        key: String,
    ) -> (Arc<Entry>, Option<StatusCode>) {
        // Fetch into a scratch entry first; the pooled one is referenced all
        // over and must not be touched until the new artifact is complete.
        let scratch = Entry::placeholder(key.clone());
        let origin_status = self.fill_from_origin(&scratch, &request).await;
        if scratch.status() == EntryStatus::Invalid {
            scratch.fire_ready();
            return (scratch, origin_status);
        }

        let existing = {
            let mut index = self.index.write();
            match index.lookup_live(&key) {
                Some(entry) => Some(entry),
                None => {
                    index.insert(key.clone(), scratch.clone());
                    None
                }
            }
        };

        let Some(entry) = existing else {
            let served = self.admit(&scratch);
            scratch.fire_ready();
            debug!(key = %key, "refresh installed a new entry");
            return (served, origin_status);
        };

        // Wait out any other in-flight update, then make new readers wait on
        // the swap: the unfired signal is the write barrier for the payload.
        let mut never = CancelSignal::never();
        entry.wait_ready(&mut never).await;
        entry.rearm_ready();

        let (new_headers, new_body) = scratch.snapshot();
        {
            let mut index = self.index.write();
            // Only entries whose bytes were accepted into the pool total are
            // re-accounted; the evictor holds the pool lock while destroying
            // entries, so this cannot race a concurrent removal.
            if matches!(
                entry.status(),
                EntryStatus::Protected | EntryStatus::Stale
            ) {
                let old_len = entry.body_len() as i64;
                index.adjust_size(new_body.len() as i64 - old_len);
            }
        }
        // The content hash deliberately stays untouched: re-keying the hash
        // map could orphan other keys sharing this entry.
        entry.fill(new_headers, new_body);
        entry.fire_ready();
        debug!(key = %key, "refreshed cache entry in place");
        (entry, origin_status)
    }
}
