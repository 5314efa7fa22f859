use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::CacheState;
use super::entry::{EntryStatus, clock_millis};

pub(super) fn spawn_workers(state: Arc<CacheState>, wake_rx: mpsc::Receiver<()>) {
    tokio::spawn(stale_loop(state.clone()));
    tokio::spawn(evict_loop(state, wake_rx));
}

/// The staling worker: periodically migrates entries whose protection timer
/// elapsed from the protection FIFO into the eviction list.
async fn stale_loop(state: Arc<CacheState>) {
    let mut ticker = tokio::time::interval(state.config.stale_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        state.stale_pass();
    }
}

/// The eviction worker: waits for a wake and shrinks the pool back under the
/// low-water mark. Wakes that arrive mid-pass collapse into at most one
/// follow-up pass.
async fn evict_loop(state: Arc<CacheState>, mut wake_rx: mpsc::Receiver<()>) {
    while wake_rx.recv().await.is_some() {
        state.evict_pass();
    }
}

impl CacheState {
    pub(super) fn stale_pass(&self) {
        let expire = self.config.protection_expire.as_millis() as u64;
        let now = clock_millis();
        let mut protection = self.protection.lock();
        let mut eviction = self.eviction.lock();
        protection.drain_while(
            |entry| now.saturating_sub(entry.protected_at()) > expire,
            &mut eviction,
        );
    }

    pub(super) fn evict_pass(&self) {
        let mut index = self.index.write();
        let mut protection = self.protection.lock();
        let mut eviction = self.eviction.lock();

        // Targeting 3/4 of the budget amortises eviction over many inserts.
        let goal = self.config.cache_size.saturating_mul(3) / 4;
        if index.size() <= goal {
            return;
        }

        // When the stale candidates cannot cover the deficit, force-drain
        // the oldest protections ahead of schedule so the pass can always
        // reach the goal, even on a freshly populated pool.
        let deficit = index.size() - goal;
        if eviction.stale_bytes() < deficit {
            let mut quota = deficit as i64;
            protection.drain_while(
                |entry| {
                    if quota <= 0 {
                        return false;
                    }
                    quota -= entry.body_len() as i64;
                    true
                },
                &mut eviction,
            );
        }

        eviction.sort_by_victim_score();
        while index.size() > goal {
            let Some(victim) = eviction.pop_back() else {
                break;
            };
            if victim.status() == EntryStatus::Protected {
                // Reprotected after being listed; it lives in the protection
                // list now. Drop the tombstone.
                continue;
            }
            let mut unlinked = false;
            for key in victim.keys() {
                unlinked |= index.remove_key_if(&key, &victim);
            }
            if let Some(hash) = victim.hash() {
                unlinked |= index.remove_hash_if(hash, &victim);
            }
            // A duplicate list reference whose entry was already destroyed
            // holds no pool bytes; only subtract for a real removal.
            if unlinked {
                index.sub_size(victim.body_len());
                debug!(
                    key = %victim.first_key(),
                    bytes = victim.body_len(),
                    accesses = victim.access_count(),
                    "evicting cache entry"
                );
            }
        }
    }
}
