mod entry;
mod eviction;
mod key;
mod lookup;
mod maintenance;
mod pool;
mod protection;
mod refresh;

pub use entry::{CancelHandle, CancelSignal, Entry, EntryStatus};

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::origin::{OriginClient, ProxyRequest};
use crate::util::human_size;

use entry::clock_millis;
use eviction::EvictionList;
use pool::PoolIndex;
use protection::ProtectionList;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// High-water mark for the pool in bytes.
    pub cache_size: usize,
    /// Share one stored body between keys with byte-equal responses.
    pub cache_unique: bool,
    /// Split mobile user agents into their own keyspace.
    pub cache_mobile: bool,
    /// Prefix keys with the request method (non-GET caching).
    pub method_keyed: bool,
    /// Window within which accesses accumulate on the counter.
    pub lfu_time: Duration,
    /// Protection lifetime before an entry goes stale.
    pub protection_expire: Duration,
    /// Cadence of the staling worker.
    pub stale_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 1 << 30,
            cache_unique: false,
            cache_mobile: false,
            method_keyed: false,
            lfu_time: Duration::from_secs(1800),
            protection_expire: Duration::from_secs(1800),
            stale_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    /// The caller was cancelled while waiting for an in-flight fetch. The
    /// fetch itself keeps running.
    #[error("reader cancelled while waiting for cache entry")]
    ReaderCancelled,
}

/// Aggregate counters for the inspection surface.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: usize,
    pub keys: usize,
    pub hashes: usize,
    pub protecting: usize,
    pub evicting: usize,
}

#[derive(Debug, Clone)]
pub struct EntrySummary {
    pub key: String,
    pub size: usize,
    pub status: EntryStatus,
    pub access_count: u32,
}

#[derive(Debug, Clone)]
pub struct EntryDetail {
    pub size: usize,
    pub header_count: usize,
    pub status: EntryStatus,
    pub access_count: u32,
    pub hash: Option<String>,
    pub protected_age: Option<Duration>,
    pub keys: Vec<String>,
}

/// The cache engine. Cheap to clone; all clones share one pool and one pair
/// of background workers (staler and evictor).
#[derive(Clone)]
pub struct CachePool {
    state: Arc<CacheState>,
}

pub(crate) struct CacheState {
    config: CacheConfig,
    origin: Arc<dyn OriginClient>,
    // Lock order across these three is fixed: index → protection → eviction.
    index: RwLock<PoolIndex>,
    protection: Mutex<ProtectionList>,
    eviction: Mutex<EvictionList>,
    evictor_wake: mpsc::Sender<()>,
}

impl CachePool {
    pub fn new(config: CacheConfig, origin: Arc<dyn OriginClient>) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let state = Arc::new(CacheState {
            config,
            origin,
            index: RwLock::new(PoolIndex::default()),
            protection: Mutex::new(ProtectionList::default()),
            eviction: Mutex::new(EvictionList::default()),
            evictor_wake: wake_tx,
        });
        maintenance::spawn_workers(state.clone(), wake_rx);
        Self { state }
    }

    /// Serves a request from the pool, fetching from the origin on a miss.
    /// The second element carries the in-band origin status when an origin
    /// round-trip happened on this call, `None` on a pure hit.
    pub async fn get(
        &self,
        request: &ProxyRequest,
        cancel: CancelSignal,
    ) -> Result<(Arc<Entry>, Option<StatusCode>), CacheError> {
        self.state.get(request, cancel).await
    }

    /// Force-fetches from the origin and updates the pooled entry in place.
    pub async fn refresh(&self, request: &ProxyRequest) -> (Arc<Entry>, Option<StatusCode>) {
        self.state.refresh(request).await
    }

    pub fn stats(&self) -> PoolStats {
        let index = self.state.index.read();
        let protection = self.state.protection.lock();
        let eviction = self.state.eviction.lock();
        PoolStats {
            size: index.size(),
            keys: index.key_count(),
            hashes: index.hash_count(),
            protecting: protection.len(),
            evicting: eviction.len(),
        }
    }

    /// One line of basic info per pooled key.
    pub fn list(&self) -> Vec<EntrySummary> {
        let index = self.state.index.read();
        let mut summaries: Vec<EntrySummary> = index
            .iter_keys()
            .map(|(key, entry)| EntrySummary {
                key: key.clone(),
                size: entry.body_len(),
                status: entry.status(),
                access_count: entry.access_count(),
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    pub fn show(&self, key: &str) -> Option<EntryDetail> {
        let entry = self.state.index.read().lookup(key)?;
        let protected_at = entry.protected_at();
        let protected_age = if protected_at == 0 {
            None
        } else {
            Some(Duration::from_millis(
                clock_millis().saturating_sub(protected_at),
            ))
        };
        Some(EntryDetail {
            size: entry.body_len(),
            header_count: entry.header_count(),
            status: entry.status(),
            access_count: entry.access_count(),
            hash: entry.hash().map(hex_string),
            protected_age,
            keys: entry.keys(),
        })
    }
}

impl CacheState {
    /// Non-blocking evictor wake; pending wakes collapse into the single
    /// channel slot.
    pub(crate) fn wake_evictor(&self) {
        let _ = self.evictor_wake.try_send(());
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pool size:\t{}", human_size(self.size))?;
        writeln!(f, "Keys:\t{}", self.keys)?;
        writeln!(f, "Hashes:\t{}", self.hashes)?;
        writeln!(f, "Protecting:\t{}", self.protecting)?;
        writeln!(f, "Evicting:\t{}", self.evicting)
    }
}

fn hex_string(hash: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
