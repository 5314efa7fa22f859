use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use http::HeaderMap;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

/// Process-wide anchor for the millisecond clock stamped into entries.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

pub(crate) fn clock_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// 128-bit truncation of a BLAKE3 digest; identifies response bodies in
/// dedup mode.
pub(crate) type ContentHash = [u8; 16];

pub(crate) fn content_hash(body: &[u8]) -> ContentHash {
    let digest = blake3::hash(body);
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest.as_bytes()[..16]);
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryStatus {
    /// Born, origin fetch not settled yet.
    Pending = 0,
    /// Fetch succeeded, admission in progress.
    Fresh = 1,
    /// Linked in the protection list, shielded from eviction.
    Protected = 2,
    /// Protection window elapsed; evictable.
    Stale = 3,
    /// Fetch failed or entry rejected; terminal.
    Invalid = 4,
}

impl EntryStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EntryStatus::Fresh,
            2 => EntryStatus::Protected,
            3 => EntryStatus::Stale,
            4 => EntryStatus::Invalid,
            _ => EntryStatus::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Fresh => "fresh",
            EntryStatus::Protected => "protected",
            EntryStatus::Stale => "stale",
            EntryStatus::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Default)]
struct Payload {
    headers: HeaderMap,
    body: Bytes,
}

/// Fire-once broadcast. Late subscribers observe the fired state
/// immediately; the refresh pipeline re-arms an entry by swapping in a fresh
/// signal after the previous one fired.
struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    fn fire(&self) {
        let _ = self.tx.send(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Token observed by readers waiting on an in-flight fetch. The cache only
/// honours it inside `count_access`; fetches and admissions always run to
/// completion.
#[derive(Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires; used by callers that cannot observe their
    /// client going away.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub(crate) async fn cancelled(&mut self) {
        match &mut self.rx {
            None => std::future::pending::<()>().await,
            // A dropped handle counts as cancellation.
            Some(rx) => {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
        }
    }
}

/// Fires the paired `CancelSignal`. Dropping the handle cancels too.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// One cached response artifact. Owned by the pool; the protection and
/// eviction lists and request handlers hold shared references that are
/// validated through `status` at use time.
pub struct Entry {
    keys: Mutex<Vec<String>>,
    payload: RwLock<Payload>,
    status: AtomicU8,
    // Approximate by contract: written without synchronization beyond the
    // atomic itself, lost updates accepted.
    access_count: AtomicU32,
    // Millis since EPOCH; 0 = never protected. Doubles as the anchor of the
    // access-count window.
    protected_at: AtomicU64,
    content_hash: OnceCell<ContentHash>,
    ready: Mutex<ReadySignal>,
}

impl Entry {
    pub(crate) fn placeholder(key: String) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(vec![key]),
            payload: RwLock::new(Payload::default()),
            status: AtomicU8::new(EntryStatus::Pending as u8),
            access_count: AtomicU32::new(0),
            protected_at: AtomicU64::new(0),
            content_hash: OnceCell::new(),
            ready: Mutex::new(ReadySignal::new()),
        })
    }

    pub fn status(&self) -> EntryStatus {
        EntryStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub(crate) fn set_status(&self, status: EntryStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_access(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_access(&self) {
        self.access_count.store(1, Ordering::Relaxed);
    }

    /// Millis since the process clock anchor at which the entry last entered
    /// protection; 0 when it never has.
    pub fn protected_at(&self) -> u64 {
        self.protected_at.load(Ordering::Relaxed)
    }

    pub(crate) fn set_protected_at(&self, millis: u64) {
        self.protected_at.store(millis, Ordering::Relaxed);
    }

    pub(crate) fn hash(&self) -> Option<&ContentHash> {
        self.content_hash.get()
    }

    pub(crate) fn set_hash(&self, hash: ContentHash) {
        let _ = self.content_hash.set(hash);
    }

    pub fn body_len(&self) -> usize {
        self.payload.read().body.len()
    }

    pub fn header_count(&self) -> usize {
        self.payload.read().headers.len()
    }

    /// A consistent view of the response artifact. Only meaningful after
    /// `ready` has been observed.
    pub fn snapshot(&self) -> (HeaderMap, Bytes) {
        let payload = self.payload.read();
        (payload.headers.clone(), payload.body.clone())
    }

    pub(crate) fn fill(&self, headers: HeaderMap, body: Bytes) {
        let mut payload = self.payload.write();
        payload.headers = headers;
        payload.body = body;
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().clone()
    }

    pub fn first_key(&self) -> String {
        self.keys.lock().first().cloned().unwrap_or_default()
    }

    pub(crate) fn push_key(&self, key: String) {
        self.keys.lock().push(key);
    }

    pub(crate) fn fire_ready(&self) {
        self.ready.lock().fire();
    }

    /// Swaps in an unfired signal so new readers block until the next
    /// `fire_ready`. Must only be called after the previous signal fired.
    pub(crate) fn rearm_ready(&self) {
        *self.ready.lock() = ReadySignal::new();
    }

    /// Blocks until the entry's fetch settles or the caller is cancelled.
    /// Returns false on cancellation; the caller must not touch the entry
    /// afterwards.
    pub(crate) async fn wait_ready(&self, cancel: &mut CancelSignal) -> bool {
        let mut rx = self.ready.lock().subscribe();
        tokio::select! {
            result = rx.wait_for(|fired| *fired) => {
                let _ = result;
                true
            }
            _ = cancel.cancelled() => false,
        }
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("keys", &self.keys())
            .field("status", &self.status())
            .field("access_count", &self.access_count())
            .field("body_len", &self.body_len())
            .finish()
    }
}
