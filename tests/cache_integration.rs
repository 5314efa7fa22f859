use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;

use memgate::cache::{CacheConfig, CachePool, CancelHandle, CancelSignal, EntryStatus};
use memgate::origin::{OriginClient, OriginResponse, ProxyRequest};

/// Origin stand-in with canned responses, per-path hit counters, and an
/// optional artificial latency.
#[derive(Default)]
struct ScriptedOrigin {
    responses: Mutex<HashMap<String, (StatusCode, Bytes)>>,
    hits: Mutex<HashMap<String, usize>>,
    total_hits: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedOrigin {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    fn respond(&self, path: &str, status: StatusCode, body: &'static [u8]) {
        self.responses
            .lock()
            .insert(path.to_string(), (status, Bytes::from_static(body)));
    }

    fn hits_for(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }

    fn total(&self) -> usize {
        self.total_hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginClient for ScriptedOrigin {
    async fn fetch(&self, request: &ProxyRequest) -> Result<OriginResponse> {
        self.total_hits.fetch_add(1, Ordering::SeqCst);
        *self
            .hits
            .lock()
            .entry(request.request_uri.clone())
            .or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.responses.lock().get(&request.request_uri).cloned();
        match scripted {
            Some((status, body)) => Ok(OriginResponse {
                status,
                headers: HeaderMap::new(),
                body,
            }),
            None => Err(anyhow!("origin has no script for {}", request.request_uri)),
        }
    }
}

fn fast_config() -> CacheConfig {
    CacheConfig {
        lfu_time: Duration::from_millis(50),
        protection_expire: Duration::from_millis(50),
        stale_interval: Duration::from_millis(25),
        ..CacheConfig::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn miss_then_hit_is_deterministic() {
    let origin = ScriptedOrigin::new();
    origin.respond("/a", StatusCode::OK, b"hello");
    let cache = CachePool::new(CacheConfig::default(), origin.clone());

    let request = ProxyRequest::get("/a");
    let (entry, origin_status) = cache
        .get(&request, CancelSignal::never())
        .await
        .expect("miss");
    assert_eq!(origin_status, Some(StatusCode::OK));
    assert_eq!(entry.status(), EntryStatus::Protected);
    assert_eq!(entry.access_count(), 1);
    let (_, body) = entry.snapshot();
    assert_eq!(&body[..], b"hello");

    let stats = cache.stats();
    assert_eq!(stats.size, 5);
    assert_eq!(stats.keys, 1);
    assert_eq!(stats.protecting, 1);

    let (again, origin_status) = cache
        .get(&request, CancelSignal::never())
        .await
        .expect("hit");
    assert!(origin_status.is_none(), "a hit makes no origin call");
    assert!(Arc::ptr_eq(&entry, &again));
    let (_, body) = again.snapshot();
    assert_eq!(&body[..], b"hello");
    assert_eq!(origin.hits_for("/a"), 1);
    assert_eq!(again.access_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_flight_under_concurrency() {
    let origin = ScriptedOrigin::with_delay(Duration::from_millis(50));
    origin.respond("/hot", StatusCode::OK, b"payload");
    let cache = CachePool::new(CacheConfig::default(), origin.clone());

    let mut tasks = Vec::new();
    for _ in 0..200 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let request = ProxyRequest::get("/hot");
            let (entry, _) = cache
                .get(&request, CancelSignal::never())
                .await
                .expect("get");
            let (_, body) = entry.snapshot();
            body
        }));
    }
    for task in tasks {
        let body = task.await.expect("join");
        assert_eq!(&body[..], b"payload");
    }
    assert_eq!(origin.hits_for("/hot"), 1, "one origin call for 200 readers");

    let (entry, _) = cache
        .get(&ProxyRequest::get("/hot"), CancelSignal::never())
        .await
        .expect("hit");
    assert!(entry.access_count() >= 1);
}

#[tokio::test]
async fn dedup_collapses_equal_bodies() {
    let origin = ScriptedOrigin::new();
    origin.respond("/d1", StatusCode::OK, b"xyz");
    origin.respond("/d2", StatusCode::OK, b"xyz");
    let config = CacheConfig {
        cache_unique: true,
        ..CacheConfig::default()
    };
    let cache = CachePool::new(config, origin.clone());

    let (first, _) = cache
        .get(&ProxyRequest::get("/d1"), CancelSignal::never())
        .await
        .expect("get /d1");
    let (second, _) = cache
        .get(&ProxyRequest::get("/d2"), CancelSignal::never())
        .await
        .expect("get /d2");

    assert!(
        Arc::ptr_eq(&first, &second),
        "equal bodies must share one entry"
    );
    assert_eq!(first.keys(), vec!["/d1".to_string(), "/d2".to_string()]);

    let stats = cache.stats();
    assert_eq!(stats.size, 3, "shared body counts once");
    assert_eq!(stats.keys, 2);
    assert_eq!(stats.hashes, 1);
    assert_eq!(stats.protecting, 1);

    // Both keys serve from the pool afterwards.
    let (via_d2, none) = cache
        .get(&ProxyRequest::get("/d2"), CancelSignal::never())
        .await
        .expect("hit /d2");
    assert!(none.is_none());
    assert!(Arc::ptr_eq(&via_d2, &first));
    assert_eq!(origin.total(), 2);
}

#[tokio::test]
async fn over_budget_admission_triggers_eviction() {
    let origin = ScriptedOrigin::new();
    origin.respond("/a", StatusCode::OK, b"aaaaa");
    origin.respond("/b", StatusCode::OK, b"bbbbb");
    origin.respond("/c", StatusCode::OK, b"ccccc");
    let config = CacheConfig {
        cache_size: 10,
        ..fast_config()
    };
    let cache = CachePool::new(config, origin.clone());

    for path in ["/a", "/b", "/c"] {
        cache
            .get(&ProxyRequest::get(path), CancelSignal::never())
            .await
            .expect("insert");
    }

    // The third admission put the pool at 15 of 10; the evictor must bring
    // it back under the high-water mark even though nothing is stale yet.
    wait_until(|| cache.stats().size <= 10, "evictor to shrink the pool").await;
    let stats = cache.stats();
    assert!(stats.size <= 10, "size {} exceeds budget", stats.size);
    assert!(stats.keys < 3, "at least one entry must have been evicted");
}

#[tokio::test]
async fn eviction_prefers_cold_large_entries() {
    let origin = ScriptedOrigin::new();
    origin.respond("/a", StatusCode::OK, b"aaaaa");
    origin.respond("/b", StatusCode::OK, b"bbbbb");
    origin.respond("/c", StatusCode::OK, b"ccccc");
    origin.respond("/d", StatusCode::OK, b"ddddd");
    let config = CacheConfig {
        cache_size: 10,
        lfu_time: Duration::from_secs(60),
        protection_expire: Duration::from_millis(50),
        stale_interval: Duration::from_millis(25),
        ..CacheConfig::default()
    };
    let cache = CachePool::new(config, origin.clone());

    for path in ["/a", "/b", "/c"] {
        cache
            .get(&ProxyRequest::get(path), CancelSignal::never())
            .await
            .expect("insert");
    }
    // Eviction already ran after /c; let the survivors go stale, then bump
    // /a's count so it outranks its peers in the victim sort.
    cache
        .get(&ProxyRequest::get("/a"), CancelSignal::never())
        .await
        .expect("hit /a");
    tokio::time::sleep(Duration::from_millis(150)).await;

    cache
        .get(&ProxyRequest::get("/d"), CancelSignal::never())
        .await
        .expect("insert /d");

    wait_until(|| cache.stats().size <= 10, "evictor to quiesce").await;
    let stats = cache.stats();
    assert!(stats.size <= 10, "size {} exceeds budget", stats.size);
    // The fresh /d is protected and must have survived.
    let snapshot = cache.show("/d").expect("/d retained");
    assert_eq!(snapshot.status, EntryStatus::Protected);
}

#[tokio::test]
async fn refresh_replaces_in_place() {
    let origin = ScriptedOrigin::new();
    origin.respond("/r", StatusCode::OK, b"abc");
    let cache = CachePool::new(CacheConfig::default(), origin.clone());

    let request = ProxyRequest::get("/r");
    let (entry, _) = cache
        .get(&request, CancelSignal::never())
        .await
        .expect("prime");
    for _ in 0..6 {
        cache
            .get(&request, CancelSignal::never())
            .await
            .expect("hit");
    }
    assert_eq!(entry.access_count(), 7);
    assert_eq!(cache.stats().size, 3);

    origin.respond("/r", StatusCode::OK, b"wxyz");
    let (refreshed, origin_status) = cache.refresh(&request).await;
    assert_eq!(origin_status, Some(StatusCode::OK));
    assert!(
        Arc::ptr_eq(&entry, &refreshed),
        "holders of the old reference must observe the refresh"
    );
    let (_, body) = refreshed.snapshot();
    assert_eq!(&body[..], b"wxyz");
    assert_eq!(cache.stats().size, 4, "pool size follows the body delta");
    assert_eq!(entry.access_count(), 7, "refresh leaves the counter alone");

    // The re-armed signal must have fired again for new readers.
    let (after, none) = cache
        .get(&request, CancelSignal::never())
        .await
        .expect("post-refresh hit");
    assert!(none.is_none());
    let (_, body) = after.snapshot();
    assert_eq!(&body[..], b"wxyz");
    assert_eq!(origin.hits_for("/r"), 2);
}

#[tokio::test]
async fn refresh_installs_on_miss() {
    let origin = ScriptedOrigin::new();
    origin.respond("/new", StatusCode::OK, b"fresh");
    let cache = CachePool::new(CacheConfig::default(), origin.clone());

    let (entry, origin_status) = cache.refresh(&ProxyRequest::get("/new")).await;
    assert_eq!(origin_status, Some(StatusCode::OK));
    assert_eq!(entry.status(), EntryStatus::Protected);
    assert_eq!(cache.stats().size, 5);

    let (hit, none) = cache
        .get(&ProxyRequest::get("/new"), CancelSignal::never())
        .await
        .expect("hit");
    assert!(none.is_none());
    let (_, body) = hit.snapshot();
    assert_eq!(&body[..], b"fresh");
    assert_eq!(origin.hits_for("/new"), 1);
}

#[tokio::test]
async fn invalid_results_are_transient() {
    let origin = ScriptedOrigin::new();
    origin.respond("/err", StatusCode::INTERNAL_SERVER_ERROR, b"boom");
    let cache = CachePool::new(CacheConfig::default(), origin.clone());

    let (entry, origin_status) = cache
        .get(&ProxyRequest::get("/err"), CancelSignal::never())
        .await
        .expect("first attempt");
    assert_eq!(entry.status(), EntryStatus::Invalid);
    assert_eq!(origin_status, Some(StatusCode::INTERNAL_SERVER_ERROR));
    // The failure body is kept for one in-band relay but never pooled.
    let (_, body) = entry.snapshot();
    assert_eq!(&body[..], b"boom");
    assert_eq!(cache.stats().keys, 0);
    assert_eq!(cache.stats().size, 0);

    // A retry goes back to the origin.
    cache
        .get(&ProxyRequest::get("/err"), CancelSignal::never())
        .await
        .expect("second attempt");
    assert_eq!(origin.hits_for("/err"), 2);
}

#[tokio::test]
async fn transport_failure_yields_empty_invalid_entry() {
    let origin = ScriptedOrigin::new();
    let cache = CachePool::new(CacheConfig::default(), origin.clone());

    let (entry, origin_status) = cache
        .get(&ProxyRequest::get("/down"), CancelSignal::never())
        .await
        .expect("attempt");
    assert_eq!(entry.status(), EntryStatus::Invalid);
    assert!(origin_status.is_none());
    let (_, body) = entry.snapshot();
    assert!(body.is_empty());
    assert_eq!(cache.stats().keys, 0);
}

#[tokio::test]
async fn access_window_reset_reprotects() {
    let origin = ScriptedOrigin::new();
    origin.respond("/w", StatusCode::OK, b"wwwww");
    // A window wide enough that the two priming hits always land inside it.
    let config = CacheConfig {
        lfu_time: Duration::from_millis(300),
        protection_expire: Duration::from_millis(300),
        stale_interval: Duration::from_millis(25),
        ..CacheConfig::default()
    };
    let cache = CachePool::new(config, origin.clone());

    let request = ProxyRequest::get("/w");
    let (entry, _) = cache
        .get(&request, CancelSignal::never())
        .await
        .expect("prime");
    cache
        .get(&request, CancelSignal::never())
        .await
        .expect("hit inside window");
    assert_eq!(entry.access_count(), 2);

    // Let protection expire and the staler demote the entry.
    wait_until(
        || entry.status() == EntryStatus::Stale,
        "staler to demote the entry",
    )
    .await;

    let before = entry.protected_at();
    cache
        .get(&request, CancelSignal::never())
        .await
        .expect("hit after window");
    assert_eq!(entry.access_count(), 1, "counter restarts after the window");
    assert_eq!(entry.status(), EntryStatus::Protected);
    assert!(entry.protected_at() > before, "protection restamped");
    assert_eq!(origin.hits_for("/w"), 1, "reprotection is not a refetch");
}

#[tokio::test]
async fn evictor_skips_reprotected_tombstones() {
    let origin = ScriptedOrigin::new();
    origin.respond("/t", StatusCode::OK, &[b't'; 40]);
    origin.respond("/old1", StatusCode::OK, &[b'1'; 30]);
    origin.respond("/old2", StatusCode::OK, &[b'2'; 30]);
    origin.respond("/new", StatusCode::OK, &[b'n'; 20]);
    let config = CacheConfig {
        cache_size: 100,
        ..fast_config()
    };
    let cache = CachePool::new(config, origin.clone());

    for path in ["/t", "/old1", "/old2"] {
        cache
            .get(&ProxyRequest::get(path), CancelSignal::never())
            .await
            .expect("insert");
    }
    let (tombstoned, _) = cache
        .get(&ProxyRequest::get("/t"), CancelSignal::never())
        .await
        .expect("re-lookup /t");

    // All three go stale, then /t gets reprotected, leaving a tombstone in
    // the eviction list.
    wait_until(
        || tombstoned.status() == EntryStatus::Stale,
        "staler to demote /t",
    )
    .await;
    cache
        .get(&ProxyRequest::get("/t"), CancelSignal::never())
        .await
        .expect("reprotect /t");
    assert_eq!(tombstoned.status(), EntryStatus::Protected);

    // Push the pool over budget; the stale candidates cover the deficit, so
    // the evictor must discard /old1 and /old2 and skip the tombstone.
    cache
        .get(&ProxyRequest::get("/new"), CancelSignal::never())
        .await
        .expect("insert /new");
    wait_until(|| cache.stats().size <= 100, "evictor to quiesce").await;

    let stats = cache.stats();
    assert_eq!(stats.size, 60, "only /t and /new remain");
    assert_eq!(stats.keys, 2);
    let (via_pool, none) = cache
        .get(&ProxyRequest::get("/t"), CancelSignal::never())
        .await
        .expect("hit /t");
    assert!(none.is_none(), "the reprotected entry still serves");
    assert!(Arc::ptr_eq(&via_pool, &tombstoned));
    assert_eq!(origin.hits_for("/t"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_reader_returns_early() {
    let origin = ScriptedOrigin::with_delay(Duration::from_millis(150));
    origin.respond("/slow", StatusCode::OK, b"slow-body");
    let cache = CachePool::new(CacheConfig::default(), origin.clone());

    let owner = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get(&ProxyRequest::get("/slow"), CancelSignal::never())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (handle, signal) = CancelHandle::new();
    let reader = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&ProxyRequest::get("/slow"), signal).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let started = Instant::now();
    handle.cancel();

    let result = reader.await.expect("join reader");
    assert!(result.is_err(), "cancelled reader must not get an entry");
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "cancellation must not wait out the fetch"
    );

    // The fetch ran to completion regardless.
    let (entry, _) = owner.await.expect("join owner").expect("owner result");
    let (_, body) = entry.snapshot();
    assert_eq!(&body[..], b"slow-body");
    assert_eq!(origin.hits_for("/slow"), 1);
}

#[tokio::test]
async fn set_cookie_and_expires_are_stripped() {
    struct CookieOrigin;

    #[async_trait]
    impl OriginClient for CookieOrigin {
        async fn fetch(&self, _request: &ProxyRequest) -> Result<OriginResponse> {
            let mut headers = HeaderMap::new();
            headers.insert("set-cookie", "session=1".parse().unwrap());
            headers.insert("expires", "Thu, 01 Jan 1970 00:00:00 GMT".parse().unwrap());
            headers.insert("content-type", "text/plain".parse().unwrap());
            Ok(OriginResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from_static(b"clean"),
            })
        }
    }

    let cache = CachePool::new(CacheConfig::default(), Arc::new(CookieOrigin));
    let (entry, _) = cache
        .get(&ProxyRequest::get("/c"), CancelSignal::never())
        .await
        .expect("get");
    let (headers, _) = entry.snapshot();
    assert!(headers.get("set-cookie").is_none());
    assert!(headers.get("expires").is_none());
    assert!(headers.get("content-type").is_some());
}

#[tokio::test]
async fn mobile_agents_get_their_own_keyspace() {
    let origin = ScriptedOrigin::new();
    origin.respond("/m", StatusCode::OK, b"page");
    let config = CacheConfig {
        cache_mobile: true,
        ..CacheConfig::default()
    };
    let cache = CachePool::new(config, origin.clone());

    let mut mobile = ProxyRequest::get("/m");
    mobile.headers.insert(
        "user-agent",
        "Mozilla/5.0 (Android) Mobile".parse().unwrap(),
    );
    let mut desktop = ProxyRequest::get("/m");
    desktop
        .headers
        .insert("user-agent", "Mozilla/5.0 (X11)".parse().unwrap());

    let (mobile_entry, _) = cache
        .get(&mobile, CancelSignal::never())
        .await
        .expect("mobile get");
    let (desktop_entry, _) = cache
        .get(&desktop, CancelSignal::never())
        .await
        .expect("desktop get");

    assert!(!Arc::ptr_eq(&mobile_entry, &desktop_entry));
    assert_eq!(mobile_entry.keys(), vec!["M_/m".to_string()]);
    assert_eq!(desktop_entry.keys(), vec!["/m".to_string()]);
    assert_eq!(origin.hits_for("/m"), 2);
}

#[tokio::test]
async fn method_keyed_mode_separates_methods() {
    let origin = ScriptedOrigin::new();
    origin.respond("/p", StatusCode::OK, b"resource");
    let config = CacheConfig {
        method_keyed: true,
        ..CacheConfig::default()
    };
    let cache = CachePool::new(config, origin.clone());

    let mut post = ProxyRequest::get("/p");
    post.method = Method::POST;

    let (post_entry, _) = cache
        .get(&post, CancelSignal::never())
        .await
        .expect("post");
    let (get_entry, _) = cache
        .get(&ProxyRequest::get("/p"), CancelSignal::never())
        .await
        .expect("get");

    assert!(!Arc::ptr_eq(&post_entry, &get_entry));
    assert_eq!(post_entry.keys(), vec!["POST_/p".to_string()]);
    assert_eq!(get_entry.keys(), vec!["GET_/p".to_string()]);
    assert_eq!(origin.hits_for("/p"), 2);

    // The same method hits the same entry.
    let (again, none) = cache.get(&post, CancelSignal::never()).await.expect("hit");
    assert!(none.is_none());
    assert!(Arc::ptr_eq(&again, &post_entry));
}
