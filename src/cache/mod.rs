//! Response cache with named cache spaces (§4.F), grounded on the original
//! project's `web/cache` package (`cache.go`, `type.go`, `space.go`,
//! `holder.go`).
//!
//! The primary store and its space index are mutated only by a single
//! maintainer task, fed through a bounded intake with FIFO drop-on-full
//! semantics; readers take short-lived locks on individual entries.

mod key;

pub use key::{calc_cache_key, CACHE_KEY_IGNORE_HEADERS, CACHE_KEY_IGNORE_QUERY};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info};

pub const MAX_CACHE_NUM: usize = 8192;
pub const MAX_CACHE_SIZE: usize = 100 * 1024 * 1024;
const MAINTENANCE_TICK: Duration = Duration::from_secs(10);

pub const HEADER_KEY_EXPIRED: &str = "Expired";
pub const HEADER_KEY_SPACE: &str = "Space";
pub const HEADER_KEY_SPACE_KEY: &str = "Space-Key";

/// A cached response body, status, and headers, plus the space this entry
/// is published under (if any).
#[derive(Debug, Clone)]
pub struct RespCache {
    pub code: u16,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
    pub expiry_millis: i64,
    pub cache_key: String,
    pub space: Option<String>,
    pub space_key: Option<String>,
}

impl RespCache {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expiry_millis >= 0 && self.expiry_millis <= now_millis
    }

    /// Atomically rewrites this entry's code/body/headers, refreshing
    /// `Content-Length` (used by the playback rewriter's cache-space
    /// short-circuit, §4.H step 3).
    pub fn apply_update(&mut self, code: u16, body: Vec<u8>, mut headers: HeaderMap) {
        headers.insert(
            reqwest::header::CONTENT_LENGTH,
            body.len().to_string().parse().expect("valid header value"),
        );
        self.code = code;
        self.body = body;
        self.headers = headers;
    }
}

/// Converts a config/handler-supplied expiry hint (absolute epoch-millis, or
/// `-1` for "never cache") plus a default duration into the field stored on
/// [`RespCache`].
pub fn resolve_expiry_millis(hint: Option<i64>, now_millis: i64, default: Duration) -> i64 {
    match hint {
        Some(-1) => -1,
        Some(abs) if abs > now_millis => abs,
        _ => now_millis + default.as_millis() as i64,
    }
}

/// Renders an expiry hint in the `Duration(d)`-style epoch-millis format
/// used by handlers that set the `Expired` header directly.
pub fn duration_to_expiry_header(now_millis: i64, d: Duration) -> String {
    (now_millis + d.as_millis() as i64).to_string()
}

type Entry = Arc<RwLock<RespCache>>;

struct Intake {
    queue: Mutex<VecDeque<RespCache>>,
    notify: Notify,
}

impl Intake {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Non-blocking push; drops the oldest pending entry when the intake is
    /// already at [`MAX_CACHE_NUM`] (FIFO overwrite, §4.F "Store").
    async fn push(&self, entry: RespCache) {
        let mut q = self.queue.lock().await;
        if q.len() >= MAX_CACHE_NUM {
            q.pop_front();
        }
        q.push_back(entry);
        drop(q);
        self.notify.notify_one();
    }

    async fn drain(&self) -> Vec<RespCache> {
        let mut q = self.queue.lock().await;
        q.drain(..).collect()
    }
}

/// The shared response cache. Clone is cheap (wraps `Arc`s); a single
/// maintainer task owns the only writer handle to `entries`/`spaces`.
#[derive(Clone)]
pub struct CacheStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    spaces: Arc<RwLock<HashMap<String, HashMap<String, String>>>>,
    intake: Arc<Intake>,
    size_bytes: Arc<AtomicI64>,
    enabled: bool,
}

impl CacheStore {
    pub fn new(enabled: bool) -> Self {
        let store = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            spaces: Arc::new(RwLock::new(HashMap::new())),
            intake: Arc::new(Intake::new()),
            size_bytes: Arc::new(AtomicI64::new(0)),
            enabled,
        };
        store.clone().spawn_maintainer();
        store
    }

    fn spawn_maintainer(self) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.evict_expired_and_over_budget().await,
                    _ = self.intake.notify.notified() => self.drain_intake().await,
                }
            }
        });
    }

    /// Enqueues a freshly-built entry for the maintainer to adopt; never
    /// blocks the calling request handler.
    pub async fn put(&self, entry: RespCache) {
        if !self.enabled || entry.expiry_millis < 0 {
            return;
        }
        self.intake.push(entry).await;
    }

    async fn drain_intake(&self) {
        let drained = self.intake.drain().await;
        if drained.is_empty() {
            return;
        }
        let mut entries = self.entries.write().await;
        let mut spaces = self.spaces.write().await;
        for entry in drained {
            self.size_bytes.fetch_add(entry.body.len() as i64, Ordering::Relaxed);
            if let (Some(space), Some(space_key)) = (entry.space.clone(), entry.space_key.clone()) {
                spaces
                    .entry(space)
                    .or_default()
                    .insert(space_key, entry.cache_key.clone());
            }
            entries.insert(entry.cache_key.clone(), Arc::new(RwLock::new(entry)));
        }
    }

    async fn evict_expired_and_over_budget(&self) {
        let now = now_millis();
        let mut entries = self.entries.write().await;
        let mut to_remove = Vec::new();
        for (key, entry) in entries.iter() {
            let snapshot = entry.read().await;
            if snapshot.is_expired(now) {
                to_remove.push(key.clone());
            }
        }
        for key in &to_remove {
            if let Some(entry) = entries.remove(key) {
                let snapshot = entry.read().await;
                self.size_bytes.fetch_sub(snapshot.body.len() as i64, Ordering::Relaxed);
            }
        }
        if !to_remove.is_empty() {
            let mut spaces = self.spaces.write().await;
            for space in spaces.values_mut() {
                space.retain(|_, v| !to_remove.contains(v));
            }
            debug!(removed = to_remove.len(), "evicted expired cache entries");
        }

        while self.size_bytes.load(Ordering::Relaxed) > MAX_CACHE_SIZE as i64 || entries.len() > MAX_CACHE_NUM {
            let Some(oldest_key) = entries.keys().next().cloned() else {
                break;
            };
            if let Some(entry) = entries.remove(&oldest_key) {
                let snapshot = entry.read().await;
                self.size_bytes.fetch_sub(snapshot.body.len() as i64, Ordering::Relaxed);
            }
        }
        info!(count = entries.len(), bytes = self.size_bytes.load(Ordering::Relaxed), "cache maintenance tick");
    }

    /// Looks up an entry by its primary fingerprint key.
    pub async fn get(&self, cache_key: &str) -> Option<Entry> {
        self.entries.read().await.get(cache_key).cloned()
    }

    /// Looks up an entry by `(space, space_key)`.
    pub async fn get_by_space(&self, space: &str, space_key: &str) -> Option<Entry> {
        let spaces = self.spaces.read().await;
        let cache_key = spaces.get(space)?.get(space_key)?.clone();
        drop(spaces);
        self.get(&cache_key).await
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(key: &str, expiry: i64) -> RespCache {
        RespCache {
            code: 200,
            body: b"hello".to_vec(),
            headers: HeaderMap::new(),
            expiry_millis: expiry,
            cache_key: key.to_string(),
            space: Some("PlaybackInfo".to_string()),
            space_key: Some("item1".to_string()),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_the_maintainer() {
        let store = CacheStore::new(true);
        store.put(sample_entry("k1", now_millis() + 60_000)).await;
        // give the maintainer a scheduling slot to drain the intake
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let entry = store.get("k1").await.expect("entry should be present");
        assert_eq!(entry.read().await.body, b"hello");
    }

    #[tokio::test]
    async fn get_by_space_resolves_through_the_space_index() {
        let store = CacheStore::new(true);
        store.put(sample_entry("k1", now_millis() + 60_000)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let entry = store
            .get_by_space("PlaybackInfo", "item1")
            .await
            .expect("space lookup should resolve");
        assert_eq!(entry.read().await.cache_key, "k1");
    }

    #[tokio::test]
    async fn negative_expiry_hint_is_never_enqueued() {
        let store = CacheStore::new(true);
        store.put(sample_entry("never", -1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("never").await.is_none());
    }

    #[test]
    fn resolve_expiry_millis_honors_never_cache_hint() {
        assert_eq!(resolve_expiry_millis(Some(-1), 1000, Duration::from_secs(1)), -1);
    }

    #[test]
    fn resolve_expiry_millis_falls_back_to_default_when_hint_is_past() {
        let now = 1_000_000;
        let resolved = resolve_expiry_millis(Some(500), now, Duration::from_secs(10));
        assert_eq!(resolved, now + 10_000);
    }
}
