//! Read-through cache of serialized search results.
//!
//! The cache is best-effort by contract: a backend that is down or slow
//! reads as a miss, and a failed write is logged and dropped. Entries are
//! never invalidated by ingestion, so the TTL is the staleness bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::config::CacheConfig;

const KEY_PREFIX: &str = "around:search";
const COORD_PLACES: i32 = 6;
const RADIUS_PLACES: i32 = 3;

/// Smallest radius the key can tell apart from zero (one metre).
pub const RADIUS_RESOLUTION_KM: f64 = 0.001;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
}

fn fixed(value: f64, places: i32) -> String {
    let scale = 10f64.powi(places);
    let scaled = value * scale;
    // Values this large carry no fractional digits to round away
    let rounded = if scaled.is_finite() { scaled.round() / scale } else { value };
    // Fold -0.0 so it shares a key with 0.0
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{:.*}", places as usize, rounded)
}

/// Cache key for a proximity query.
///
/// Coordinates are rounded to 6 decimal places and the radius to 3, so
/// `37`, `37.0` and `37.000000` all land on the same entry.
pub fn build_key(lat: f64, lon: f64, radius_km: f64) -> String {
    format!(
        "{}:{}:{}:{}km",
        KEY_PREFIX,
        fixed(lat, COORD_PLACES),
        fixed(lon, COORD_PLACES),
        fixed(radius_km, RADIUS_PLACES)
    )
}

/// Raw key/value store behind the cache layer.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
}

/// Best-effort wrapper applying the fixed TTL and per-operation timeout.
#[derive(Clone)]
pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    op_timeout: Duration,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration, op_timeout: Duration) -> Self {
        Self { backend, ttl, op_timeout }
    }

    /// Picks the backend named by the configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let backend: Arc<dyn CacheBackend> = if config.enabled {
            Arc::new(RedisCache::open(&config.url)?)
        } else {
            Arc::new(NoopCache)
        };
        Ok(Self::new(backend, config.ttl, config.op_timeout))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached bytes for `key`, or `None` on miss or any backend failure.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let res = match tokio::time::timeout(self.op_timeout, self.backend.get(key)).await {
            Ok(res) => res,
            Err(_) => Err(CacheError::Timeout(self.op_timeout)),
        };
        match res {
            Ok(Some(bytes)) => {
                tracing::debug!(key, "cache hit");
                Some(bytes)
            }
            Ok(None) => {
                tracing::debug!(key, "cache miss");
                None
            }
            Err(e) => {
                tracing::warn!(key, "cache read failed, treating as miss: {}", e);
                None
            }
        }
    }

    /// Stores `value` under `key` for the configured TTL. Never fails.
    pub async fn set(&self, key: &str, value: Vec<u8>) {
        let res = match tokio::time::timeout(self.op_timeout, self.backend.set(key, value, self.ttl)).await {
            Ok(res) => res,
            Err(_) => Err(CacheError::Timeout(self.op_timeout)),
        };
        if let Err(e) = res {
            tracing::warn!(key, "cache write dropped: {}", e);
        }
    }
}

// --- REDIS ---

/// Redis backend. Connects lazily and reconnects through the connection
/// manager, so an unreachable server only ever costs misses.
pub struct RedisCache {
    client: redis::Client,
    conn: OnceCell<redis::aio::ConnectionManager>,
}

impl RedisCache {
    pub fn open(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self { client, conn: OnceCell::new() })
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager, CacheError> {
        let conn = self
            .conn
            .get_or_try_init(|| async { self.client.get_connection_manager().await })
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

// --- NO-OP ---

/// Backend used when caching is switched off: everything misses.
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }
}

// --- IN-MEMORY ---

/// Process-local TTL map. Expiry follows tokio's clock, so paused-time
/// tests can step past the TTL. Expired entries are dropped on the next
/// read of their key or the next write of any key.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unreachable backend for both reads and writes.
    pub fn set_failing(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache offline".into()));
        }

        let mut entries = self.entries.lock().map_err(|_| CacheError::Unavailable("Poisoned Lock".into()))?;
        match entries.get(key) {
            Some((value, expires)) if Instant::now() < *expires => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache offline".into()));
        }

        let mut entries = self.entries.lock().map_err(|_| CacheError::Unavailable("Poisoned Lock".into()))?;
        let now = Instant::now();
        // Sweep on write so keys that are never read again do not pile up
        entries.retain(|_, (_, expires)| now < *expires);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A backend that never answers.
    struct StalledCache;

    #[async_trait]
    impl CacheBackend for StalledCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
            std::future::pending().await
        }
    }

    fn layer(backend: Arc<dyn CacheBackend>) -> CacheLayer {
        CacheLayer::new(backend, Duration::from_secs(30), Duration::from_millis(500))
    }

    #[test]
    fn key_normalizes_textual_variants() {
        assert_eq!(build_key(37.0, -122.0, 5.0), "around:search:37.000000:-122.000000:5.000km");
        assert_eq!(build_key(37.0, -122.0, 5.0), build_key("37".parse().unwrap(), "-122.000".parse().unwrap(), 5.0));
        assert_eq!(build_key(-0.0, 0.0, 1.0), build_key(0.0, -0.0, 1.0));
        assert_eq!(build_key(-0.0000001, 0.0, 1.0), build_key(0.0, 0.0, 1.0));
    }

    #[test]
    fn key_distinguishes_distinct_queries() {
        assert_ne!(build_key(37.0, -122.0, 5.0), build_key(-122.0, 37.0, 5.0));
        assert_ne!(build_key(37.0, -122.0, 5.0), build_key(37.0, -122.0, 50.0));
        assert_ne!(build_key(37.000001, -122.0, 5.0), build_key(37.0, -122.0, 5.0));
    }

    #[test]
    fn key_survives_huge_radius() {
        let key = build_key(0.0, 0.0, 1e306);
        assert!(!key.contains("inf"));
        assert_ne!(key, build_key(0.0, 0.0, 1e307));
        assert_ne!(build_key(0.0, 0.0, f64::MAX), build_key(0.0, 0.0, 1e307));
    }

    #[test]
    fn resolution_is_the_smallest_distinct_radius() {
        assert_ne!(build_key(0.0, 0.0, RADIUS_RESOLUTION_KM), build_key(0.0, 0.0, 0.0));
        assert_ne!(build_key(0.0, 0.0, RADIUS_RESOLUTION_KM), build_key(0.0, 0.0, 2.0 * RADIUS_RESOLUTION_KM));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let backend = Arc::new(MemoryCache::new());
        let cache = layer(backend.clone());

        cache.set("k", b"v".to_vec()).await;
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("k").await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_expired_entries() {
        let backend = Arc::new(MemoryCache::new());
        let cache = layer(backend.clone());

        for i in 0..10 {
            cache.set(&format!("old-{}", i), b"v".to_vec()).await;
        }
        assert_eq!(backend.len(), 10);

        tokio::time::advance(Duration::from_secs(31)).await;
        cache.set("fresh", b"v".to_vec()).await;

        assert_eq!(backend.len(), 1);
        assert_eq!(cache.get("fresh").await, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn failures_read_as_miss_and_writes_are_swallowed() {
        let backend = Arc::new(MemoryCache::new());
        let cache = layer(backend.clone());
        backend.set_failing(true);

        cache.set("k", b"v".to_vec()).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(backend.set_calls(), 1);
        assert_eq!(backend.get_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_times_out_to_miss() {
        let cache = layer(Arc::new(StalledCache));

        cache.set("k", b"v".to_vec()).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn noop_cache_always_misses() {
        let cache = layer(Arc::new(NoopCache));

        cache.set("k", b"v".to_vec()).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn unreachable_redis_degrades_to_miss() {
        let redis = RedisCache::open("redis://127.0.0.1:1").unwrap();
        let cache = layer(Arc::new(redis));

        cache.set("k", b"v".to_vec()).await;
        assert_eq!(cache.get("k").await, None);
    }
}
