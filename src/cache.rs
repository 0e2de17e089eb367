//! In-memory TTL + LRU cache with namespaces and stats.
//!
//! One cache service backs every module-level caching concern (context
//! probes, provider availability, dashboard snapshots). Modules take a
//! [`CacheNamespace`] view instead of keeping their own mutable state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default maximum number of entries before LRU eviction.
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// A cached value with expiry and recency bookkeeping.
#[derive(Debug, Clone)]
struct CacheSlot {
    value: Value,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    /// Monotonic recency stamp; renewed on every hit.
    last_used: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate over all lookups, 0.0 when nothing has been looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheSlot>,
    stats: CacheStats,
    /// Monotonic counter backing LRU ordering.
    tick: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }
}

/// In-memory TTL + LRU cache.
///
/// `get` never returns an expired entry; a hit renews the entry's LRU
/// position but not its TTL. `set` evicts the least-recently-used entry
/// when the cache is full.
#[derive(Clone)]
pub struct TtlCache {
    inner: Arc<RwLock<CacheInner>>,
    max_entries: usize,
    default_ttl: Duration,
}

impl TtlCache {
    /// Create a cache with the default entry limit and a 60s default TTL.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, Duration::seconds(60))
    }

    /// Create a cache with explicit limits.
    pub fn with_limits(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    /// Look up a key. Expired entries are removed and count as misses.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let expired = inner.entries.get(key).map(|slot| now > slot.expires_at);
        match expired {
            Some(true) => {
                inner.entries.remove(key);
                inner.stats.misses += 1;
                None
            }
            Some(false) => {
                let tick = inner.next_tick();
                let value = {
                    let slot = inner.entries.get_mut(key).expect("slot checked above");
                    slot.last_used = tick;
                    slot.value.clone()
                };
                inner.stats.hits += 1;
                Some(value)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Store a value with the default TTL.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    /// Store a value with an explicit TTL.
    pub async fn set_with_ttl(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            inner.evict_lru();
        }

        let tick = inner.next_tick();
        inner.entries.insert(
            key,
            CacheSlot {
                value,
                inserted_at: now,
                expires_at: now + ttl,
                last_used: tick,
            },
        );
        inner.stats.sets += 1;
    }

    /// Remove a key, returning whether it was present.
    pub async fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.entries.remove(key).is_some()
    }

    /// Remove all expired entries and return how many were dropped.
    pub async fn prune(&self) -> usize {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, slot| now <= slot.expires_at);
        before - inner.entries.len()
    }

    /// Number of live entries, expired or not.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the counters.
    pub async fn stats(&self) -> CacheStats {
        self.inner.read().await.stats.clone()
    }

    /// Drop every entry and reset counters.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.stats = CacheStats::default();
    }

    /// Age of an entry, if present and unexpired.
    pub async fn age(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        inner
            .entries
            .get(key)
            .filter(|slot| now <= slot.expires_at)
            .map(|slot| now - slot.inserted_at)
    }

    /// Create a namespaced view with its own default TTL.
    pub fn namespace(&self, name: impl Into<String>, ttl: Duration) -> CacheNamespace {
        CacheNamespace {
            cache: self.clone(),
            prefix: name.into(),
            ttl,
        }
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A prefixed view over a [`TtlCache`] with a namespace-default TTL.
#[derive(Clone)]
pub struct CacheNamespace {
    cache: TtlCache,
    prefix: String,
    ttl: Duration,
}

impl CacheNamespace {
    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Look up a key within the namespace.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(&self.full_key(key)).await
    }

    /// Store a value with the namespace TTL.
    pub async fn set(&self, key: &str, value: Value) {
        self.cache
            .set_with_ttl(self.full_key(key), value, self.ttl)
            .await;
    }

    /// Store a value with an explicit TTL overriding the namespace default.
    pub async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        self.cache.set_with_ttl(self.full_key(key), value, ttl).await;
    }

    /// Remove a key within the namespace.
    pub async fn remove(&self, key: &str) -> bool {
        self.cache.remove(&self.full_key(key)).await
    }

    /// The namespace prefix.
    pub fn name(&self) -> &str {
        &self.prefix
    }

    /// The namespace default TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get_within_ttl() {
        let cache = TtlCache::new();
        cache.set("greeting", json!("hello")).await;

        assert_eq!(cache.get("greeting").await, Some(json!("hello")));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_removed() {
        let cache = TtlCache::new();
        cache
            .set_with_ttl("ephemeral", json!(1), Duration::milliseconds(-1))
            .await;

        assert_eq!(cache.get("ephemeral").await, None);
        // The expired slot is gone, not just hidden.
        assert_eq!(cache.len().await, 0);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let cache = TtlCache::with_limits(2, Duration::seconds(60));
        cache.set("a", json!(1)).await;
        cache.set("b", json!(2)).await;

        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get("a").await.is_some());
        cache.set("c", json!(3)).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_hit_does_not_renew_ttl() {
        let cache = TtlCache::new();
        cache
            .set_with_ttl("k", json!(true), Duration::milliseconds(30))
            .await;

        assert!(cache.get("k").await.is_some());
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = TtlCache::with_limits(1, Duration::seconds(60));
        cache.set("only", json!(1)).await;
        cache.set("only", json!(2)).await;

        assert_eq!(cache.get("only").await, Some(json!(2)));
        assert_eq!(cache.stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_prune_counts_expired() {
        let cache = TtlCache::new();
        cache
            .set_with_ttl("dead1", json!(1), Duration::milliseconds(-1))
            .await;
        cache
            .set_with_ttl("dead2", json!(2), Duration::milliseconds(-1))
            .await;
        cache.set("live", json!(3)).await;

        assert_eq!(cache.prune().await, 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = TtlCache::new();
        assert_eq!(cache.stats().await.hit_rate(), 0.0);

        cache.set("k", json!(1)).await;
        cache.get("k").await;
        cache.get("k").await;
        cache.get("missing").await;

        let rate = cache.stats().await.hit_rate();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_namespace_isolates_keys() {
        let cache = TtlCache::new();
        let weather = cache.namespace("weather", Duration::seconds(60));
        let git = cache.namespace("git", Duration::seconds(60));

        weather.set("hint", json!("sunny")).await;
        git.set("hint", json!("3 commits")).await;

        assert_eq!(weather.get("hint").await, Some(json!("sunny")));
        assert_eq!(git.get("hint").await, Some(json!("3 commits")));

        assert!(weather.remove("hint").await);
        assert!(git.get("hint").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_reports_presence() {
        let cache = TtlCache::new();
        cache.set("k", json!(1)).await;

        assert!(cache.remove("k").await);
        assert!(!cache.remove("k").await);
    }
}
