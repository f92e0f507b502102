//! Result and lookup caching.
//!
//! Caches validation results to avoid re-running aspects when neither the
//! record nor the active settings have changed. The same bounded TTL cache
//! backs the engine's lookup caches (profiles, codes, references, rules).

use crate::core::types::ValidationResult;
use crate::validation::reference::ReferenceKind;
use crate::validation::terminology::CodeLookup;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// A cache key combining record content with the settings snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Hash of the record content.
    pub content_hash: u64,
    /// Fingerprint of the active settings.
    pub settings_hash: u64,
}

impl CacheKey {
    /// Create a new cache key.
    pub fn new(document: &Value, settings_hash: u64) -> Self {
        let mut hasher = DefaultHasher::new();
        hash_value(document, &mut hasher);
        Self {
            content_hash: hasher.finish(),
            settings_hash,
        }
    }
}

/// Hash a JSON value independently of object key order.
pub fn hash_value<H: Hasher>(value: &Value, hasher: &mut H) {
    std::mem::discriminant(value).hash(hasher);

    match value {
        Value::Null => {}
        Value::Bool(b) => b.hash(hasher),
        Value::Number(n) => n.to_string().hash(hasher),
        Value::String(s) => s.hash(hasher),
        Value::Array(arr) => {
            arr.len().hash(hasher);
            for v in arr {
                hash_value(v, hasher);
            }
        }
        Value::Object(map) => {
            map.len().hash(hasher);
            let mut sorted_keys: Vec<_> = map.keys().collect();
            sorted_keys.sort();
            for k in sorted_keys {
                k.hash(hasher);
                if let Some(v) = map.get(k) {
                    hash_value(v, hasher);
                }
            }
        }
    }
}

/// Cached entry with metadata.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    computation_time: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries evicted for capacity.
    pub evictions: u64,
    /// Number of entries dropped because they expired.
    pub expirations: u64,
    /// Total time saved by cache hits.
    pub time_saved: Duration,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Thread-safe bounded cache with TTL expiry and fractional LRU eviction.
///
/// Once `capacity` entries are held, inserting evicts the least-recently-used
/// `ceil(capacity * eviction_fraction)` entries in one sweep.
pub struct TtlCache<K: Hash + Eq, V> {
    cache: Mutex<LruCache<K, CacheEntry<V>>>,
    capacity: usize,
    ttl: Duration,
    eviction_fraction: f64,
    stats: Mutex<CacheStats>,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    /// Create a new cache with the given capacity and TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
            ttl,
            eviction_fraction: 0.25,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Set the fraction of entries evicted when the cache is full.
    pub fn with_eviction_fraction(mut self, fraction: f64) -> Self {
        self.eviction_fraction = fraction.clamp(f64::EPSILON, 1.0);
        self
    }

    /// Get a cached value.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.cache.lock();

        if let Some(entry) = cache.get(key) {
            if entry.is_expired(self.ttl) {
                cache.pop(key);
                let mut stats = self.stats.lock();
                stats.misses += 1;
                stats.expirations += 1;
                return None;
            }

            let mut stats = self.stats.lock();
            stats.hits += 1;
            stats.time_saved += entry.computation_time;

            Some(entry.value.clone())
        } else {
            let mut stats = self.stats.lock();
            stats.misses += 1;
            None
        }
    }

    /// Store a value.
    pub fn put(&self, key: K, value: V, computation_time: Duration) {
        let mut cache = self.cache.lock();

        if !cache.contains(&key) && cache.len() >= self.capacity {
            let to_evict = ((self.capacity as f64) * self.eviction_fraction).ceil() as usize;
            let mut evicted = 0;
            while evicted < to_evict.max(1) {
                if cache.pop_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
            self.stats.lock().evictions += evicted as u64;
        }

        cache.put(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
                computation_time,
            },
        );
    }

    /// Invalidate a specific entry.
    pub fn invalidate(&self, key: &K) -> bool {
        self.cache.lock().pop(key).is_some()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.cache.lock();
        let expired: Vec<K> = cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(self.ttl))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        self.stats.lock().expirations += expired.len() as u64;
        expired.len()
    }

    /// Clear the entire cache.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Get number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Cache of full validation results.
pub type ResultCache = TtlCache<CacheKey, ValidationResult>;

/// The engine's independent caches.
pub struct EngineCaches {
    /// Full results keyed by record content and settings.
    pub results: ResultCache,
    /// Profile URL checks: `Ok` or the reason the URL is malformed.
    pub profiles: TtlCache<String, Result<(), String>>,
    /// Remote code lookups keyed by `system|code`.
    pub terminology: TtlCache<String, CodeLookup>,
    /// Reference classifications keyed by the reference string.
    pub references: TtlCache<String, ReferenceKind>,
    /// Business-rule outcomes keyed by rule id and value hash.
    pub rules: TtlCache<(String, u64), bool>,
}

impl EngineCaches {
    /// Create caches sharing one capacity, TTL and eviction fraction.
    pub fn new(capacity: usize, ttl: Duration, eviction_fraction: f64) -> Self {
        Self {
            results: TtlCache::new(capacity, ttl).with_eviction_fraction(eviction_fraction),
            profiles: TtlCache::new(capacity, ttl).with_eviction_fraction(eviction_fraction),
            terminology: TtlCache::new(capacity, ttl).with_eviction_fraction(eviction_fraction),
            references: TtlCache::new(capacity, ttl).with_eviction_fraction(eviction_fraction),
            rules: TtlCache::new(capacity, ttl).with_eviction_fraction(eviction_fraction),
        }
    }

    /// Clear every cache.
    pub fn clear(&self) {
        self.results.clear();
        self.profiles.clear();
        self.terminology.clear();
        self.references.clear();
        self.rules.clear();
    }

    /// Statistics per cache, by name.
    pub fn stats(&self) -> Vec<(&'static str, CacheStats)> {
        vec![
            ("results", self.results.stats()),
            ("profiles", self.profiles.stats()),
            ("terminology", self.terminology.stats()),
            ("references", self.references.stats()),
            ("rules", self.rules.stats()),
        ]
    }
}

impl Default for EngineCaches {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(300), 0.25)
    }
}
