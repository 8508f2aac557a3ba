//! Memoized content and payload for anonymous consumers, keyed by the set of
//! product ids they are granted.

use crate::config::CacheConfig;
use crate::error::{EntitlementError, Result};
use crate::pki::payload::ContentModel;
use crate::types::ProductId;
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Content list and signed payload shared by every anonymous consumer with
/// the same products.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymousCertContent {
    pub content: Vec<ContentModel>,
    pub payload: String,
}

pub trait AnonymousContentCache: Send + Sync {
    fn get(&self, product_ids: &BTreeSet<ProductId>) -> Option<AnonymousCertContent>;
    fn put(&self, product_ids: &BTreeSet<ProductId>, content: AnonymousCertContent);
    fn remove(&self, product_ids: &BTreeSet<ProductId>);
    fn clear(&self);
}

/// Sorted, comma joined product ids.
pub fn cache_key(product_ids: &BTreeSet<ProductId>) -> String {
    product_ids
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone)]
struct CachedContent {
    value: AnonymousCertContent,
    cached_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnonymousCacheStats {
    pub capacity: usize,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
}

/// Bounded LRU with a time-to-live per entry.
pub struct LruAnonymousContentCache {
    cache: RwLock<LruCache<String, CachedContent>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

impl LruAnonymousContentCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_entries).ok_or_else(|| {
            EntitlementError::InvalidConfig("anonymous cache needs at least one entry".to_string())
        })?;
        Ok(Self {
            cache: RwLock::new(LruCache::new(capacity)),
            ttl,
            capacity: max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(
            config.anonymous_max_entries,
            Duration::from_secs(config.anonymous_ttl_seconds),
        )
    }

    pub fn stats(&self) -> AnonymousCacheStats {
        AnonymousCacheStats {
            capacity: self.capacity,
            size: self.cache.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl AnonymousContentCache for LruAnonymousContentCache {
    fn get(&self, product_ids: &BTreeSet<ProductId>) -> Option<AnonymousCertContent> {
        let key = cache_key(product_ids);
        let mut cache = self.cache.write();

        let expired = match cache.get(&key) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            cache.pop(&key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!("Anonymous content for [{}] expired", key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn put(&self, product_ids: &BTreeSet<ProductId>, content: AnonymousCertContent) {
        self.cache.write().put(
            cache_key(product_ids),
            CachedContent {
                value: content,
                cached_at: Instant::now(),
            },
        );
    }

    fn remove(&self, product_ids: &BTreeSet<ProductId>) {
        self.cache.write().pop(&cache_key(product_ids));
    }

    fn clear(&self) {
        self.cache.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> BTreeSet<ProductId> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn content(payload: &str) -> AnonymousCertContent {
        AnonymousCertContent {
            content: Vec::new(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_key_ignores_insertion_order() {
        assert_eq!(cache_key(&ids(&["b", "a"])), "a,b");
        assert_eq!(cache_key(&ids(&["a", "b"])), cache_key(&ids(&["b", "a"])));
    }

    #[test]
    fn test_hit_and_miss_accounting() {
        let cache = LruAnonymousContentCache::new(4, Duration::from_secs(60)).unwrap();
        assert!(cache.get(&ids(&["1"])).is_none());
        cache.put(&ids(&["1", "2"]), content("p"));
        assert_eq!(cache.get(&ids(&["2", "1"])), Some(content("p")));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);

        cache.remove(&ids(&["1", "2"]));
        assert!(cache.get(&ids(&["1", "2"])).is_none());
    }

    #[test]
    fn test_least_recently_used_entry_is_evicted() {
        let cache = LruAnonymousContentCache::new(2, Duration::from_secs(60)).unwrap();
        cache.put(&ids(&["1"]), content("one"));
        cache.put(&ids(&["2"]), content("two"));
        assert!(cache.get(&ids(&["1"])).is_some());
        cache.put(&ids(&["3"]), content("three"));

        assert!(cache.get(&ids(&["2"])).is_none());
        assert!(cache.get(&ids(&["1"])).is_some());
        assert!(cache.get(&ids(&["3"])).is_some());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = LruAnonymousContentCache::new(2, Duration::ZERO).unwrap();
        cache.put(&ids(&["1"]), content("one"));
        assert!(cache.get(&ids(&["1"])).is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            LruAnonymousContentCache::new(0, Duration::from_secs(1)),
            Err(EntitlementError::InvalidConfig(_))
        ));
    }
}
