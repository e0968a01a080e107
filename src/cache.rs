use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

/// LRU cache whose entries also expire after a fixed TTL. Backs the token
/// authenticator (successful reviews only) and the per-token authorization
/// results. Callers wrap it in a lock; lookups need `&mut self` because
/// both LRU promotion and expiry eviction mutate the cache.
pub struct TtlCache<V> {
    entries: LruCache<String, (Instant, V)>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        match self.entries.get(key) {
            Some((inserted, value)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                self.entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, key: String, value: V) {
        self.entries.put(key, (Instant::now(), value));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_fresh_entries() {
        let mut cache = TtlCache::new(4, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        assert_eq!(cache.get("a"), Some(1));
    }

    #[test]
    fn expired_entries_are_evicted() {
        let mut cache = TtlCache::new(4, Duration::ZERO);
        cache.put("a".to_string(), 1);
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_bounds_the_cache() {
        let mut cache = TtlCache::new(2, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.put("c".to_string(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn clear_empties_the_cache() {
        let mut cache = TtlCache::new(4, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.clear();
        assert_eq!(cache.get("a"), None);
    }
}
