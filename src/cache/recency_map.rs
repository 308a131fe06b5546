//! C4: Bounded recency map.
//!
//! Capacity-bounded, TTL-refreshing cache used by C5 as the `getCache` -
//! read-side memoisation of `id -> E` (or a negative-cache `NULL` marker for
//! confirmed-absent rows). Built directly on the `lru` crate the way the
//! teacher's `cache.rs` already does, adding a TTL layer with
//! `updateAgeOnGet = true` on top of `lru`'s native recency-on-access
//! behaviour.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A capacity-bounded map from `id` to `V` (typically `Option<E>`, with
/// `None` acting as a negative-cache marker), evicting least-recently-used
/// entries on overflow and expiring entries after `ttl`.
pub struct RecencyMap<V> {
    inner: LruCache<String, Entry<V>>,
    ttl: Duration,
}

impl<V: Clone> RecencyMap<V> {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: LruCache::new(NonZeroUsize::new(max_entries.max(1)).unwrap()),
            ttl,
        }
    }

    /// Fetch a value, refreshing its recency (`updateAgeOnGet = true`) and
    /// its TTL. Expired entries are evicted and treated as absent.
    pub fn get(&mut self, id: &str) -> Option<V> {
        let expired = self
            .inner
            .peek(id)
            .map(|e| Instant::now() >= e.expires_at)
            .unwrap_or(false);
        if expired {
            self.inner.pop(id);
            return None;
        }
        let ttl = self.ttl;
        self.inner.get_mut(id).map(|e| {
            e.expires_at = Instant::now() + ttl;
            e.value.clone()
        })
    }

    pub fn has(&mut self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn set(&mut self, id: String, value: V) {
        self.inner.put(
            id,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn delete(&mut self, id: &str) {
        self.inner.pop(id);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.inner.iter().map(|(k, _)| k)
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &V)) {
        for (k, e) in self.inner.iter() {
            f(k, &e.value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn set_then_get_round_trips() {
        let mut m: RecencyMap<Option<i32>> = RecencyMap::new(10, Duration::from_secs(60));
        m.set("a".into(), Some(1));
        assert_eq!(m.get("a"), Some(Some(1)));
    }

    #[test]
    fn negative_cache_marker_round_trips() {
        let mut m: RecencyMap<Option<i32>> = RecencyMap::new(10, Duration::from_secs(60));
        m.set("missing".into(), None);
        assert_eq!(m.get("missing"), Some(None));
    }

    #[test]
    fn evicts_least_recently_used_on_overflow() {
        let mut m: RecencyMap<i32> = RecencyMap::new(2, Duration::from_secs(60));
        m.set("a".into(), 1);
        m.set("b".into(), 2);
        m.get("a"); // touch a, making b the LRU entry
        m.set("c".into(), 3); // evicts b
        assert!(m.get("b").is_none());
        assert!(m.get("a").is_some());
        assert!(m.get("c").is_some());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut m: RecencyMap<i32> = RecencyMap::new(10, Duration::from_millis(20));
        m.set("a".into(), 1);
        sleep(Duration::from_millis(30));
        assert!(m.get("a").is_none());
    }

    #[test]
    fn get_refreshes_ttl() {
        let mut m: RecencyMap<i32> = RecencyMap::new(10, Duration::from_millis(50));
        m.set("a".into(), 1);
        sleep(Duration::from_millis(30));
        assert!(m.get("a").is_some()); // refreshes expiry
        sleep(Duration::from_millis(30));
        assert!(m.get("a").is_some()); // would have expired without the refresh above
    }
}
