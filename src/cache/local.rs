// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded in-process LRU cache, one instance per configured pool.
//!
//! Values are [`CacheValue`]s: full row vectors, query-index id lists, or
//! the nil tombstone. A TTL sub-type is available through
//! [`LocalCache::get_set`], which caches a provider result for a bounded
//! number of seconds. All access goes through a per-pool mutex.

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::value::CacheValue;

struct Entry {
    value: CacheValue,
    stored_at: Instant,
}

pub struct LocalCache {
    code: String,
    inner: Mutex<LruCache<String, Entry>>,
}

impl LocalCache {
    #[must_use]
    pub fn new(code: &str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { code: code.to_string(), inner: Mutex::new(LruCache::new(capacity)) }
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let mut inner = self.inner.lock();
        let hit = inner.get(key).map(|e| e.value.clone());
        crate::metrics::record_cache_access("local", hit.is_some());
        debug!(pool = %self.code, key, miss = hit.is_none(), "local cache get");
        hit
    }

    #[must_use]
    pub fn mget(&self, keys: &[String]) -> Vec<Option<CacheValue>> {
        let mut inner = self.inner.lock();
        let mut misses = 0usize;
        let results: Vec<Option<CacheValue>> = keys
            .iter()
            .map(|key| {
                let value = inner.get(key).map(|e| e.value.clone());
                if value.is_none() {
                    misses += 1;
                }
                value
            })
            .collect();
        debug!(pool = %self.code, keys = keys.len(), misses, "local cache mget");
        results
    }

    pub fn set(&self, key: &str, value: CacheValue) {
        let mut inner = self.inner.lock();
        inner.put(key.to_string(), Entry { value, stored_at: Instant::now() });
    }

    pub fn mset(&self, pairs: Vec<(String, CacheValue)>) {
        let mut inner = self.inner.lock();
        let count = pairs.len();
        for (key, value) in pairs {
            inner.put(key, Entry { value, stored_at: Instant::now() });
        }
        debug!(pool = %self.code, count, "local cache mset");
    }

    pub fn remove(&self, keys: &[String]) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.pop(key);
        }
        debug!(pool = %self.code, keys = keys.len(), "local cache remove");
    }

    /// Cached provider call: re-runs the provider once the entry is older
    /// than `ttl_secs`.
    pub fn get_set(&self, key: &str, ttl_secs: u64, provider: impl FnOnce() -> CacheValue) -> CacheValue {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.get(key) {
                if entry.stored_at.elapsed().as_secs() <= ttl_secs {
                    return entry.value.clone();
                }
            }
        }
        let value = provider();
        self.set(key, value.clone());
        value
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
        debug!(pool = %self.code, "local cache clear");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{build_local_cache_value, DbValue};

    #[test]
    fn test_set_get_remove() {
        let cache = LocalCache::new("default", 10);
        cache.set("k1", build_local_cache_value(&[DbValue::U64(1)]));
        assert!(matches!(cache.get("k1"), Some(CacheValue::Row(_))));
        cache.remove(&["k1".to_string()]);
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = LocalCache::new("default", 2);
        cache.set("a", CacheValue::Nil);
        cache.set("b", CacheValue::Nil);
        cache.set("c", CacheValue::Nil);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_mget_preserves_order() {
        let cache = LocalCache::new("default", 10);
        cache.set("a", CacheValue::Nil);
        let result = cache.mget(&["a".to_string(), "missing".to_string()]);
        assert!(result[0].is_some());
        assert!(result[1].is_none());
    }

    #[test]
    fn test_tombstone_round_trip() {
        let cache = LocalCache::new("default", 10);
        cache.set("gone", CacheValue::Nil);
        match cache.get("gone") {
            Some(value) => assert!(value.is_nil()),
            None => panic!("tombstone should be present"),
        }
    }

    #[test]
    fn test_get_set_caches_provider() {
        let cache = LocalCache::new("default", 10);
        let mut calls = 0;
        for _ in 0..3 {
            cache.get_set("ttl", 60, || {
                calls += 1;
                CacheValue::Nil
            });
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_clear() {
        let cache = LocalCache::new("default", 10);
        cache.set("a", CacheValue::Nil);
        cache.clear();
        assert!(cache.is_empty());
    }
}
