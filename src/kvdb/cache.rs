//! LRU read cache in front of a table. Capacity zero disables caching.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use super::{KeyValueStore, KvResult};

pub struct CachedTable {
    under: Arc<dyn KeyValueStore>,
    cache: Option<Mutex<LruCache<Vec<u8>, Vec<u8>>>>,
}

impl CachedTable {
    pub fn new(under: Arc<dyn KeyValueStore>, capacity: usize) -> Arc<Self> {
        let cache = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Arc::new(CachedTable { under, cache })
    }
}

impl KeyValueStore for CachedTable {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().expect("cache poisoned").get(key) {
                return Ok(Some(hit.clone()));
            }
        }
        let value = self.under.get(key)?;
        if let (Some(cache), Some(v)) = (&self.cache, &value) {
            cache
                .lock()
                .expect("cache poisoned")
                .put(key.to_vec(), v.clone());
        }
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.under.put(key, value)?;
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .expect("cache poisoned")
                .put(key.to_vec(), value.to_vec());
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.under.delete(key)?;
        if let Some(cache) = &self.cache {
            cache.lock().expect("cache poisoned").pop(key);
        }
        Ok(())
    }

    fn has(&self, key: &[u8]) -> KvResult<bool> {
        if let Some(cache) = &self.cache {
            if cache.lock().expect("cache poisoned").contains(key) {
                return Ok(true);
            }
        }
        self.under.has(key)
    }

    fn for_each_from(
        &self,
        start: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> KvResult<()> {
        self.under.for_each_from(start, f)
    }

    fn buffered_size(&self) -> usize {
        self.under.buffered_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvdb::MemDb;

    #[test]
    fn cache_serves_and_invalidates() {
        let base: Arc<dyn KeyValueStore> = Arc::new(MemDb::new());
        let cached = CachedTable::new(base.clone(), 4);

        cached.put(b"k", b"v").unwrap();
        assert_eq!(cached.get(b"k").unwrap(), Some(b"v".to_vec()));

        // mutate behind the cache's back, then delete through it
        base.put(b"k", b"stale").unwrap();
        assert_eq!(cached.get(b"k").unwrap(), Some(b"v".to_vec()));
        cached.delete(b"k").unwrap();
        assert_eq!(cached.get(b"k").unwrap(), None);
    }

    #[test]
    fn zero_capacity_bypasses() {
        let base: Arc<dyn KeyValueStore> = Arc::new(MemDb::new());
        let cached = CachedTable::new(base.clone(), 0);
        cached.put(b"k", b"v").unwrap();
        base.put(b"k", b"fresh").unwrap();
        assert_eq!(cached.get(b"k").unwrap(), Some(b"fresh".to_vec()));
    }

    #[test]
    fn eviction_respects_capacity() {
        let base: Arc<dyn KeyValueStore> = Arc::new(MemDb::new());
        let cached = CachedTable::new(base.clone(), 2);
        cached.put(b"a", b"1").unwrap();
        cached.put(b"b", b"2").unwrap();
        cached.put(b"c", b"3").unwrap();
        // "a" was evicted; the read falls through to the base store
        base.delete(b"a").unwrap();
        assert_eq!(cached.get(b"a").unwrap(), None);
        assert_eq!(cached.get(b"c").unwrap(), Some(b"3".to_vec()));
    }
}
