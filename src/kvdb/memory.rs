//! In-memory KV backend for tests and tools.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

use super::{DbProducer, KeyValueStore, KvResult};

/// Ordered in-memory store.
#[derive(Default)]
pub struct MemDb {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        MemDb::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("memdb poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemDb {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.map.read().expect("memdb poisoned").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.map
            .write()
            .expect("memdb poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.map.write().expect("memdb poisoned").remove(key);
        Ok(())
    }

    fn for_each_from(
        &self,
        start: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> KvResult<()> {
        // Snapshot the range so the callback may touch the store.
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = {
            let map = self.map.read().expect("memdb poisoned");
            map.range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (k, v) in snapshot {
            if !f(&k, &v) {
                break;
            }
        }
        Ok(())
    }
}

/// Producer of named in-memory stores. Stores persist across re-opens for
/// the lifetime of the producer, which lets tests simulate a crash by
/// dropping the pool (losing buffers) and reopening from the same producer.
#[derive(Default)]
pub struct MemProducer {
    stores: Mutex<HashMap<String, Arc<MemDb>>>,
}

impl MemProducer {
    pub fn new() -> Arc<Self> {
        Arc::new(MemProducer::default())
    }
}

impl DbProducer for MemProducer {
    fn open(&self, name: &str) -> KvResult<Arc<dyn KeyValueStore>> {
        let mut stores = self.stores.lock().expect("mem producer poisoned");
        let db = stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemDb::new()));
        Ok(db.clone())
    }

    fn names(&self) -> KvResult<Vec<String>> {
        let stores = self.stores.lock().expect("mem producer poisoned");
        Ok(stores.keys().cloned().collect())
    }

    fn destroy(&self, name: &str) -> KvResult<()> {
        self.stores
            .lock()
            .expect("mem producer poisoned")
            .remove(name);
        Ok(())
    }

    fn sync(&self) -> KvResult<()> {
        Ok(())
    }
}
