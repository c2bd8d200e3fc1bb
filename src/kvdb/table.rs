//! Key-prefix table wrapper: carves one logical table out of a store.

use std::sync::Arc;

use super::{KeyValueStore, KvResult};

pub struct TableStore {
    under: Arc<dyn KeyValueStore>,
    prefix: Vec<u8>,
}

impl TableStore {
    pub fn new(under: Arc<dyn KeyValueStore>, prefix: &[u8]) -> Arc<Self> {
        Arc::new(TableStore {
            under,
            prefix: prefix.to_vec(),
        })
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }
}

impl KeyValueStore for TableStore {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        self.under.get(&self.full_key(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.under.put(&self.full_key(key), value)
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.under.delete(&self.full_key(key))
    }

    fn has(&self, key: &[u8]) -> KvResult<bool> {
        self.under.has(&self.full_key(key))
    }

    fn for_each_from(
        &self,
        start: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> KvResult<()> {
        let prefix = self.prefix.clone();
        self.under.for_each_from(&self.full_key(start), &mut |k, v| {
            // past the table's keyspace: stop
            if !k.starts_with(&prefix) {
                return false;
            }
            f(&k[prefix.len()..], v)
        })
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
    fn tables_are_isolated() {
        let base: Arc<dyn KeyValueStore> = Arc::new(MemDb::new());
        let t1 = TableStore::new(base.clone(), b"one/");
        let t2 = TableStore::new(base.clone(), b"two/");

        t1.put(b"k", b"1").unwrap();
        t2.put(b"k", b"2").unwrap();

        assert_eq!(t1.get(b"k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(t2.get(b"k").unwrap(), Some(b"2".to_vec()));
        assert_eq!(base.get(b"one/k").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn iteration_strips_prefix_and_stays_in_table() {
        let base: Arc<dyn KeyValueStore> = Arc::new(MemDb::new());
        let t1 = TableStore::new(base.clone(), b"one/");
        t1.put(b"a", b"1").unwrap();
        t1.put(b"b", b"2").unwrap();
        base.put(b"two/a", b"other").unwrap();

        let mut seen = Vec::new();
        t1.for_each_from(b"", &mut |k, _| {
            seen.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
