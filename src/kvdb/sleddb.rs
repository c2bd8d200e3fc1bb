//! Sled-backed KV backend: one `sled::Db` per pool directory, one tree per
//! named store.

use std::path::Path;
use std::sync::Arc;

use super::{DbProducer, KeyValueStore, KvError, KvResult};

fn io_err(e: sled::Error) -> KvError {
    KvError::Io(e.to_string())
}

/// A single named store, backed by a sled tree.
pub struct SledDb {
    tree: sled::Tree,
}

impl KeyValueStore for SledDb {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key).map_err(io_err)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.tree.insert(key, value).map_err(io_err)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.tree.remove(key).map_err(io_err)?;
        Ok(())
    }

    fn has(&self, key: &[u8]) -> KvResult<bool> {
        self.tree.contains_key(key).map_err(io_err)
    }

    fn for_each_from(
        &self,
        start: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> KvResult<()> {
        for item in self.tree.range(start.to_vec()..) {
            let (k, v) = item.map_err(io_err)?;
            if !f(&k, &v) {
                break;
            }
        }
        Ok(())
    }
}

/// Producer of sled-backed stores under one database directory.
pub struct SledProducer {
    db: sled::Db,
}

impl SledProducer {
    pub fn open(path: &Path) -> KvResult<Arc<Self>> {
        let db = sled::open(path).map_err(io_err)?;
        Ok(Arc::new(SledProducer { db }))
    }

    /// Temporary on-disk database, removed on drop (for tests).
    pub fn open_temporary() -> KvResult<Arc<Self>> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(io_err)?;
        Ok(Arc::new(SledProducer { db }))
    }
}

impl DbProducer for SledProducer {
    fn open(&self, name: &str) -> KvResult<Arc<dyn KeyValueStore>> {
        let tree = self.db.open_tree(name).map_err(io_err)?;
        Ok(Arc::new(SledDb { tree }))
    }

    fn names(&self) -> KvResult<Vec<String>> {
        let mut names = Vec::new();
        for raw in self.db.tree_names() {
            if raw.as_ref() == b"__sled__default" {
                continue;
            }
            if let Ok(name) = std::str::from_utf8(&raw) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn destroy(&self, name: &str) -> KvResult<()> {
        self.db.drop_tree(name).map_err(io_err)?;
        Ok(())
    }

    fn sync(&self) -> KvResult<()> {
        self.db.flush().map_err(io_err)?;
        Ok(())
    }
}
