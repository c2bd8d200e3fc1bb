//! Key-value capability and its wrapper layers.
//!
//! One small contract (`KeyValueStore`) is implemented by the physical
//! backends (`MemDb`, `SledDb`) and wrapped by layers: `Flushable` adds a
//! write buffer, `TableStore` a key prefix, `CachedTable` an LRU read cache,
//! and `FlushablePool` ties a set of named stores into one crash-consistent
//! unit flushed under a shared marker.

pub mod cache;
pub mod flushable;
pub mod memory;
pub mod pool;
pub mod sleddb;
pub mod table;

use std::sync::Arc;

pub use cache::CachedTable;
pub use flushable::Flushable;
pub use memory::{MemDb, MemProducer};
pub use pool::FlushablePool;
pub use sleddb::{SledDb, SledProducer};
pub use table::TableStore;

/// KV failures. `Io` may be transient and is retried by callers with a
/// budget; `Corruption` is always fatal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv i/o: {0}")]
    Io(String),
    #[error("kv corruption: {0}")]
    Corruption(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// The single storage capability all layers wrap.
///
/// Iteration is callback-based and ordered by key bytes; the callback
/// returns `false` to stop early.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()>;

    fn delete(&self, key: &[u8]) -> KvResult<()>;

    fn has(&self, key: &[u8]) -> KvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Visit entries with key ≥ `start` in ascending key order.
    fn for_each_from(
        &self,
        start: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> KvResult<()>;

    /// Visit entries whose key starts with `prefix`, in ascending key order.
    fn for_each_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> KvResult<()> {
        self.for_each_from(prefix, &mut |k, v| {
            if !k.starts_with(prefix) {
                return false;
            }
            f(k, v)
        })
    }

    /// Estimated bytes buffered in memory and not yet persisted.
    fn buffered_size(&self) -> usize {
        0
    }
}

/// Opens named stores for a pool. A producer also knows how to destroy a
/// store's on-disk data and to sync everything durably.
pub trait DbProducer: Send + Sync {
    fn open(&self, name: &str) -> KvResult<Arc<dyn KeyValueStore>>;

    /// Names of stores that already exist (used on pool startup).
    fn names(&self) -> KvResult<Vec<String>>;

    /// Destroy a store and its data.
    fn destroy(&self, name: &str) -> KvResult<()>;

    /// Durably sync all written data.
    fn sync(&self) -> KvResult<()>;
}
