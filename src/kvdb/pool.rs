//! Pool of named flushable stores committed as one crash-consistent unit.
//!
//! Flush protocol: every underlying store holds a marker under a well-known
//! key. Before buffered data is persisted, the marker is rewritten to
//! `"dirty" ∥ previous-marker ∥ new-id` in every store; after all data is
//! durable, the marker becomes the new id alone. On startup the pool refuses
//! to serve if any marker is dirty or if markers disagree across stores —
//! that state is only reachable through a crash mid-flush.
//!
//! Two flush triggers: elapsed time since the last flush, and total buffered
//! size. Table drops are queued and performed at the next flush. At most one
//! flush is in flight (pool mutex).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{DbProducer, Flushable, KeyValueStore, KvError, KvResult};

/// Well-known marker key, present in every underlying store.
pub const MARKER_KEY: &[u8] = b"flag";
const MARKER_DIRTY_PREFIX: &[u8] = b"dirty";
const MARKER_INITIAL: &[u8] = b"initial";

struct PoolInner {
    wrappers: HashMap<String, Arc<Flushable>>,
    bare: HashMap<String, Arc<dyn KeyValueStore>>,
    queued_drops: HashSet<String>,
    prev_flush: Instant,
}

pub struct FlushablePool {
    producer: Arc<dyn DbProducer>,
    inner: Mutex<PoolInner>,
    flush_interval: Duration,
    flush_size_threshold: usize,
}

impl FlushablePool {
    /// Open the pool, registering every store the producer already has.
    pub fn open(
        producer: Arc<dyn DbProducer>,
        flush_interval: Duration,
        flush_size_threshold: usize,
    ) -> KvResult<Arc<Self>> {
        let mut inner = PoolInner {
            wrappers: HashMap::new(),
            bare: HashMap::new(),
            queued_drops: HashSet::new(),
            prev_flush: Instant::now(),
        };
        for name in producer.names()? {
            let bare = producer.open(&name)?;
            let wrapper = Arc::new(Flushable::new(Some(bare.clone())));
            inner.bare.insert(name.clone(), bare);
            inner.wrappers.insert(name, wrapper);
        }
        Ok(Arc::new(FlushablePool {
            producer,
            inner: Mutex::new(inner),
            flush_interval,
            flush_size_threshold,
        }))
    }

    /// Get (or lazily register) a named store. A store registered here has
    /// no underlying database until the first flush; its writes live purely
    /// in the buffer and are lost on crash, by design.
    pub fn get_store(&self, name: &str) -> Arc<Flushable> {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if let Some(wrapper) = inner.wrappers.get(name) {
            return wrapper.clone();
        }
        debug!(store = name, "registering new pool store");
        let wrapper = Arc::new(Flushable::new(None));
        inner.wrappers.insert(name.to_string(), wrapper.clone());
        inner.queued_drops.remove(name);
        wrapper
    }

    /// Queue a store for deletion at the next flush. A store that was never
    /// flushed is simply forgotten.
    pub fn drop_store(&self, name: &str) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if !inner.bare.contains_key(name) {
            inner.wrappers.remove(name);
            inner.queued_drops.remove(name);
            return;
        }
        inner.queued_drops.insert(name.to_string());
    }

    /// Force a flush under the given recovery id.
    pub fn flush(&self, id: &[u8]) -> KvResult<()> {
        let mut inner = self.inner.lock().expect("pool poisoned");
        self.flush_locked(&mut inner, id)
    }

    /// Flush if a trigger fires: elapsed interval or buffered size.
    /// Returns whether a flush happened.
    pub fn flush_if_needed(&self, id: &[u8]) -> KvResult<bool> {
        let mut inner = self.inner.lock().expect("pool poisoned");

        if inner.prev_flush.elapsed() > self.flush_interval {
            self.flush_locked(&mut inner, id)?;
            return Ok(true);
        }

        let buffered: usize = inner.wrappers.values().map(|w| w.buffered_size()).sum();
        if buffered > self.flush_size_threshold {
            self.flush_locked(&mut inner, id)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn flush_locked(&self, inner: &mut PoolInner, id: &[u8]) -> KvResult<()> {
        // perform queued drops
        let drops: Vec<String> = inner.queued_drops.drain().collect();
        for name in drops {
            self.producer.destroy(&name)?;
            inner.wrappers.remove(&name);
            inner.bare.remove(&name);
        }

        // open databases for stores that were registered since the last
        // flush; seed them with the initial clean marker
        let missing: Vec<String> = inner
            .wrappers
            .keys()
            .filter(|name| !inner.bare.contains_key(*name))
            .cloned()
            .collect();
        for name in missing {
            let bare = self.producer.open(&name)?;
            bare.put(MARKER_KEY, MARKER_INITIAL)?;
            inner.wrappers[&name].set_underlying(bare.clone());
            inner.bare.insert(name, bare);
        }

        // write dirty markers
        for bare in inner.bare.values() {
            let prev = bare
                .get(MARKER_KEY)?
                .ok_or_else(|| KvError::Corruption("missing flush marker".into()))?;
            let mut marker =
                Vec::with_capacity(MARKER_DIRTY_PREFIX.len() + prev.len() + id.len());
            marker.extend_from_slice(MARKER_DIRTY_PREFIX);
            marker.extend_from_slice(&prev);
            marker.extend_from_slice(id);
            bare.put(MARKER_KEY, &marker)?;
        }
        self.producer.sync()?;

        // persist buffered data
        for wrapper in inner.wrappers.values() {
            wrapper.flush()?;
        }

        // write clean markers
        for bare in inner.bare.values() {
            bare.put(MARKER_KEY, id)?;
        }
        self.producer.sync()?;

        inner.prev_flush = Instant::now();
        info!(id = %hex::encode(id), "pool flushed");
        Ok(())
    }

    /// Startup check: every store's marker must be clean and identical.
    /// Returns the common recovery id, or `None` for an empty pool.
    pub fn check_consistency(&self) -> KvResult<Option<Vec<u8>>> {
        let inner = self.inner.lock().expect("pool poisoned");
        let mut common: Option<Vec<u8>> = None;
        for (name, bare) in &inner.bare {
            let marker = bare
                .get(MARKER_KEY)?
                .ok_or_else(|| KvError::Corruption(format!("{}: missing flush marker", name)))?;
            if marker.starts_with(MARKER_DIRTY_PREFIX) {
                return Err(KvError::Corruption(format!(
                    "{}: dirty flush marker, crashed mid-flush",
                    name
                )));
            }
            match &common {
                None => common = Some(marker),
                Some(prev) if *prev != marker => {
                    return Err(KvError::Corruption(format!(
                        "{}: flush markers disagree across stores",
                        name
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(common)
    }

    /// Total bytes buffered across all stores.
    pub fn buffered_size(&self) -> usize {
        let inner = self.inner.lock().expect("pool poisoned");
        inner.wrappers.values().map(|w| w.buffered_size()).sum()
    }

    /// Durably sync underlying databases without flushing buffers.
    pub fn close(&self) -> KvResult<()> {
        self.producer.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvdb::MemProducer;

    fn pool_over(producer: Arc<MemProducer>) -> Arc<FlushablePool> {
        FlushablePool::open(producer, Duration::from_secs(3600), usize::MAX).unwrap()
    }

    #[test]
    fn flush_persists_and_marks_clean() {
        let producer = MemProducer::new();
        let pool = pool_over(producer.clone());
        let store = pool.get_store("main");
        store.put(b"k", b"v").unwrap();

        pool.flush(b"id-1").unwrap();
        assert_eq!(pool.check_consistency().unwrap(), Some(b"id-1".to_vec()));

        // crash: drop the pool, losing buffers; reopen from the producer
        drop(pool);
        let pool = pool_over(producer);
        assert_eq!(pool.check_consistency().unwrap(), Some(b"id-1".to_vec()));
        let store = pool.get_store("main");
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn unflushed_writes_die_with_the_pool() {
        let producer = MemProducer::new();
        let pool = pool_over(producer.clone());
        pool.get_store("main").put(b"k", b"v").unwrap();
        pool.flush(b"id-1").unwrap();
        pool.get_store("main").put(b"lost", b"x").unwrap();

        drop(pool);
        let pool = pool_over(producer);
        let store = pool.get_store("main");
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get(b"lost").unwrap(), None);
    }

    #[test]
    fn dirty_marker_is_refused() {
        let producer = MemProducer::new();
        let pool = pool_over(producer.clone());
        pool.get_store("main").put(b"k", b"v").unwrap();
        pool.flush(b"id-1").unwrap();

        // simulate a crash mid-flush by resurrecting a dirty marker
        let bare = DbProducer::open(producer.as_ref(), "main").unwrap();
        bare.put(MARKER_KEY, b"dirtyid-1id-2").unwrap();

        drop(pool);
        let pool = pool_over(producer);
        let err = pool.check_consistency().unwrap_err();
        assert!(matches!(err, KvError::Corruption(_)));
    }

    #[test]
    fn disagreeing_markers_are_refused() {
        let producer = MemProducer::new();
        let pool = pool_over(producer.clone());
        pool.get_store("one").put(b"k", b"v").unwrap();
        pool.get_store("two").put(b"k", b"v").unwrap();
        pool.flush(b"id-1").unwrap();

        let bare = DbProducer::open(producer.as_ref(), "two").unwrap();
        bare.put(MARKER_KEY, b"id-0").unwrap();

        drop(pool);
        let pool = pool_over(producer);
        assert!(pool.check_consistency().is_err());
    }

    #[test]
    fn queued_drop_happens_at_flush() {
        let producer = MemProducer::new();
        let pool = pool_over(producer.clone());
        pool.get_store("doomed").put(b"k", b"v").unwrap();
        pool.flush(b"id-1").unwrap();
        assert!(producer.names().unwrap().contains(&"doomed".to_string()));

        pool.drop_store("doomed");
        // still present until the flush performs the drop
        assert!(producer.names().unwrap().contains(&"doomed".to_string()));
        pool.flush(b"id-2").unwrap();
        assert!(!producer.names().unwrap().contains(&"doomed".to_string()));
    }

    #[test]
    fn size_trigger_fires() {
        let producer = MemProducer::new();
        let pool =
            FlushablePool::open(producer.clone(), Duration::from_secs(3600), 64).unwrap();
        let store = pool.get_store("main");

        assert!(!pool.flush_if_needed(b"id-1").unwrap());
        store.put(b"key", &vec![0u8; 128]).unwrap();
        assert!(pool.flush_if_needed(b"id-2").unwrap());
        assert_eq!(pool.check_consistency().unwrap(), Some(b"id-2".to_vec()));
    }

    #[test]
    fn never_flushed_store_is_forgotten_on_drop() {
        let producer = MemProducer::new();
        let pool = pool_over(producer.clone());
        pool.get_store("ephemeral").put(b"k", b"v").unwrap();
        pool.drop_store("ephemeral");
        pool.flush(b"id-1").unwrap();
        assert!(!producer.names().unwrap().contains(&"ephemeral".to_string()));
    }
}
