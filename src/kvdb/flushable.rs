//! Write-buffered store wrapper.
//!
//! Every write lands in an in-memory overlay; readers see the union of the
//! overlay and the underlying store. Buffered writes reach the underlying
//! store only on `flush()`, which the pool drives under its marker protocol.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::{KeyValueStore, KvError, KvResult};

/// Overlay entry: `None` marks a buffered deletion.
type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

pub struct Flushable {
    under: RwLock<Option<Arc<dyn KeyValueStore>>>,
    overlay: RwLock<Overlay>,
    buffered: AtomicUsize,
}

impl Flushable {
    /// Wrap an underlying store. `None` starts the wrapper over nothing —
    /// the pool attaches the physical store at the first flush.
    pub fn new(under: Option<Arc<dyn KeyValueStore>>) -> Self {
        Flushable {
            under: RwLock::new(under),
            overlay: RwLock::new(BTreeMap::new()),
            buffered: AtomicUsize::new(0),
        }
    }

    /// Attach (or replace) the underlying store.
    pub fn set_underlying(&self, db: Arc<dyn KeyValueStore>) {
        *self.under.write().expect("flushable poisoned") = Some(db);
    }

    pub(crate) fn underlying(&self) -> Option<Arc<dyn KeyValueStore>> {
        self.under.read().expect("flushable poisoned").clone()
    }

    /// Move all buffered writes into the underlying store.
    pub fn flush(&self) -> KvResult<()> {
        let under = self
            .underlying()
            .ok_or_else(|| KvError::Corruption("flush without underlying store".into()))?;
        let drained: Overlay = {
            let mut overlay = self.overlay.write().expect("flushable poisoned");
            std::mem::take(&mut *overlay)
        };
        for (key, value) in drained {
            match value {
                Some(v) => under.put(&key, &v)?,
                None => under.delete(&key)?,
            }
        }
        self.buffered.store(0, Ordering::Relaxed);
        Ok(())
    }
}

impl KeyValueStore for Flushable {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        {
            let overlay = self.overlay.read().expect("flushable poisoned");
            if let Some(entry) = overlay.get(key) {
                return Ok(entry.clone());
            }
        }
        match self.underlying() {
            Some(under) => under.get(key),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.buffered
            .fetch_add(key.len() + value.len(), Ordering::Relaxed);
        self.overlay
            .write()
            .expect("flushable poisoned")
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.buffered.fetch_add(key.len(), Ordering::Relaxed);
        self.overlay
            .write()
            .expect("flushable poisoned")
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn for_each_from(
        &self,
        start: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> KvResult<()> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        if let Some(under) = self.underlying() {
            under.for_each_from(start, &mut |k, v| {
                merged.insert(k.to_vec(), v.to_vec());
                true
            })?;
        }
        {
            let overlay = self.overlay.read().expect("flushable poisoned");
            for (k, v) in overlay.range::<[u8], _>((Bound::Included(start), Bound::Unbounded)) {
                match v {
                    Some(val) => {
                        merged.insert(k.clone(), val.clone());
                    }
                    None => {
                        merged.remove(k);
                    }
                }
            }
        }
        for (k, v) in merged {
            if !f(&k, &v) {
                break;
            }
        }
        Ok(())
    }

    fn buffered_size(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }
}
