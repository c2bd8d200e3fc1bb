//! Roots-by-frame index.
//!
//! Key layout: frame (4, big-endian) ∥ creator (20) ∥ event id (32), with an
//! empty value — ordered iteration by frame and by (frame, creator) falls
//! out of the key encoding. A creator fork may put two roots in the same
//! (frame, creator) slot; both are kept, the election collapses them.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::event::EventId;
use crate::validators::ValidatorId;

use super::{retry, DagStore, StoreError, StoreResult};

const FRAME_SIZE: usize = 4;
const ADDR_SIZE: usize = 20;
const EVENT_ID_SIZE: usize = 32;
const ROOT_KEY_SIZE: usize = FRAME_SIZE + ADDR_SIZE + EVENT_ID_SIZE;

fn root_key(frame: u32, creator: &ValidatorId, id: &EventId) -> [u8; ROOT_KEY_SIZE] {
    let mut key = [0u8; ROOT_KEY_SIZE];
    key[..FRAME_SIZE].copy_from_slice(&frame.to_be_bytes());
    key[FRAME_SIZE..FRAME_SIZE + ADDR_SIZE].copy_from_slice(creator.as_bytes());
    key[FRAME_SIZE + ADDR_SIZE..].copy_from_slice(id.as_bytes());
    key
}

fn parse_root_key(key: &[u8]) -> StoreResult<(u32, ValidatorId, EventId)> {
    if key.len() != ROOT_KEY_SIZE {
        return Err(StoreError::Corrupted(format!(
            "roots table: incorrect key len {}",
            key.len()
        )));
    }
    let frame = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
    let mut addr = [0u8; ADDR_SIZE];
    addr.copy_from_slice(&key[FRAME_SIZE..FRAME_SIZE + ADDR_SIZE]);
    let id = EventId::from_slice(&key[FRAME_SIZE + ADDR_SIZE..])
        .ok_or_else(|| StoreError::Corrupted("roots table: bad event id".into()))?;
    Ok((frame, ValidatorId(addr), id))
}

impl DagStore {
    /// Store a new root.
    pub fn add_root(&self, frame: u32, creator: &ValidatorId, id: &EventId) -> StoreResult<()> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        retry(self.retries(), || {
            epoch.roots.put(&root_key(frame, creator, id), &[])
        })?;
        Ok(())
    }

    /// True if the event is a stored root of the given slot.
    pub fn is_root(&self, frame: u32, creator: &ValidatorId, id: &EventId) -> StoreResult<bool> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        Ok(retry(self.retries(), || {
            epoch.roots.has(&root_key(frame, creator, id))
        })?)
    }

    /// Iterate roots starting at `frame`, in ascending (frame, creator, id)
    /// order, continuing into later frames until the callback stops.
    pub fn for_each_root(
        &self,
        frame: u32,
        f: &mut dyn FnMut(u32, ValidatorId, EventId) -> bool,
    ) -> StoreResult<()> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        let mut bad: Option<StoreError> = None;
        epoch.roots.for_each_from(&frame.to_be_bytes(), &mut |k, _| {
            match parse_root_key(k) {
                Ok((actual_frame, creator, id)) => {
                    debug_assert!(actual_frame >= frame);
                    f(actual_frame, creator, id)
                }
                Err(e) => {
                    bad = Some(e);
                    false
                }
            }
        })?;
        match bad {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Iterate the roots of exactly one frame.
    pub fn for_each_root_at(
        &self,
        frame: u32,
        f: &mut dyn FnMut(ValidatorId, EventId) -> bool,
    ) -> StoreResult<()> {
        self.for_each_root(frame, &mut |actual, creator, id| {
            if actual != frame {
                return false;
            }
            f(creator, id)
        })
    }

    /// Iterate the roots of one (frame, creator) slot.
    pub fn for_each_root_from(
        &self,
        frame: u32,
        creator: &ValidatorId,
        f: &mut dyn FnMut(EventId) -> bool,
    ) -> StoreResult<()> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        let mut prefix = Vec::with_capacity(FRAME_SIZE + ADDR_SIZE);
        prefix.extend_from_slice(&frame.to_be_bytes());
        prefix.extend_from_slice(creator.as_bytes());

        let mut bad: Option<StoreError> = None;
        epoch.roots.for_each_prefix(&prefix, &mut |k, _| {
            match parse_root_key(k) {
                Ok((_, _, id)) => f(id),
                Err(e) => {
                    bad = Some(e);
                    false
                }
            }
        })?;
        match bad {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Iterate the roots of one frame across worker threads. The callback
    /// must be thread-safe; it signals "stop" through an atomic flag shared
    /// by all workers.
    pub fn for_each_root_parallel(
        &self,
        frame: u32,
        f: &(dyn Fn(u32, ValidatorId, EventId) -> bool + Sync),
    ) -> StoreResult<()> {
        let mut entries: Vec<(u32, ValidatorId, EventId)> = Vec::new();
        self.for_each_root_at(frame, &mut |creator, id| {
            entries.push((frame, creator, id));
            true
        })?;
        if entries.is_empty() {
            return Ok(());
        }

        let workers = entries.len().min(4);
        let chunk = entries.len().div_ceil(workers);
        let stop = AtomicBool::new(false);

        let stop = &stop;
        std::thread::scope(|scope| {
            for part in entries.chunks(chunk) {
                scope.spawn(move || {
                    for (frame, creator, id) in part {
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        if !f(*frame, *creator, *id) {
                            stop.store(true, Ordering::Release);
                            return;
                        }
                    }
                });
            }
        });
        Ok(())
    }
}

/// Shared stop signal for cooperative cancellation of long iterations.
#[derive(Clone, Default)]
pub struct StopFlag {
    flag: std::sync::Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        StopFlag::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DagStore;

    fn vid(tag: u8) -> ValidatorId {
        ValidatorId([tag; 20])
    }

    fn eid(epoch: u32, tag: u8) -> EventId {
        let mut bytes = [tag; 32];
        bytes[..4].copy_from_slice(&epoch.to_be_bytes());
        EventId(bytes)
    }

    #[test]
    fn add_and_query_roots() {
        let store = DagStore::open_mem();
        store.add_root(1, &vid(1), &eid(1, 10)).unwrap();
        store.add_root(1, &vid(2), &eid(1, 11)).unwrap();
        store.add_root(2, &vid(1), &eid(1, 12)).unwrap();

        assert!(store.is_root(1, &vid(1), &eid(1, 10)).unwrap());
        assert!(!store.is_root(1, &vid(1), &eid(1, 12)).unwrap());

        let mut at_one = Vec::new();
        store
            .for_each_root_at(1, &mut |creator, id| {
                at_one.push((creator, id));
                true
            })
            .unwrap();
        assert_eq!(at_one, vec![(vid(1), eid(1, 10)), (vid(2), eid(1, 11))]);
    }

    #[test]
    fn iteration_spans_frames_in_order() {
        let store = DagStore::open_mem();
        store.add_root(2, &vid(1), &eid(1, 20)).unwrap();
        store.add_root(1, &vid(1), &eid(1, 10)).unwrap();
        store.add_root(3, &vid(1), &eid(1, 30)).unwrap();

        let mut frames = Vec::new();
        store
            .for_each_root(2, &mut |frame, _, _| {
                frames.push(frame);
                true
            })
            .unwrap();
        assert_eq!(frames, vec![2, 3]);
    }

    #[test]
    fn per_slot_iteration_sees_forked_roots() {
        let store = DagStore::open_mem();
        store.add_root(1, &vid(1), &eid(1, 10)).unwrap();
        store.add_root(1, &vid(1), &eid(1, 11)).unwrap();
        store.add_root(1, &vid(2), &eid(1, 12)).unwrap();

        let mut slot = Vec::new();
        store
            .for_each_root_from(1, &vid(1), &mut |id| {
                slot.push(id);
                true
            })
            .unwrap();
        assert_eq!(slot, vec![eid(1, 10), eid(1, 11)]);
    }

    #[test]
    fn parallel_iteration_stops_via_shared_flag() {
        let store = DagStore::open_mem();
        for tag in 0..8u8 {
            store.add_root(1, &vid(tag), &eid(1, tag + 10)).unwrap();
        }
        let counted = std::sync::atomic::AtomicUsize::new(0);
        store
            .for_each_root_parallel(1, &|_, _, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                false // stop everyone after the first hit per worker
            })
            .unwrap();
        let seen = counted.load(Ordering::SeqCst);
        assert!(seen >= 1 && seen <= 4, "seen {} callbacks", seen);
    }

    #[test]
    fn stop_flag_is_shared() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_stopped());
        clone.stop();
        assert!(flag.is_stopped());
    }
}
