//! Persistent DAG store over the flushable KV pool.
//!
//! Two logical tablespaces: the permanent `main` store and a per-epoch
//! `epoch-<N>` store dropped wholesale at epoch change. Tables are carved
//! out with explicit key prefixes registered at open — never by reflection.
//! Events, headers and blocks get LRU read caches sized from configuration.

pub mod roots;
pub mod scores;

use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StoreConfig;
use crate::event::codec::{self, CodecError};
use crate::event::{Event, EventId};
use crate::kvdb::{CachedTable, FlushablePool, KeyValueStore, KvError, TableStore};
use crate::validators::ValidatorId;
use crate::vecclock::HighestEntry;
use crate::Hash;

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("encoding: {0}")]
    Encoding(String),
    #[error("stored bytes corrupt: {0}")]
    Codec(#[from] CodecError),
    #[error("conflicting event by {creator} at seq {seq} (fork)")]
    Fork { creator: ValidatorId, seq: u32 },
    #[error("event not found: {0}")]
    MissingEvent(EventId),
    #[error("store corrupted: {0}")]
    Corrupted(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of inserting an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Idempotent insert of an already-known event.
    AlreadyKnown,
    /// A conflicting (creator, seq) exists; the event was stored and the
    /// creator registered as forked.
    ForkRegistered,
}

/// A totally ordered block of confirmed events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// The elected Atropos event anchoring this block.
    pub atropos: EventId,
    /// Confirmed event ids in their deterministic total order.
    pub events: Vec<EventId>,
    /// Median of the Atropos's and its parents' claimed times, unix nanos.
    pub timestamp: u64,
    pub gas_used: u64,
    /// Transaction indices the executor skipped, reported back by the app.
    pub skipped_txs: Vec<u32>,
    /// State root after execution, reported back by the app.
    pub state_root: Hash,
}

impl Block {
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("block serialization cannot fail");
        crate::hash_domain(b"clotho.block", &bytes)
    }
}

/// Pointer to the last emitted block, kept in store metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LastBlockRef {
    pub index: u64,
    pub atropos: EventId,
}

/// Per-creator gas power accounting state.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct GasPowerState {
    pub left: u64,
    /// Claimed time of the creator's latest event, unix nanos.
    pub last_time: u64,
}

/// Stored record of a full event: compact header bytes plus payload.
#[derive(Serialize, Deserialize)]
struct StoredEvent {
    header: Vec<u8>,
    transactions: Vec<Vec<u8>>,
    sig: Vec<u8>,
}

const MAIN_STORE: &str = "main";

fn epoch_store_name(epoch: u32) -> String {
    format!("epoch-{}", epoch)
}

pub(crate) struct MainTables {
    pub events: Arc<dyn KeyValueStore>,
    pub blocks: Arc<dyn KeyValueStore>,
    pub block_index: Arc<dyn KeyValueStore>,
    pub receipts: Arc<dyn KeyValueStore>,
    pub score_active: Arc<dyn KeyValueStore>,
    pub score_dirty: Arc<dyn KeyValueStore>,
    pub blocks_missed: Arc<dyn KeyValueStore>,
    pub score_checkpoint: Arc<dyn KeyValueStore>,
    pub addr_gas_used: Arc<dyn KeyValueStore>,
    pub poi_gas_total: Arc<dyn KeyValueStore>,
    pub poi_score: Arc<dyn KeyValueStore>,
    pub meta: Arc<dyn KeyValueStore>,
}

pub(crate) struct EpochTables {
    pub epoch: u32,
    pub headers: Arc<dyn KeyValueStore>,
    pub heads: Arc<dyn KeyValueStore>,
    pub creator_seq: Arc<dyn KeyValueStore>,
    pub last_events: Arc<dyn KeyValueStore>,
    pub roots: Arc<dyn KeyValueStore>,
    pub confirmed: Arc<dyn KeyValueStore>,
    pub vc_highest: Arc<dyn KeyValueStore>,
    pub vc_lowest: Arc<dyn KeyValueStore>,
    pub gas_power: Arc<dyn KeyValueStore>,
    pub forks: Arc<dyn KeyValueStore>,
}

fn open_main(pool: &FlushablePool, cfg: &StoreConfig) -> MainTables {
    let db: Arc<dyn KeyValueStore> = pool.get_store(MAIN_STORE);
    let table = |prefix: &[u8]| TableStore::new(db.clone(), prefix) as Arc<dyn KeyValueStore>;
    MainTables {
        events: CachedTable::new(table(b"event/"), cfg.cache_sizes.events),
        blocks: CachedTable::new(table(b"block/"), cfg.cache_sizes.blocks),
        block_index: table(b"blockidx/"),
        receipts: table(b"receipts/"),
        score_active: table(b"actscore/"),
        score_dirty: table(b"drtscore/"),
        blocks_missed: table(b"missed/"),
        score_checkpoint: table(b"checkpoint/"),
        addr_gas_used: table(b"addrgas/"),
        poi_gas_total: table(b"poigas/"),
        poi_score: table(b"poiscore/"),
        meta: table(b"meta/"),
    }
}

fn open_epoch(pool: &FlushablePool, cfg: &StoreConfig, epoch: u32) -> EpochTables {
    let db: Arc<dyn KeyValueStore> = pool.get_store(&epoch_store_name(epoch));
    let table = |prefix: &[u8]| TableStore::new(db.clone(), prefix) as Arc<dyn KeyValueStore>;
    EpochTables {
        epoch,
        headers: CachedTable::new(table(b"header/"), cfg.cache_sizes.headers),
        heads: table(b"heads/"),
        creator_seq: table(b"creatorseq/"),
        last_events: table(b"lastev/"),
        roots: table(b"roots/"),
        confirmed: table(b"confirmed/"),
        vc_highest: table(b"vchighest/"),
        vc_lowest: table(b"vclowest/"),
        gas_power: table(b"gaspower/"),
        forks: table(b"forks/"),
    }
}

/// The node's persistent DAG storage.
pub struct DagStore {
    pool: Arc<FlushablePool>,
    cfg: StoreConfig,
    pub(crate) main: MainTables,
    pub(crate) epoch: RwLock<EpochTables>,
    /// Serializes read-modify-write of on-disk counters.
    pub(crate) inc_mutex: Mutex<()>,
}

impl DagStore {
    /// Open the store over a pool. The current epoch is read from metadata;
    /// a fresh database starts at epoch 1.
    pub fn open(pool: Arc<FlushablePool>, cfg: StoreConfig) -> StoreResult<Self> {
        let main = open_main(&pool, &cfg);
        let epoch_n = match get_bin::<u32>(&*main.meta, b"epoch", cfg.kv_retries)? {
            Some(n) => n,
            None => {
                set_bin(&*main.meta, b"epoch", &crate::constants::FIRST_EPOCH, cfg.kv_retries)?;
                crate::constants::FIRST_EPOCH
            }
        };
        let epoch = open_epoch(&pool, &cfg, epoch_n);
        Ok(DagStore {
            pool,
            cfg,
            main,
            epoch: RwLock::new(epoch),
            inc_mutex: Mutex::new(()),
        })
    }

    /// In-memory store for tests and tools.
    pub fn open_mem() -> Self {
        let producer = crate::kvdb::MemProducer::new();
        let pool = FlushablePool::open(
            producer,
            std::time::Duration::from_secs(3600),
            usize::MAX,
        )
        .expect("mem pool cannot fail");
        Self::open(pool, StoreConfig::lite()).expect("mem store cannot fail")
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.read().expect("epoch tables poisoned").epoch
    }

    pub(crate) fn retries(&self) -> u32 {
        self.cfg.kv_retries
    }

    // ── Events ──────────────────────────────────────────────────────────

    /// Insert an event. Idempotent; a conflicting (creator, seq) registers
    /// a fork when `fork_tolerance` is set and fails otherwise.
    pub fn put_event(&self, e: &Event, fork_tolerance: bool) -> StoreResult<PutOutcome> {
        let id = e.id();
        if self.has_event(&id)? {
            return Ok(PutOutcome::AlreadyKnown);
        }
        let epoch = self.epoch.read().expect("epoch tables poisoned");

        let creator = e.header.creator;
        let seq = e.header.seq;
        let slot_key = creator_seq_key(&creator, seq);
        let mut outcome = PutOutcome::Inserted;
        match retry(self.cfg.kv_retries, || epoch.creator_seq.get(&slot_key))? {
            Some(existing) if existing.as_slice() != id.as_bytes() => {
                if !fork_tolerance {
                    return Err(StoreError::Fork { creator, seq });
                }
                self.register_fork(&epoch, &creator, seq)?;
                outcome = PutOutcome::ForkRegistered;
            }
            _ => {}
        }

        let header_raw = codec::encode_header(&e.header);
        let stored = StoredEvent {
            header: header_raw.clone(),
            transactions: e.transactions.clone(),
            sig: e.sig.clone(),
        };
        set_bin(&*self.main.events, id.as_bytes(), &stored, self.cfg.kv_retries)?;
        retry(self.cfg.kv_retries, || {
            epoch.headers.put(id.as_bytes(), &codec::wrap_envelope(&header_raw))
        })?;

        if outcome == PutOutcome::Inserted {
            retry(self.cfg.kv_retries, || {
                epoch.creator_seq.put(&slot_key, id.as_bytes())
            })?;
            set_bin(
                &*epoch.last_events,
                creator.as_bytes(),
                &(seq, id),
                self.cfg.kv_retries,
            )?;
        }

        // the new event is a leaf; its parents are not
        for parent in &e.header.parents {
            retry(self.cfg.kv_retries, || epoch.heads.delete(parent.as_bytes()))?;
        }
        retry(self.cfg.kv_retries, || epoch.heads.put(id.as_bytes(), &[]))?;

        Ok(outcome)
    }

    pub fn get_event(&self, id: &EventId) -> StoreResult<Option<Event>> {
        let Some(stored) =
            get_bin::<StoredEvent>(&*self.main.events, id.as_bytes(), self.cfg.kv_retries)?
        else {
            return Ok(None);
        };
        let header = codec::decode_header(&stored.header)?;
        Ok(Some(Event {
            header,
            transactions: stored.transactions,
            sig: stored.sig,
        }))
    }

    pub fn has_event(&self, id: &EventId) -> StoreResult<bool> {
        Ok(retry(self.cfg.kv_retries, || self.main.events.has(id.as_bytes()))?)
    }

    /// Header of an event in the current epoch (frame and root flag filled).
    pub fn get_header(&self, id: &EventId) -> StoreResult<Option<crate::event::EventHeader>> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        let Some(wrapped) = retry(self.cfg.kv_retries, || epoch.headers.get(id.as_bytes()))?
        else {
            return Ok(None);
        };
        let raw = codec::unwrap_envelope(&wrapped)?;
        Ok(Some(codec::decode_header(raw)?))
    }

    /// Current leaf events of the epoch.
    pub fn get_heads(&self) -> StoreResult<Vec<EventId>> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        let mut heads = Vec::new();
        epoch.heads.for_each_from(b"", &mut |k, _| {
            if let Some(id) = EventId::from_slice(k) {
                heads.push(id);
            }
            true
        })?;
        Ok(heads)
    }

    /// Latest (seq, id) of a creator in the current epoch.
    pub fn last_event_of(&self, creator: &ValidatorId) -> StoreResult<Option<(u32, EventId)>> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        get_bin(&*epoch.last_events, creator.as_bytes(), self.cfg.kv_retries)
    }

    pub fn last_seq_of(&self, creator: &ValidatorId) -> StoreResult<u32> {
        Ok(self.last_event_of(creator)?.map(|(seq, _)| seq).unwrap_or(0))
    }

    /// Id stored at a (creator, seq) slot, if any.
    pub fn event_at_slot(
        &self,
        creator: &ValidatorId,
        seq: u32,
    ) -> StoreResult<Option<EventId>> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        let raw = retry(self.cfg.kv_retries, || {
            epoch.creator_seq.get(&creator_seq_key(creator, seq))
        })?;
        Ok(raw.as_deref().and_then(EventId::from_slice))
    }

    fn register_fork(
        &self,
        epoch: &EpochTables,
        creator: &ValidatorId,
        seq: u32,
    ) -> StoreResult<()> {
        let prev = retry(self.cfg.kv_retries, || epoch.forks.get(creator.as_bytes()))?;
        let min_seq = match prev {
            Some(raw) if raw.len() == 4 => {
                seq.min(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            _ => seq,
        };
        tracing::warn!(creator = %creator, seq, "fork registered, demoting creator");
        retry(self.cfg.kv_retries, || {
            epoch.forks.put(creator.as_bytes(), &min_seq.to_be_bytes())
        })?;
        Ok(())
    }

    /// Lowest forked seq of a creator, if a fork was ever registered.
    pub fn forked_at(&self, creator: &ValidatorId) -> StoreResult<Option<u32>> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        let raw = retry(self.cfg.kv_retries, || epoch.forks.get(creator.as_bytes()))?;
        Ok(raw
            .filter(|r| r.len() == 4)
            .map(|r| u32::from_be_bytes([r[0], r[1], r[2], r[3]])))
    }

    // ── Confirmation marks ──────────────────────────────────────────────

    pub fn mark_confirmed(&self, id: &EventId) -> StoreResult<()> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        retry(self.cfg.kv_retries, || epoch.confirmed.put(id.as_bytes(), &[]))?;
        Ok(())
    }

    pub fn is_confirmed(&self, id: &EventId) -> StoreResult<bool> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        Ok(retry(self.cfg.kv_retries, || epoch.confirmed.has(id.as_bytes()))?)
    }

    // ── Vector clocks ───────────────────────────────────────────────────

    pub fn set_highest_before(&self, id: &EventId, vec: &[HighestEntry]) -> StoreResult<()> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        set_bin(&*epoch.vc_highest, id.as_bytes(), &vec.to_vec(), self.cfg.kv_retries)
    }

    pub fn get_highest_before(&self, id: &EventId) -> StoreResult<Option<Vec<HighestEntry>>> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        get_bin(&*epoch.vc_highest, id.as_bytes(), self.cfg.kv_retries)
    }

    pub fn set_lowest_after(&self, id: &EventId, vec: &[u32]) -> StoreResult<()> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        set_bin(&*epoch.vc_lowest, id.as_bytes(), &vec.to_vec(), self.cfg.kv_retries)
    }

    pub fn get_lowest_after(&self, id: &EventId) -> StoreResult<Option<Vec<u32>>> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        get_bin(&*epoch.vc_lowest, id.as_bytes(), self.cfg.kv_retries)
    }

    // ── Gas power ───────────────────────────────────────────────────────

    pub fn gas_power_of(&self, creator: &ValidatorId) -> StoreResult<Option<GasPowerState>> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        get_bin(&*epoch.gas_power, creator.as_bytes(), self.cfg.kv_retries)
    }

    pub fn set_gas_power(&self, creator: &ValidatorId, state: GasPowerState) -> StoreResult<()> {
        let epoch = self.epoch.read().expect("epoch tables poisoned");
        set_bin(&*epoch.gas_power, creator.as_bytes(), &state, self.cfg.kv_retries)
    }

    // ── Blocks ──────────────────────────────────────────────────────────

    pub fn set_block(&self, block: &Block) -> StoreResult<()> {
        set_bin(
            &*self.main.blocks,
            &block.index.to_be_bytes(),
            block,
            self.cfg.kv_retries,
        )?;
        retry(self.cfg.kv_retries, || {
            self.main
                .block_index
                .put(&block.hash(), &block.index.to_be_bytes())
        })?;
        set_bin(
            &*self.main.meta,
            b"last_block",
            &LastBlockRef {
                index: block.index,
                atropos: block.atropos,
            },
            self.cfg.kv_retries,
        )
    }

    pub fn get_block(&self, index: u64) -> StoreResult<Option<Block>> {
        get_bin(&*self.main.blocks, &index.to_be_bytes(), self.cfg.kv_retries)
    }

    pub fn get_block_index(&self, hash: &Hash) -> StoreResult<Option<u64>> {
        let raw = retry(self.cfg.kv_retries, || self.main.block_index.get(hash))?;
        Ok(raw.filter(|r| r.len() == 8).map(|r| {
            u64::from_be_bytes([r[0], r[1], r[2], r[3], r[4], r[5], r[6], r[7]])
        }))
    }

    pub fn last_block(&self) -> StoreResult<Option<LastBlockRef>> {
        get_bin(&*self.main.meta, b"last_block", self.cfg.kv_retries)
    }

    /// Block index at which the current epoch started.
    pub fn epoch_start_block(&self) -> StoreResult<u64> {
        Ok(get_bin(&*self.main.meta, b"epoch_start", self.cfg.kv_retries)?.unwrap_or(0))
    }

    pub fn set_epoch_start_block(&self, index: u64) -> StoreResult<()> {
        set_bin(&*self.main.meta, b"epoch_start", &index, self.cfg.kv_retries)
    }

    pub fn set_receipts(&self, block_index: u64, receipts: &[u8]) -> StoreResult<()> {
        retry(self.cfg.kv_retries, || {
            self.main.receipts.put(&block_index.to_be_bytes(), receipts)
        })?;
        Ok(())
    }

    pub fn get_receipts(&self, block_index: u64) -> StoreResult<Option<Vec<u8>>> {
        Ok(retry(self.cfg.kv_retries, || {
            self.main.receipts.get(&block_index.to_be_bytes())
        })?)
    }

    // ── Epoch rotation ──────────────────────────────────────────────────

    /// Drop all per-epoch indexes and open fresh ones for the new epoch.
    /// The drop of the old store is queued and performed at the next flush.
    pub fn rotate_epoch(&self, new_epoch: u32) -> StoreResult<()> {
        let mut epoch = self.epoch.write().expect("epoch tables poisoned");
        let old = epoch.epoch;
        self.pool.drop_store(&epoch_store_name(old));
        *epoch = open_epoch(&self.pool, &self.cfg, new_epoch);
        set_bin(&*self.main.meta, b"epoch", &new_epoch, self.cfg.kv_retries)?;
        info!(old_epoch = old, new_epoch, "epoch store rotated");
        Ok(())
    }

    // ── Commit ──────────────────────────────────────────────────────────

    /// Commit buffered writes through the pool. `id` is the recovery id —
    /// the engine passes the last decided Atropos hash; when absent, an
    /// eyecatcher-prefixed wall-clock id is used.
    pub fn commit(&self, id: Option<&[u8]>, immediate: bool) -> StoreResult<()> {
        let fallback;
        let id = match id {
            Some(id) => id,
            None => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64;
                let mut buf = Vec::with_capacity(10);
                buf.extend_from_slice(&[0xbe, 0xee]);
                buf.extend_from_slice(&nanos.to_be_bytes());
                fallback = buf;
                &fallback[..]
            }
        };
        if immediate {
            self.pool.flush(id)?;
        } else {
            self.pool.flush_if_needed(id)?;
        }
        Ok(())
    }

    /// Startup consistency check, delegated to the pool.
    pub fn check_consistency(&self) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.pool.check_consistency()?)
    }

    // ── Integrity ───────────────────────────────────────────────────────

    /// Visit every stored event of an epoch, ordered by id.
    pub fn for_each_epoch_event(
        &self,
        epoch: u32,
        f: &mut dyn FnMut(&Event) -> bool,
    ) -> StoreResult<()> {
        let prefix = epoch.to_be_bytes();
        let mut decode_err = None;
        self.main.events.for_each_prefix(&prefix, &mut |_, v| {
            let stored: StoredEvent = match bincode::deserialize(v) {
                Ok(s) => s,
                Err(e) => {
                    decode_err = Some(StoreError::Encoding(e.to_string()));
                    return false;
                }
            };
            let header = match codec::decode_header(&stored.header) {
                Ok(h) => h,
                Err(e) => {
                    decode_err = Some(StoreError::Codec(e));
                    return false;
                }
            };
            f(&Event {
                header,
                transactions: stored.transactions,
                sig: stored.sig,
            })
        })?;
        match decode_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Maintenance pass over the current epoch: recompute leaves against the
    /// heads table, check per-creator seq contiguity and parent lamports.
    pub fn check_integrity(&self) -> StoreResult<IntegritySummary> {
        use std::collections::{BTreeMap, HashSet};

        let epoch_n = self.epoch();
        let mut events = 0u64;
        let mut leaves: HashSet<EventId> = HashSet::new();
        let mut referenced: HashSet<EventId> = HashSet::new();
        let mut by_creator: BTreeMap<ValidatorId, Vec<u32>> = BTreeMap::new();
        let mut bad: Option<String> = None;

        self.for_each_epoch_event(epoch_n, &mut |e| {
            events += 1;
            leaves.insert(e.id());
            by_creator.entry(e.header.creator).or_default().push(e.header.seq);
            for p in &e.header.parents {
                referenced.insert(*p);
            }
            true
        })?;
        for p in &referenced {
            leaves.remove(p);
        }

        // parent lamports strictly below the child's
        self.for_each_epoch_event(epoch_n, &mut |e| {
            for p in &e.header.parents {
                match self.get_header(p) {
                    Ok(Some(ph)) if ph.lamport >= e.header.lamport => {
                        bad = Some(format!("lamport not monotonic at {}", e.id()));
                        return false;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        bad = Some(format!("parent header unreadable: {}", err));
                        return false;
                    }
                }
            }
            true
        })?;
        if let Some(msg) = bad {
            return Err(StoreError::Corrupted(msg));
        }

        // seq chains are gapless from 1, forked creators excepted
        for (creator, mut seqs) in by_creator {
            if self.forked_at(&creator)?.is_some() {
                continue;
            }
            seqs.sort_unstable();
            for (i, seq) in seqs.iter().enumerate() {
                if *seq != (i + 1) as u32 {
                    return Err(StoreError::Corrupted(format!(
                        "seq chain of {} has a gap at {}",
                        creator, seq
                    )));
                }
            }
        }

        let stored_heads: HashSet<EventId> = self.get_heads()?.into_iter().collect();
        if stored_heads != leaves {
            return Err(StoreError::Corrupted(format!(
                "heads table disagrees with recomputed leaves ({} vs {})",
                stored_heads.len(),
                leaves.len()
            )));
        }

        Ok(IntegritySummary {
            epoch: epoch_n,
            events,
            heads: leaves.len(),
        })
    }
}

/// Result of a successful integrity pass.
#[derive(Clone, Copy, Debug)]
pub struct IntegritySummary {
    pub epoch: u32,
    pub events: u64,
    pub heads: usize,
}

pub(crate) fn creator_seq_key(creator: &ValidatorId, seq: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(creator.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Retry transient I/O failures with a budget, then escalate.
pub(crate) fn retry<T>(
    retries: u32,
    mut op: impl FnMut() -> Result<T, KvError>,
) -> Result<T, KvError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(KvError::Io(msg)) if attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, "transient kv failure, retrying: {}", msg);
            }
            other => return other,
        }
    }
}

pub(crate) fn set_bin<T: Serialize>(
    table: &dyn KeyValueStore,
    key: &[u8],
    value: &T,
    retries: u32,
) -> StoreResult<()> {
    let raw = bincode::serialize(value).map_err(|e| StoreError::Encoding(e.to_string()))?;
    retry(retries, || table.put(key, &raw))?;
    Ok(())
}

pub(crate) fn get_bin<T: DeserializeOwned>(
    table: &dyn KeyValueStore,
    key: &[u8],
    retries: u32,
) -> StoreResult<Option<T>> {
    let Some(raw) = retry(retries, || table.get(key))? else {
        return Ok(None);
    };
    let value = bincode::deserialize(&raw).map_err(|e| StoreError::Encoding(e.to_string()))?;
    Ok(Some(value))
}
