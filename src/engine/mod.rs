//! The consensus engine: event processing pipeline, election driving,
//! block emission, epoch changes.
//!
//! Exactly one writer mutates consensus state at any time (`&mut self` on
//! `process_event`); readers query the store and engine getters. The engine
//! internally enforces topological delivery of roots to the election and
//! replays stored roots from the index after every decided frame.

pub mod election;
pub(crate) mod frames;
pub(crate) mod ordering;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::check::{CheckContext, Checkers, ValidationError};
use crate::config::EngineConfig;
use crate::constants;
use crate::error::ClothoError;
use crate::event::{codec, Event, EventHeader, EventId};
use crate::store::{scores::poi_period, Block, DagStore, GasPowerState, PutOutcome};
use crate::validators::{ValidatorId, Validators};
use crate::vecclock::{self, HighestEntry};

use election::{AtroposDecision, Election, RootAndSlot, RootObserver};

/// Result of applying a block in the application layer.
#[derive(Clone, Debug, Default)]
pub struct BlockResult {
    pub state_root: crate::Hash,
    pub skipped_txs: Vec<u32>,
    pub gas_used: u64,
    /// Validator set for the next epoch, applied at the epoch-change frame.
    pub new_validators: Option<Validators>,
}

/// Inbound interface of the application layer.
pub trait ApplicationCallbacks {
    /// Execute a block's transactions. The state root is load-bearing:
    /// missing the callback deadline here is fatal.
    fn apply_block(&mut self, block: &Block) -> Result<BlockResult, ClothoError>;

    /// Provide the validator set of an epoch.
    fn select_validators_group(&mut self, epoch: u32) -> Result<Validators, ClothoError>;

    /// Lightweight index hook, invoked once per confirmed event.
    fn on_event_confirmed(&mut self, _id: &EventId) {}

    /// Gating hook: a vetoed event stays unconfirmed.
    fn is_event_allowed_into_block(&mut self, _id: &EventId) -> bool {
        true
    }
}

/// Cooperative shutdown signal; long iterations check it and return cleanly.
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        ShutdownFlag::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Observes the DAG for the election through the store and vector clocks.
struct EngineObserver<'a> {
    store: &'a DagStore,
    validators: &'a Validators,
}

impl RootObserver for EngineObserver<'_> {
    fn observed_root(
        &self,
        observer: &EventId,
        frame: u32,
        creator: &ValidatorId,
    ) -> Result<Option<EventId>, ClothoError> {
        let mut found = None;
        let mut err = None;
        self.store.for_each_root_from(frame, creator, &mut |id| {
            match vecclock::forkless_cause(self.store, self.validators, observer, &id) {
                Ok(true) => {
                    found = Some(id);
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    err = Some(e);
                    false
                }
            }
        })?;
        match err {
            Some(e) => Err(e),
            None => Ok(found),
        }
    }

    fn observed_roots(
        &self,
        observer: &EventId,
        frame: u32,
    ) -> Result<Vec<RootAndSlot>, ClothoError> {
        let mut out = Vec::new();
        let mut err = None;
        self.store.for_each_root_at(frame, &mut |creator, id| {
            match vecclock::forkless_cause(self.store, self.validators, observer, &id) {
                Ok(true) => {
                    out.push(RootAndSlot { id, frame, creator });
                    true
                }
                Ok(false) => true,
                Err(e) => {
                    err = Some(e);
                    false
                }
            }
        })?;
        match err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

/// The consensus engine.
pub struct Engine<C: ApplicationCallbacks> {
    cfg: EngineConfig,
    store: Arc<DagStore>,
    callbacks: C,
    checkers: Checkers,
    validators: Validators,
    pending_validators: Option<Validators>,
    election: Election,
    shutdown: ShutdownFlag,
    last_block: u64,
    last_atropos: Option<EventId>,
}

impl<C: ApplicationCallbacks> Engine<C> {
    /// Bootstrap the engine over a store: load the epoch, ask the
    /// application for the validator set, and rebuild election state from
    /// the persisted roots index.
    pub fn new(
        store: Arc<DagStore>,
        cfg: EngineConfig,
        mut callbacks: C,
    ) -> Result<Self, ClothoError> {
        let epoch = store.epoch();

        let started = Instant::now();
        let validators = callbacks
            .select_validators_group(epoch)?
            .with_ratio(cfg.supermajority_num, cfg.supermajority_den);
        if started.elapsed() > cfg.callback_deadline() {
            warn!("select_validators_group exceeded its deadline; proceeding");
        }
        if validators.is_empty() {
            return Err(ClothoError::Invariant("empty validator set".into()));
        }

        let (last_block, last_atropos) = match store.last_block()? {
            Some(last) => (last.index, Some(last.atropos)),
            None => (0, None),
        };
        let frame_to_decide = match last_atropos {
            Some(atropos) => match store.get_header(&atropos)? {
                Some(header) => header.frame + 1,
                None => constants::FIRST_FRAME, // epoch rotated since
            },
            None => constants::FIRST_FRAME,
        };

        let mut engine = Engine {
            checkers: Checkers::new(cfg.clone()),
            election: Election::new(validators.clone(), frame_to_decide),
            cfg,
            store,
            callbacks,
            validators,
            pending_validators: None,
            shutdown: ShutdownFlag::new(),
            last_block,
            last_atropos,
        };
        engine.replay_stored_roots()?;
        info!(
            epoch,
            last_block = engine.last_block,
            frame_to_decide = engine.election.frame_to_decide(),
            "engine bootstrapped"
        );
        Ok(engine)
    }

    pub fn epoch(&self) -> u32 {
        self.store.epoch()
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    pub fn last_block_index(&self) -> u64 {
        self.last_block
    }

    pub fn last_atropos(&self) -> Option<EventId> {
        self.last_atropos
    }

    pub fn frame_to_decide(&self) -> u32 {
        self.election.frame_to_decide()
    }

    pub fn store(&self) -> &Arc<DagStore> {
        &self.store
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Final shutdown: raise the cooperative signal and force one clean
    /// flush so restart resumes from the last decided state. Drivers call
    /// this before exiting, including on fatal errors.
    pub fn stop(&mut self) -> Result<(), ClothoError> {
        self.shutdown.trigger();
        let flush_id = self.last_atropos.map(|a| a.0.to_vec());
        self.store.commit(flush_id.as_deref(), true)?;
        Ok(())
    }

    /// Fill the derived header fields of an event under construction:
    /// version, epoch, gas power remainder, median time, frame, root flag.
    /// Mirrors what `process_event` will verify on the way back in.
    pub fn prepare(&self, mut header: EventHeader) -> Result<EventHeader, ClothoError> {
        header.version = constants::PROTOCOL_VERSION;
        header.epoch = self.store.epoch();

        let ctx = CheckContext {
            store: &self.store,
            validators: &self.validators,
            epoch: header.epoch,
        };
        let available = self.checkers.available_gas_power(&header, &ctx)?;
        if header.gas_power_used > available {
            return Err(ValidationError::TooMuchGasUsed {
                used: header.gas_power_used,
                available,
            }
            .into());
        }
        header.gas_power_left = available - header.gas_power_used;

        let hb = vecclock::merge_parents(&self.store, &self.validators, &header, &EventId::ZERO)?;
        header.median_time = self.median_time_of(&hb, header.claimed_time)?;
        let (frame, is_root) = frames::assign_frame(&self.store, &self.validators, &header, &hb)?;
        header.frame = frame;
        header.is_root = is_root;
        Ok(header)
    }

    /// Stake-weighted median of the claimed times of the highest observed
    /// events; `own_time` stands in for the event itself.
    fn median_time_of(&self, hb: &[HighestEntry], own_time: u64) -> Result<u64, ClothoError> {
        let mut observed: Vec<(u64, u64)> = Vec::new();
        let mut total = 0u64;
        for (i, v) in self.validators.sorted_ids().enumerate() {
            let entry = &hb[i];
            if entry.seq == 0 {
                continue;
            }
            let time = if entry.id.is_zero() {
                own_time
            } else {
                self.store
                    .get_header(&entry.id)?
                    .map(|h| h.claimed_time)
                    .unwrap_or(own_time)
            };
            let stake = self.validators.stake_of(v);
            observed.push((time, stake));
            total += stake;
        }
        if observed.is_empty() {
            return Ok(own_time);
        }
        observed.sort_unstable();
        let mut acc = 0u64;
        for (time, stake) in &observed {
            acc += stake;
            if acc * 2 >= total {
                return Ok(*time);
            }
        }
        Ok(observed[observed.len() - 1].0)
    }

    /// Process one event: validate, derive metadata, persist, feed the
    /// election, emit any decided blocks. The caller supplies events in
    /// topological order.
    pub fn process_event(&mut self, e: Event) -> Result<(), ClothoError> {
        let id = e.id();
        if self.store.has_event(&id)? {
            return Ok(()); // idempotent
        }

        let ctx = CheckContext {
            store: &self.store,
            validators: &self.validators,
            epoch: self.store.epoch(),
        };
        self.checkers.validate(&e, &ctx)?;
        codec::verify_roundtrip(&e.header)?;

        let hb = vecclock::merge_parents(&self.store, &self.validators, &e.header, &id)?;
        let (frame, is_root) = frames::assign_frame(&self.store, &self.validators, &e.header, &hb)?;
        if frame != e.header.frame {
            return Err(ValidationError::FrameMismatch {
                claimed: e.header.frame,
                computed: frame,
            }
            .into());
        }
        if is_root != e.header.is_root {
            return Err(ValidationError::RootMismatch {
                claimed: e.header.is_root,
                computed: is_root,
            }
            .into());
        }

        let outcome = self.store.put_event(&e, self.cfg.fork_tolerance)?;
        if outcome == PutOutcome::AlreadyKnown {
            return Ok(());
        }
        vecclock::insert_event(&self.store, &self.validators, &e.header, &id, hb)?;
        self.store.set_gas_power(
            &e.header.creator,
            GasPowerState {
                left: e.header.gas_power_left,
                last_time: e.header.claimed_time,
            },
        )?;

        if is_root {
            self.store.add_root(frame, &e.header.creator, &id)?;
            self.deliver_root(RootAndSlot {
                id,
                frame,
                creator: e.header.creator,
            })?;
        }

        let flush_id = self.last_atropos.map(|a| a.0.to_vec());
        self.store.commit(flush_id.as_deref(), false)?;
        Ok(())
    }

    fn deliver_root(&mut self, root: RootAndSlot) -> Result<(), ClothoError> {
        let decision = {
            let observer = EngineObserver {
                store: &*self.store,
                validators: &self.validators,
            };
            self.election.process_root(&observer, root)?
        };
        if let Some(decision) = decision {
            self.handle_decision(decision)?;
            self.replay_stored_roots()?;
        }
        Ok(())
    }

    /// Re-deliver stored roots above the frame under election, in ascending
    /// (frame, creator) order, until no further frame decides. Used after
    /// every reset and at bootstrap.
    fn replay_stored_roots(&mut self) -> Result<(), ClothoError> {
        'outer: loop {
            if self.shutdown.is_shutdown() {
                return Ok(());
            }
            let from = self.election.frame_to_decide() + 1;
            let mut roots = Vec::new();
            self.store.for_each_root(from, &mut |frame, creator, id| {
                roots.push(RootAndSlot { id, frame, creator });
                true
            })?;
            for root in roots {
                let decision = {
                    let observer = EngineObserver {
                        store: &*self.store,
                        validators: &self.validators,
                    };
                    self.election.process_root(&observer, root)?
                };
                if let Some(decision) = decision {
                    self.handle_decision(decision)?;
                    continue 'outer;
                }
            }
            return Ok(());
        }
    }

    /// A frame decided: order its block, hand it to the application, update
    /// scores, advance the election, maybe change epoch.
    fn handle_decision(&mut self, decision: AtroposDecision) -> Result<(), ClothoError> {
        let index = self.last_block + 1;
        info!(
            frame = decision.frame,
            atropos = %decision.atropos,
            block = index,
            "frame decided"
        );

        let events = {
            let Engine {
                store,
                validators,
                callbacks,
                ..
            } = self;
            let mut allowed = |id: &EventId| callbacks.is_event_allowed_into_block(id);
            ordering::collect_block_events(store, validators, &decision.atropos, &mut allowed)?
        };
        let timestamp = ordering::median_claimed_time(&self.store, &decision.atropos)?;

        let mut block = Block {
            index,
            atropos: decision.atropos,
            events,
            timestamp,
            gas_used: 0,
            skipped_txs: Vec::new(),
            state_root: [0u8; 32],
        };

        let started = Instant::now();
        let result = self.callbacks.apply_block(&block)?;
        if started.elapsed() > self.cfg.callback_deadline() {
            // the state root is load-bearing; a late one cannot be trusted
            return Err(ClothoError::Callback(format!(
                "apply_block deadline exceeded for block {}",
                index
            )));
        }
        block.state_root = result.state_root;
        block.skipped_txs = result.skipped_txs;
        block.gas_used = result.gas_used;

        self.store.set_block(&block)?;
        for id in &block.events {
            self.store.mark_confirmed(id)?;
            let started = Instant::now();
            self.callbacks.on_event_confirmed(id);
            if started.elapsed() > self.cfg.callback_deadline() {
                warn!(event = %id, "on_event_confirmed exceeded its deadline; proceeding");
            }
        }

        self.update_scores(&block)?;
        self.last_block = index;
        self.last_atropos = Some(decision.atropos);
        self.election
            .reset(self.validators.clone(), decision.frame + 1);

        if let Some(next) = result.new_validators {
            self.pending_validators = Some(next);
        }
        let blocks_in_epoch = index - self.store.epoch_start_block()?;
        if blocks_in_epoch >= self.cfg.epoch_length {
            self.change_epoch(block.timestamp)?;
        }

        self.store
            .commit(Some(decision.atropos.as_bytes().as_slice()), false)?;
        Ok(())
    }

    /// Post-block validator bookkeeping: participation, dirty scores with
    /// bounded catch-up, address gas, POI.
    fn update_scores(&mut self, block: &Block) -> Result<(), ClothoError> {
        let mut participants: HashSet<ValidatorId> = HashSet::new();
        for id in &block.events {
            let header = self.store.get_header(id)?.ok_or_else(|| {
                ClothoError::Invariant(format!("scores: missing header for {}", id))
            })?;
            participants.insert(header.creator);
            let gas = self.store.get_address_gas_used(&header.creator)?;
            self.store
                .set_address_gas_used(&header.creator, gas.saturating_add(header.gas_power_used))?;
        }

        let period = poi_period(block.timestamp);
        self.store.add_poi_gas_used(period, block.gas_used)?;

        let ids: Vec<ValidatorId> = self.validators.sorted_ids().copied().collect();
        for v in ids {
            if !participants.contains(&v) {
                self.store.inc_blocks_missed(&v)?;
                continue;
            }
            let missed = self.store.get_blocks_missed(&v)?;
            self.store.add_dirty_validator_score(&v, block.gas_used)?;
            if missed >= 2 {
                // bounded catch-up: credit one previous block at most
                if let Some(prev) = self.store.get_block(block.index - 1)? {
                    self.store.add_dirty_validator_score(&v, prev.gas_used)?;
                }
            }
            self.store.reset_blocks_missed(&v)?;
            self.store.calc_validator_poi(&v, period)?;
        }

        // periodic score checkpoint
        let checkpoint = self.store.get_score_checkpoint()?;
        let interval_nanos = self.cfg.score_checkpoint_interval_secs * 1_000_000_000;
        if checkpoint == 0 {
            self.store.set_score_checkpoint(block.timestamp)?;
        } else if block.timestamp.saturating_sub(checkpoint) >= interval_nanos {
            self.store.move_dirty_scores_to_active()?;
            self.store.set_score_checkpoint(block.timestamp)?;
        }
        Ok(())
    }

    /// Epoch change: final score checkpoint, dirty → active migration,
    /// epoch store rotation, validator refresh, election reset to frame 1.
    fn change_epoch(&mut self, timestamp: u64) -> Result<(), ClothoError> {
        let old_epoch = self.store.epoch();
        let new_epoch = old_epoch + 1;
        info!(old_epoch, new_epoch, "epoch change");

        self.store.set_score_checkpoint(timestamp)?;
        self.store.move_dirty_scores_to_active()?;
        self.store.rotate_epoch(new_epoch)?;
        self.store.set_epoch_start_block(self.last_block)?;

        self.validators = match self.pending_validators.take() {
            Some(next) => next,
            None => {
                let started = Instant::now();
                let next = self.callbacks.select_validators_group(new_epoch)?;
                if started.elapsed() > self.cfg.callback_deadline() {
                    warn!("select_validators_group exceeded its deadline; proceeding");
                }
                next
            }
        }
        .with_ratio(self.cfg.supermajority_num, self.cfg.supermajority_den);
        if self.validators.is_empty() {
            return Err(ClothoError::Invariant("empty validator set".into()));
        }

        self.election
            .reset(self.validators.clone(), constants::FIRST_FRAME);

        let flush_id = self.last_atropos.map(|a| a.0.to_vec());
        self.store.commit(flush_id.as_deref(), true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::ValidatorId;

    fn vid(tag: u8) -> ValidatorId {
        ValidatorId([tag; 20])
    }

    /// Minimal application: records blocks, returns fixed execution results.
    struct SimApp {
        validators: Validators,
        blocks: Vec<Block>,
        confirmed: Vec<EventId>,
    }

    impl SimApp {
        fn new(validators: Validators) -> Self {
            SimApp {
                validators,
                blocks: Vec::new(),
                confirmed: Vec::new(),
            }
        }
    }

    impl ApplicationCallbacks for &mut SimApp {
        fn apply_block(&mut self, block: &Block) -> Result<BlockResult, ClothoError> {
            self.blocks.push(block.clone());
            Ok(BlockResult {
                state_root: crate::hash_domain(b"test.state", &block.index.to_be_bytes()),
                skipped_txs: vec![],
                gas_used: 21_000,
                new_validators: None,
            })
        }

        fn select_validators_group(&mut self, _epoch: u32) -> Result<Validators, ClothoError> {
            Ok(self.validators.clone())
        }

        fn on_event_confirmed(&mut self, id: &EventId) {
            self.confirmed.push(*id);
        }
    }

    fn single_validator() -> Validators {
        let mut vv = Validators::new();
        vv.set(vid(1), 1);
        vv
    }

    /// Build, prepare and process a chain event for the single validator.
    fn push_chain_event(
        engine: &mut Engine<&mut SimApp>,
        seq: u32,
        parent: Option<EventId>,
    ) -> EventId {
        let header = EventHeader {
            seq,
            lamport: seq,
            claimed_time: seq as u64 * 1_000_000_000,
            creator: vid(1),
            parents: parent.into_iter().collect(),
            ..EventHeader::default()
        };
        let header = engine.prepare(header).unwrap();
        let event = Event {
            header,
            ..Event::default()
        };
        let id = event.id();
        engine.process_event(event).unwrap();
        id
    }

    #[test]
    fn single_validator_decides_every_frame() {
        let mut app = SimApp::new(single_validator());
        let store = Arc::new(DagStore::open_mem());
        let mut engine = Engine::new(store, EngineConfig::default(), &mut app).unwrap();

        let mut parent = None;
        let mut ids = Vec::new();
        for seq in 1..=6u32 {
            let id = push_chain_event(&mut engine, seq, parent);
            ids.push(id);
            parent = Some(id);
        }

        // every event is a root of its own frame
        for (i, id) in ids.iter().enumerate() {
            let header = engine.store().get_header(id).unwrap().unwrap();
            assert!(header.is_root);
            assert_eq!(header.frame, (i + 1) as u32);
        }
        assert_eq!(engine.last_block_index(), 4);
        assert_eq!(engine.frame_to_decide(), 5);
        drop(engine);

        // frames decide two frames behind the tip; each block holds one event
        assert_eq!(app.blocks.len(), 4);
        for (i, block) in app.blocks.iter().enumerate() {
            assert_eq!(block.index, (i + 1) as u64);
            assert_eq!(block.events, vec![ids[i]]);
            assert_eq!(block.atropos, ids[i]);
            assert_eq!(block.gas_used, 21_000);
        }
        assert_eq!(app.confirmed.len(), 4);
    }

    #[test]
    fn epoch_changes_after_configured_blocks() {
        let mut app = SimApp::new(single_validator());
        let store = Arc::new(DagStore::open_mem());
        let cfg = EngineConfig {
            epoch_length: 2,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(store, cfg, &mut app).unwrap();

        let mut parent = None;
        for seq in 1..=4u32 {
            let id = push_chain_event(&mut engine, seq, parent);
            parent = Some(id);
        }
        // blocks 1 and 2 decided within epoch 1, then the epoch rotates and
        // per-epoch state resets
        assert_eq!(engine.epoch(), 2);
        assert!(engine.store().get_heads().unwrap().is_empty());
        assert_eq!(engine.frame_to_decide(), crate::constants::FIRST_FRAME);

        // the next epoch starts a fresh parentless chain at frame 1
        let id = push_chain_event(&mut engine, 1, None);
        let header = engine.store().get_header(&id).unwrap().unwrap();
        assert_eq!(header.epoch, 2);
        assert_eq!(header.frame, 1);
        assert!(header.is_root);
    }

    #[test]
    fn mismatched_claimed_frame_is_rejected() {
        let mut app = SimApp::new(single_validator());
        let store = Arc::new(DagStore::open_mem());
        let mut engine = Engine::new(store, EngineConfig::default(), &mut app).unwrap();

        let header = EventHeader {
            seq: 1,
            lamport: 1,
            claimed_time: 1_000_000_000,
            creator: vid(1),
            ..EventHeader::default()
        };
        let mut header = engine.prepare(header).unwrap();
        header.frame += 1; // lie about the frame
        let event = Event {
            header,
            ..Event::default()
        };
        assert!(matches!(
            engine.process_event(event),
            Err(ClothoError::Validation(ValidationError::FrameMismatch { .. }))
        ));
    }

    #[test]
    fn engine_restart_resumes_election() {
        let mut app = SimApp::new(single_validator());
        let store = Arc::new(DagStore::open_mem());
        let mut engine =
            Engine::new(store.clone(), EngineConfig::default(), &mut app).unwrap();

        let mut parent = None;
        for seq in 1..=4u32 {
            let id = push_chain_event(&mut engine, seq, parent);
            parent = Some(id);
        }
        let decided_before = engine.last_block_index();
        let ftd_before = engine.frame_to_decide();
        let atropos = engine.last_atropos().unwrap();
        engine.stop().unwrap();
        drop(engine);

        // the clean shutdown flushed under the last decided Atropos
        assert_eq!(
            store.check_consistency().unwrap(),
            Some(atropos.0.to_vec())
        );

        let mut engine = Engine::new(store, EngineConfig::default(), &mut app).unwrap();
        assert_eq!(engine.last_block_index(), decided_before);
        assert_eq!(engine.frame_to_decide(), ftd_before);

        // the chain keeps extending after the restart
        let id = push_chain_event(&mut engine, 5, parent);
        assert!(engine.store().get_header(&id).unwrap().unwrap().is_root);
        assert_eq!(engine.last_block_index(), decided_before + 1);
    }
}
