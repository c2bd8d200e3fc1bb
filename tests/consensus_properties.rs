//! Consensus property tests: DAG-driven verification of frame assignment,
//! Atropos election, block ordering, fork demotion, and determinism.
//!
//! These tests exercise the public engine API the way a node embedding the
//! library would: events are built with `prepare`, fed through
//! `process_event`, and the emitted block stream is inspected.
//!
//! Properties verified:
//! - **Roots and frames**: parentless events open frame 1; frames climb as
//!   events forkless-cause quorums of prior roots
//! - **Election**: the first decided Atropos is the smallest-hash frame-1
//!   root; later frames decide within two frames of DAG growth
//! - **Ordering**: block members are ancestors of their Atropos, ordered by
//!   (lamport, creator, id); forked events never enter a block
//! - **Determinism**: different topological delivery orders decide the same
//!   blocks

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use clotho::config::EngineConfig;
use clotho::engine::election::{Election, RootAndSlot, RootObserver};
use clotho::engine::{ApplicationCallbacks, BlockResult, Engine};
use clotho::error::ClothoError;
use clotho::event::{Event, EventHeader, EventId};
use clotho::store::{Block, DagStore};
use clotho::validators::{ValidatorId, Validators};

// ── Helpers ─────────────────────────────────────────────────────────────

fn vid(tag: u8) -> ValidatorId {
    ValidatorId([tag; 20])
}

fn flat_validators(n: u8) -> Validators {
    let mut vv = Validators::new();
    for tag in 1..=n {
        vv.set(vid(tag), 1);
    }
    vv
}

/// Application stub: records blocks behind a shared handle.
struct SimApp {
    validators: Validators,
    blocks: Arc<Mutex<Vec<Block>>>,
}

impl ApplicationCallbacks for SimApp {
    fn apply_block(&mut self, block: &Block) -> Result<BlockResult, ClothoError> {
        self.blocks.lock().unwrap().push(block.clone());
        Ok(BlockResult {
            state_root: clotho::hash_domain(b"sim.state", &block.index.to_be_bytes()),
            skipped_txs: vec![],
            gas_used: 1_000,
            new_validators: None,
        })
    }

    fn select_validators_group(&mut self, _epoch: u32) -> Result<Validators, ClothoError> {
        Ok(self.validators.clone())
    }
}

/// A little in-test network: builds valid events on top of the engine.
struct TestNet {
    engine: Engine<SimApp>,
    blocks: Arc<Mutex<Vec<Block>>>,
    next_seq: HashMap<u8, u32>,
    head_of: HashMap<u8, EventId>,
    lamport_of: HashMap<EventId, u32>,
    log: Vec<Event>,
}

impl TestNet {
    fn new(n_validators: u8, cfg: EngineConfig) -> Self {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let app = SimApp {
            validators: flat_validators(n_validators),
            blocks: blocks.clone(),
        };
        let store = Arc::new(DagStore::open_mem());
        let engine = Engine::new(store, cfg, app).unwrap();
        TestNet {
            engine,
            blocks,
            next_seq: HashMap::new(),
            head_of: HashMap::new(),
            lamport_of: HashMap::new(),
            log: Vec::new(),
        }
    }

    fn four_node() -> Self {
        TestNet::new(
            4,
            EngineConfig {
                max_parents: 4,
                ..EngineConfig::default()
            },
        )
    }

    /// Build, prepare and process an event; returns its id.
    fn emit(&mut self, creator: u8, other_parents: &[EventId]) -> EventId {
        let seq = *self.next_seq.entry(creator).or_insert(1);
        let mut parents: Vec<EventId> = Vec::new();
        if seq > 1 {
            parents.push(self.head_of[&creator]);
        }
        for p in other_parents {
            if !parents.contains(p) {
                parents.push(*p);
            }
        }
        let lamport = parents
            .iter()
            .map(|p| self.lamport_of[p])
            .max()
            .unwrap_or(0)
            + 1;
        let header = EventHeader {
            seq,
            lamport,
            claimed_time: lamport as u64 * 1_000_000_000 + creator as u64,
            creator: vid(creator),
            parents,
            ..EventHeader::default()
        };
        let header = self.engine.prepare(header).unwrap();
        let event = Event {
            header,
            ..Event::default()
        };
        let id = event.id();
        self.log.push(event.clone());
        self.engine.process_event(event).unwrap();
        self.next_seq.insert(creator, seq + 1);
        self.head_of.insert(creator, id);
        self.lamport_of.insert(id, lamport);
        id
    }

    /// One gossip round: every creator emits on top of all other heads.
    fn emit_round(&mut self, creators: &[u8]) {
        for &c in creators {
            let others: Vec<EventId> = creators
                .iter()
                .filter(|o| **o != c)
                .filter_map(|o| self.head_of.get(o).copied())
                .collect();
            self.emit(c, &others);
        }
    }

    fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().unwrap().clone()
    }
}

/// All ancestors of an event (inclusive), walked through the store.
fn ancestors_of(store: &DagStore, id: &EventId) -> HashSet<EventId> {
    let mut out = HashSet::new();
    let mut stack = vec![*id];
    while let Some(x) = stack.pop() {
        if !out.insert(x) {
            continue;
        }
        let header = store.get_header(&x).unwrap().unwrap();
        stack.extend(header.parents);
    }
    out
}

// ── Classic four-node steady state ──────────────────────────────────────

#[test]
fn classic_four_node_steady_state() {
    let mut net = TestNet::four_node();
    let creators = [1u8, 2, 3, 4];

    // epoch start: four parentless events, all roots of frame 1
    let mut first_roots = Vec::new();
    for &c in &creators {
        first_roots.push(net.emit(c, &[]));
    }
    for id in &first_roots {
        let header = net.engine.store().get_header(id).unwrap().unwrap();
        assert!(header.is_root, "first events must be roots");
        assert_eq!(header.frame, 1);
    }

    // steady gossip: everyone references everyone each round
    for _ in 0..8 {
        net.emit_round(&creators);
    }

    let blocks = net.blocks();
    assert!(
        blocks.len() >= 4,
        "four frames should have decided, got {} blocks",
        blocks.len()
    );

    // the frame-1 Atropos is the smallest-hash root among the first four
    let min_root = first_roots.iter().min().unwrap();
    assert_eq!(&blocks[0].atropos, min_root);

    // blocks are consecutively indexed and their members are ancestors of
    // the Atropos, ordered by (lamport, creator, id)
    let store = net.engine.store();
    let mut seen: HashSet<EventId> = HashSet::new();
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.index, (i + 1) as u64);
        assert!(block.timestamp > 0);
        assert!(block.events.contains(&block.atropos));

        let ancestors = ancestors_of(store, &block.atropos);
        let mut keys = Vec::new();
        for id in &block.events {
            assert!(ancestors.contains(id), "block member not ancestor of atropos");
            assert!(seen.insert(*id), "event confirmed twice");
            let header = store.get_header(id).unwrap().unwrap();
            keys.push((header.lamport, header.creator, *id));
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "block {} not in (lamport, creator, id) order", i);
    }

    // seq chains stay contiguous and heads consistent
    let summary = store.check_integrity().unwrap();
    assert_eq!(summary.epoch, 1);
    assert!(summary.events >= 36);
}

#[test]
fn frames_decide_within_two_frames_of_growth() {
    let mut net = TestNet::four_node();
    let creators = [1u8, 2, 3, 4];
    for &c in &creators {
        net.emit(c, &[]);
    }

    let mut decided_at: Vec<(u64, u32)> = Vec::new(); // (blocks, frame_to_decide)
    for _ in 0..10 {
        net.emit_round(&creators);
        decided_at.push((net.blocks().len() as u64, net.engine.frame_to_decide()));
    }

    // decisions keep pace with DAG growth: by the last rounds the engine
    // has decided at least once per round on average
    let (blocks_end, ftd_end) = *decided_at.last().unwrap();
    assert!(blocks_end >= 6, "only {} blocks after 10 rounds", blocks_end);
    assert!(ftd_end >= 7, "election stuck at frame {}", ftd_end);

    // the decided frame count never regresses
    for pair in decided_at.windows(2) {
        assert!(pair[1].0 >= pair[0].0);
        assert!(pair[1].1 >= pair[0].1);
    }
}

// ── Single validator boundary ───────────────────────────────────────────

#[test]
fn single_validator_confirms_every_event() {
    let mut net = TestNet::new(1, EngineConfig::default());
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(net.emit(1, &[]));
    }
    let blocks = net.blocks();
    assert_eq!(blocks.len(), 6, "all but the two youngest frames decide");
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.events, vec![ids[i]]);
    }
}

// ── Fork demotion ───────────────────────────────────────────────────────

#[test]
fn fork_demotion_excludes_both_branches_and_still_decides() {
    let mut net = TestNet::four_node();
    let creators = [1u8, 2, 3, 4];
    for &c in &creators {
        net.emit(c, &[]);
    }
    let c_head = net.head_of[&3];

    // validator 3 equivocates: two events at (epoch 1, seq 2)
    let mut branches = Vec::new();
    for claim in [7u64, 9] {
        let header = EventHeader {
            seq: 2,
            lamport: 2,
            claimed_time: 2_000_000_000 + claim,
            creator: vid(3),
            parents: vec![c_head],
            ..EventHeader::default()
        };
        let header = net.engine.prepare(header).unwrap();
        let event = Event {
            header,
            ..Event::default()
        };
        branches.push(event.id());
        net.engine.process_event(event).unwrap();
        net.lamport_of.insert(*branches.last().unwrap(), 2);
    }
    let (fork_a, fork_b) = (branches[0], branches[1]);
    assert_eq!(net.engine.store().forked_at(&vid(3)).unwrap(), Some(2));

    // validator 1 merges both branches, witnessing the fork
    let witness = net.emit(1, &[fork_a, fork_b]);
    let hb = net
        .engine
        .store()
        .get_highest_before(&witness)
        .unwrap()
        .unwrap();
    let c_idx = net.engine.validators().index_of(&vid(3)).unwrap();
    assert!(hb[c_idx].fork_seen, "merge must witness the fork");

    // the honest three keep gossiping; the cheater goes silent
    let honest = [1u8, 2, 4];
    for _ in 0..14 {
        net.emit_round(&honest);
    }

    let blocks = net.blocks();
    assert!(
        !blocks.is_empty(),
        "election must still decide with 3 of 4 honest (quorum boundary)"
    );
    for block in &blocks {
        assert!(
            !block.events.contains(&fork_a) && !block.events.contains(&fork_b),
            "no block may contain a forked event"
        );
    }
}

// ── Determinism across delivery orders ──────────────────────────────────

/// Kahn's algorithm over the event log; `reverse_ties` flips the choice
/// among simultaneously ready events.
fn topological_order(events: &[Event], reverse_ties: bool) -> Vec<Event> {
    let by_id: HashMap<EventId, Event> =
        events.iter().map(|e| (e.id(), e.clone())).collect();
    let mut pending: Vec<EventId> = events.iter().map(|e| e.id()).collect();
    let mut done: HashSet<EventId> = HashSet::new();
    let mut out = Vec::new();

    while !pending.is_empty() {
        let mut ready: Vec<EventId> = pending
            .iter()
            .filter(|id| {
                by_id[*id]
                    .header
                    .parents
                    .iter()
                    .all(|p| done.contains(p))
            })
            .copied()
            .collect();
        ready.sort();
        if reverse_ties {
            ready.reverse();
        }
        let next = ready[0];
        pending.retain(|id| *id != next);
        done.insert(next);
        out.push(by_id[&next].clone());
    }
    out
}

fn replay(events: Vec<Event>, n_validators: u8) -> Vec<Block> {
    let blocks = Arc::new(Mutex::new(Vec::new()));
    let app = SimApp {
        validators: flat_validators(n_validators),
        blocks: blocks.clone(),
    };
    let store = Arc::new(DagStore::open_mem());
    let mut engine = Engine::new(
        store,
        EngineConfig {
            max_parents: 4,
            ..EngineConfig::default()
        },
        app,
    )
    .unwrap();
    for event in events {
        engine.process_event(event).unwrap();
    }
    drop(engine);
    let out = blocks.lock().unwrap().clone();
    out
}

#[test]
fn same_events_any_order_decide_same_atropos() {
    let mut net = TestNet::four_node();
    let creators = [1u8, 2, 3, 4];
    for &c in &creators {
        net.emit(c, &[]);
    }
    for _ in 0..7 {
        net.emit_round(&creators);
    }
    let reference = net.blocks();
    assert!(reference.len() >= 3);
    let log = net.log.clone();

    let forward = replay(topological_order(&log, false), 4);
    let backward = replay(topological_order(&log, true), 4);

    assert_eq!(forward, reference);
    assert_eq!(backward, reference);
}

// ── Election failure scenarios over a scripted observer ─────────────────

#[derive(Default)]
struct ScriptedObserver {
    observed: HashMap<(EventId, u32, ValidatorId), EventId>,
    roots: HashMap<(EventId, u32), Vec<RootAndSlot>>,
}

impl RootObserver for ScriptedObserver {
    fn observed_root(
        &self,
        observer: &EventId,
        frame: u32,
        creator: &ValidatorId,
    ) -> Result<Option<EventId>, ClothoError> {
        Ok(self.observed.get(&(*observer, frame, *creator)).copied())
    }

    fn observed_roots(
        &self,
        observer: &EventId,
        frame: u32,
    ) -> Result<Vec<RootAndSlot>, ClothoError> {
        Ok(self
            .roots
            .get(&(*observer, frame))
            .cloned()
            .unwrap_or_default())
    }
}

fn eid(tag: u8) -> EventId {
    EventId([tag; 32])
}

#[test]
fn out_of_order_root_delivery_is_fatal() {
    // a round-2 root arrives before any round-1 root it aggregates
    let mut obs = ScriptedObserver::default();
    let ghosts: Vec<RootAndSlot> = (1..=3u8)
        .map(|t| RootAndSlot {
            id: eid(t + 20),
            frame: 2,
            creator: vid(t),
        })
        .collect();
    let aggregator = RootAndSlot {
        id: eid(31),
        frame: 3,
        creator: vid(1),
    };
    obs.roots.insert((aggregator.id, 2), ghosts);

    let mut election = Election::new(flat_validators(4), 1);
    let err = election.process_root(&obs, aggregator).unwrap_err();
    assert!(matches!(err, ClothoError::Invariant(_)));
    assert!(err.to_string().contains("out of order"));
}

#[test]
fn byzantine_evidence_names_both_observed_roots() {
    let mut obs = ScriptedObserver::default();
    let subject_roots: HashMap<ValidatorId, EventId> =
        (1..=4u8).map(|t| (vid(t), eid(t + 10))).collect();

    // three round-1 voters; two of them disagree about subject 2's root
    let mut voters = Vec::new();
    for t in 1..=3u8 {
        let voter = RootAndSlot {
            id: eid(t + 20),
            frame: 2,
            creator: vid(t),
        };
        for (subject, root) in &subject_roots {
            obs.observed.insert((voter.id, 1, *subject), *root);
        }
        voters.push(voter);
    }
    obs.observed.insert((voters[0].id, 1, vid(2)), eid(0xAA));
    obs.observed.insert((voters[1].id, 1, vid(2)), eid(0xBB));

    let mut election = Election::new(flat_validators(4), 1);
    for voter in &voters {
        election.process_root(&obs, *voter).unwrap();
    }

    let aggregator = RootAndSlot {
        id: eid(31),
        frame: 3,
        creator: vid(4),
    };
    obs.roots.insert((aggregator.id, 2), voters);
    match election.process_root(&obs, aggregator).unwrap_err() {
        ClothoError::Byzantine {
            subject,
            observed_a,
            observed_b,
            ..
        } => {
            assert_eq!(subject, vid(2));
            let mut pair = [observed_a, observed_b];
            pair.sort();
            assert_eq!(pair, [eid(0xAA), eid(0xBB)]);
        }
        other => panic!("expected byzantine evidence, got {:?}", other),
    }
}
