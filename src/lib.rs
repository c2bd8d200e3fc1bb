//! # Clotho
//!
//! A leaderless, asynchronous Byzantine-fault-tolerant consensus engine
//! operating over a stake-weighted DAG of signed events:
//! - **Event-block gossip** — validators continuously produce signed events
//!   referencing prior events; there is no leader and no view change.
//! - **Virtual voting** — roots of each frame vote implicitly through the
//!   DAG structure; one Atropos root is elected per frame.
//! - **Deterministic ordering** — decided frames yield a totally ordered
//!   block stream consumable by an application layer.
//! - **Crash consistency** — all state lives in a pool of write-buffered
//!   key-value stores flushed together under a shared marker.

pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod kvdb;
pub mod store;
pub mod validators;
pub mod vecclock;

/// Protocol constants
pub mod constants {
    /// Serialization version carried in every event header.
    pub const PROTOCOL_VERSION: u32 = 1;
    /// Default maximum number of parent references per event.
    pub const MAX_PARENTS: usize = 3;
    /// Hard cap on parents the codec and basic check will ever accept.
    pub const MAX_PARENTS_HARD: usize = 16;
    /// Maximum size of the opaque extra payload in an event header.
    pub const MAX_EXTRA_BYTES: usize = 1024;
    /// Maximum serialized event size accepted by the basic check (1 MiB).
    pub const MAX_EVENT_BYTES: usize = 1024 * 1024;
    /// First frame of every epoch.
    pub const FIRST_FRAME: u32 = 1;
    /// First epoch of a fresh database.
    pub const FIRST_EPOCH: u32 = 1;
    /// Default supermajority ratio numerator (quorum is strictly above 2W/3).
    pub const SUPERMAJORITY_NUM: u64 = 2;
    /// Default supermajority ratio denominator.
    pub const SUPERMAJORITY_DEN: u64 = 3;
    /// Default pool flush interval in seconds.
    pub const FLUSH_INTERVAL_SECS: u64 = 600;
    /// Default pool flush threshold for buffered bytes (100 MiB).
    pub const FLUSH_SIZE_THRESHOLD: usize = 100 * 1024 * 1024;
    /// Default epoch length in blocks.
    pub const EPOCH_LENGTH_BLOCKS: u64 = 1000;
    /// Default interval between validator score checkpoints in seconds.
    pub const SCORE_CHECKPOINT_INTERVAL_SECS: u64 = 4 * 3600;
    /// Default per-validator gas power granted at the start of an epoch.
    pub const GAS_POWER_STARTUP: u64 = 10_000_000;
    /// Default total gas power regenerated per second, split by stake.
    pub const GAS_POWER_PER_SECOND: u64 = 100_000;
    /// Default ceiling on accumulated per-validator gas power.
    pub const GAS_POWER_MAX: u64 = 100_000_000;
    /// Default deadline for application callbacks in milliseconds.
    pub const CALLBACK_DEADLINE_MS: u64 = 5_000;
}

/// 32-byte hash used throughout the protocol.
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all Clotho domains use ASCII). Panics at
/// runtime if it is not — that is a programming error, not an input error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}
