//! Event model: the immutable records of the gossip DAG.
//!
//! An event id is 32 bytes whose first 4 bytes encode the epoch big-endian;
//! the remaining 28 bytes are the tail of the BLAKE3 header hash. Parent
//! references are ids only — the DAG is navigated through the store, never
//! through owning links.

pub mod codec;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::validators::ValidatorId;
use crate::Hash;

/// Unique identifier of an event. First 4 bytes carry the epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub [u8; 32]);

impl EventId {
    /// The zero id, used as "no event" (e.g. prev-epoch hash of epoch 1).
    pub const ZERO: EventId = EventId([0u8; 32]);

    /// Build an id from an epoch and a full header hash: the epoch replaces
    /// the first 4 bytes of the hash, big-endian.
    pub fn new(epoch: u32, hash: &Hash) -> Self {
        let mut bytes = *hash;
        bytes[..4].copy_from_slice(&epoch.to_be_bytes());
        EventId(bytes)
    }

    /// Epoch encoded in the first 4 bytes.
    pub fn epoch(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// The 28-byte tail, as serialized inside container messages.
    pub fn tail(&self) -> &[u8] {
        &self.0[4..]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(EventId(arr))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({}:{}…)", self.epoch(), hex::encode(&self.0[4..8]))
    }
}

/// An immutable event header.
///
/// `frame` and `is_root` are derived metadata: the creator fills them at
/// emission time and the engine recomputes and verifies them on insertion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub version: u32,
    pub epoch: u32,
    /// Sequence number within the creator's chain, starting at 1.
    pub seq: u32,
    pub frame: u32,
    pub lamport: u32,
    /// Creator's claimed wall-clock time, unix nanoseconds.
    pub claimed_time: u64,
    /// Stake-weighted median of observed claimed times, unix nanoseconds.
    pub median_time: u64,
    pub gas_power_left: u64,
    pub gas_power_used: u64,
    pub is_root: bool,
    pub creator: ValidatorId,
    /// Hash of the previous epoch's final state; zero in epoch 1.
    pub prev_epoch_hash: Hash,
    /// Hash over the transactions payload.
    pub tx_hash: Hash,
    /// Parent event ids. The first parent is the self-parent when seq > 1.
    pub parents: Vec<EventId>,
    /// Opaque extra bytes.
    pub extra: Vec<u8>,
}

impl EventHeader {
    /// BLAKE3 hash over the compact serialized form.
    pub fn hash(&self) -> Hash {
        crate::hash_domain(b"clotho.event.header", &codec::encode_header(self))
    }

    /// The event id: epoch prefix + hash tail.
    pub fn id(&self) -> EventId {
        EventId::new(self.epoch, &self.hash())
    }

    /// The self-parent, by convention the first parent of any event with
    /// seq > 1. Events with seq 1 have no self-parent.
    pub fn self_parent(&self) -> Option<&EventId> {
        if self.seq > 1 {
            self.parents.first()
        } else {
            None
        }
    }
}

/// A full event: header, transactions payload, creator signature.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub header: EventHeader,
    /// Opaque transaction payloads; execution is the application's concern.
    pub transactions: Vec<Vec<u8>>,
    /// ed25519 signature over the header hash.
    pub sig: Vec<u8>,
}

impl Event {
    pub fn id(&self) -> EventId {
        self.header.id()
    }

    /// Hash over the transactions payload, length-prefixed per item.
    pub fn compute_tx_hash(transactions: &[Vec<u8>]) -> Hash {
        if transactions.is_empty() {
            return [0u8; 32];
        }
        let parts: Vec<&[u8]> = transactions.iter().map(|tx| tx.as_slice()).collect();
        crate::hash_concat(&parts)
    }

    /// Sign the header hash with the creator's key.
    pub fn sign(&mut self, key: &ed25519_dalek::SigningKey) {
        use ed25519_dalek::Signer;
        let sig = key.sign(&self.header.hash());
        self.sig = sig.to_bytes().to_vec();
    }

    /// Verify the signature against a raw 32-byte public key.
    pub fn verify(&self, pubkey: &[u8; 32]) -> bool {
        use ed25519_dalek::Verifier;
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(pubkey) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(self.sig.as_slice()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(&self.header.hash(), &sig).is_ok()
    }
}
