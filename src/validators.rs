//! Validator set and stake arithmetic.
//!
//! The validator set is fixed per epoch and refreshed at epoch boundaries by
//! an external callback. "Quorum" is any subset whose summed stake strictly
//! exceeds the supermajority ratio of the total (2/3 by default).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Stake amount.
pub type Stake = u64;

/// A validator address: 20 bytes derived from the signing public key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValidatorId(pub [u8; 20]);

impl ValidatorId {
    /// Derive an address from an ed25519 public key (truncated BLAKE3).
    pub fn from_pubkey(key: &ed25519_dalek::VerifyingKey) -> Self {
        let digest = crate::hash_domain(b"clotho.validator.addr", key.as_bytes());
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest[..20]);
        ValidatorId(addr)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validator({}…)", hex::encode(&self.0[..4]))
    }
}

/// The validator set of one epoch: address → stake, with optional signing
/// keys for the heavy check, held sorted for deterministic iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Validators {
    stakes: BTreeMap<ValidatorId, Stake>,
    keys: BTreeMap<ValidatorId, [u8; 32]>,
    total: Stake,
    ratio: (u64, u64),
}

impl Validators {
    pub fn new() -> Self {
        Validators {
            stakes: BTreeMap::new(),
            keys: BTreeMap::new(),
            total: 0,
            ratio: (
                crate::constants::SUPERMAJORITY_NUM,
                crate::constants::SUPERMAJORITY_DEN,
            ),
        }
    }

    /// Override the supermajority ratio (numerator, denominator).
    pub fn with_ratio(mut self, num: u64, den: u64) -> Self {
        self.ratio = (num, den);
        self
    }

    /// Set a validator's stake. Stake zero removes the validator.
    pub fn set(&mut self, id: ValidatorId, stake: Stake) {
        let prev = if stake == 0 {
            self.stakes.remove(&id).unwrap_or(0)
        } else {
            self.stakes.insert(id, stake).unwrap_or(0)
        };
        self.total = self.total - prev + stake;
        if stake == 0 {
            self.keys.remove(&id);
        }
    }

    /// Register the signing public key for a validator.
    pub fn set_pubkey(&mut self, id: ValidatorId, key: [u8; 32]) {
        self.keys.insert(id, key);
    }

    pub fn pubkey_of(&self, id: &ValidatorId) -> Option<&[u8; 32]> {
        self.keys.get(id)
    }

    pub fn stake_of(&self, id: &ValidatorId) -> Stake {
        self.stakes.get(id).copied().unwrap_or(0)
    }

    pub fn contains(&self, id: &ValidatorId) -> bool {
        self.stakes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    pub fn total_stake(&self) -> Stake {
        self.total
    }

    /// Strict supermajority threshold: `floor(total · num/den) + 1`.
    pub fn quorum(&self) -> Stake {
        self.total * self.ratio.0 / self.ratio.1 + 1
    }

    /// Validator ids in sorted (deterministic) order.
    pub fn sorted_ids(&self) -> impl Iterator<Item = &ValidatorId> {
        self.stakes.keys()
    }

    /// Position of a validator in the sorted order, used as the column index
    /// in per-event vector clocks.
    pub fn index_of(&self, id: &ValidatorId) -> Option<usize> {
        self.stakes.keys().position(|k| k == id)
    }

    pub fn id_at(&self, index: usize) -> Option<&ValidatorId> {
        self.stakes.keys().nth(index)
    }

    /// Fresh stake counter against this set's quorum.
    pub fn new_counter(&self) -> StakeCounter {
        StakeCounter {
            stakes: self.stakes.clone(),
            quorum: self.quorum(),
            inner: Mutex::new(CounterInner {
                already: HashSet::new(),
                sum: 0,
            }),
        }
    }
}

struct CounterInner {
    already: HashSet<ValidatorId>,
    sum: Stake,
}

/// Counts stake of distinct validators toward a quorum. Thread-safe so
/// parallel root iteration can share one counter.
pub struct StakeCounter {
    stakes: BTreeMap<ValidatorId, Stake>,
    quorum: Stake,
    inner: Mutex<CounterInner>,
}

impl StakeCounter {
    /// Count a validator; returns false if it was already counted.
    pub fn count(&self, id: ValidatorId) -> bool {
        let mut inner = self.inner.lock().expect("stake counter poisoned");
        if !inner.already.insert(id) {
            return false;
        }
        inner.sum += self.stakes.get(&id).copied().unwrap_or(0);
        true
    }

    pub fn sum(&self) -> Stake {
        self.inner.lock().expect("stake counter poisoned").sum
    }

    pub fn has_quorum(&self) -> bool {
        self.sum() >= self.quorum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vid(tag: u8) -> ValidatorId {
        ValidatorId([tag; 20])
    }

    #[test]
    fn quorum_is_strict_supermajority() {
        let mut vv = Validators::new();
        for tag in 0..4u8 {
            vv.set(vid(tag), 1);
        }
        // W = 4, floor(2W/3) = 2, quorum = 3
        assert_eq!(vv.total_stake(), 4);
        assert_eq!(vv.quorum(), 3);

        let mut vv = Validators::new();
        vv.set(vid(0), 3);
        vv.set(vid(1), 3);
        vv.set(vid(2), 3);
        // W = 9, quorum = 7: exactly 2/3 (6) must NOT be enough
        assert_eq!(vv.quorum(), 7);
    }

    #[test]
    fn counter_ignores_duplicates_and_strangers() {
        let mut vv = Validators::new();
        vv.set(vid(0), 2);
        vv.set(vid(1), 2);
        vv.set(vid(2), 2);

        let counter = vv.new_counter();
        assert!(counter.count(vid(0)));
        assert!(!counter.count(vid(0)));
        assert_eq!(counter.sum(), 2);
        // unknown validator counts as zero stake
        assert!(counter.count(vid(9)));
        assert_eq!(counter.sum(), 2);
        assert!(!counter.has_quorum());
        counter.count(vid(1));
        counter.count(vid(2));
        assert!(counter.has_quorum());
    }

    #[test]
    fn set_zero_removes() {
        let mut vv = Validators::new();
        vv.set(vid(0), 5);
        vv.set(vid(1), 5);
        vv.set(vid(0), 0);
        assert_eq!(vv.len(), 1);
        assert_eq!(vv.total_stake(), 5);
        assert!(!vv.contains(&vid(0)));
    }

    #[test]
    fn index_order_is_deterministic() {
        let mut vv = Validators::new();
        vv.set(vid(3), 1);
        vv.set(vid(1), 1);
        vv.set(vid(2), 1);
        let ids: Vec<_> = vv.sorted_ids().copied().collect();
        assert_eq!(ids, vec![vid(1), vid(2), vid(3)]);
        assert_eq!(vv.index_of(&vid(2)), Some(1));
        assert_eq!(vv.id_at(2), Some(&vid(3)));
    }
}
