//! Validator score and proof-of-importance bookkeeping.
//!
//! Scores accrue in a "dirty" table during the epoch and migrate to the
//! "active" table at the score checkpoint. Counter updates go through the
//! store's increment mutex to serialize read-modify-write on disk.

use crate::validators::ValidatorId;

use super::{retry, DagStore, StoreResult};

/// POI period length: two days, in unix nanoseconds.
pub const POI_PERIOD_NANOS: u64 = 2 * 24 * 3600 * 1_000_000_000;

const CHECKPOINT_KEY: &[u8] = b"LastScoreCheckpoint";

/// POI period index of a unix-nano timestamp.
pub fn poi_period(time: u64) -> u64 {
    time / POI_PERIOD_NANOS
}

fn u64_of(raw: Option<Vec<u8>>) -> u64 {
    match raw {
        Some(r) if r.len() == 8 => {
            u64::from_be_bytes([r[0], r[1], r[2], r[3], r[4], r[5], r[6], r[7]])
        }
        _ => 0,
    }
}

fn u32_of(raw: Option<Vec<u8>>) -> u32 {
    match raw {
        Some(r) if r.len() == 4 => u32::from_be_bytes([r[0], r[1], r[2], r[3]]),
        _ => 0,
    }
}

impl DagStore {
    // ── Missed-block counters ───────────────────────────────────────────

    pub fn inc_blocks_missed(&self, v: &ValidatorId) -> StoreResult<()> {
        let _guard = self.inc_mutex.lock().expect("inc mutex poisoned");
        let missed = self.get_blocks_missed(v)? + 1;
        retry(self.retries(), || {
            self.main
                .blocks_missed
                .put(v.as_bytes(), &missed.to_be_bytes())
        })?;
        Ok(())
    }

    pub fn reset_blocks_missed(&self, v: &ValidatorId) -> StoreResult<()> {
        let _guard = self.inc_mutex.lock().expect("inc mutex poisoned");
        retry(self.retries(), || {
            self.main
                .blocks_missed
                .put(v.as_bytes(), &0u32.to_be_bytes())
        })?;
        Ok(())
    }

    pub fn get_blocks_missed(&self, v: &ValidatorId) -> StoreResult<u32> {
        let raw = retry(self.retries(), || self.main.blocks_missed.get(v.as_bytes()))?;
        Ok(u32_of(raw))
    }

    // ── Dirty / active scores ───────────────────────────────────────────

    pub fn add_dirty_validator_score(&self, v: &ValidatorId, gas: u64) -> StoreResult<()> {
        let _guard = self.inc_mutex.lock().expect("inc mutex poisoned");
        let score = u64_of(retry(self.retries(), || {
            self.main.score_dirty.get(v.as_bytes())
        })?)
        .saturating_add(gas);
        retry(self.retries(), || {
            self.main.score_dirty.put(v.as_bytes(), &score.to_be_bytes())
        })?;
        Ok(())
    }

    pub fn get_dirty_validator_score(&self, v: &ValidatorId) -> StoreResult<u64> {
        let raw = retry(self.retries(), || self.main.score_dirty.get(v.as_bytes()))?;
        Ok(u64_of(raw))
    }

    pub fn get_active_validator_score(&self, v: &ValidatorId) -> StoreResult<u64> {
        let raw = retry(self.retries(), || self.main.score_active.get(v.as_bytes()))?;
        Ok(u64_of(raw))
    }

    /// Promote dirty scores to active at the score checkpoint.
    pub fn move_dirty_scores_to_active(&self) -> StoreResult<()> {
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        self.main.score_dirty.for_each_from(b"", &mut |k, v| {
            pairs.push((k.to_vec(), v.to_vec()));
            true
        })?;
        for (k, v) in pairs {
            retry(self.retries(), || self.main.score_active.put(&k, &v))?;
            retry(self.retries(), || self.main.score_dirty.delete(&k))?;
        }
        Ok(())
    }

    // ── Score checkpoint ────────────────────────────────────────────────

    pub fn set_score_checkpoint(&self, time: u64) -> StoreResult<()> {
        retry(self.retries(), || {
            self.main
                .score_checkpoint
                .put(CHECKPOINT_KEY, &time.to_be_bytes())
        })?;
        Ok(())
    }

    pub fn get_score_checkpoint(&self) -> StoreResult<u64> {
        let raw = retry(self.retries(), || self.main.score_checkpoint.get(CHECKPOINT_KEY))?;
        Ok(u64_of(raw))
    }

    // ── Address gas and proof-of-importance ────────────────────────────

    pub fn get_address_gas_used(&self, addr: &ValidatorId) -> StoreResult<u64> {
        let raw = retry(self.retries(), || self.main.addr_gas_used.get(addr.as_bytes()))?;
        Ok(u64_of(raw))
    }

    pub fn set_address_gas_used(&self, addr: &ValidatorId, gas: u64) -> StoreResult<()> {
        retry(self.retries(), || {
            self.main.addr_gas_used.put(addr.as_bytes(), &gas.to_be_bytes())
        })?;
        Ok(())
    }

    pub fn add_poi_gas_used(&self, period: u64, gas: u64) -> StoreResult<()> {
        let _guard = self.inc_mutex.lock().expect("inc mutex poisoned");
        let total = self.get_poi_gas_used_locked(period)?.saturating_add(gas);
        retry(self.retries(), || {
            self.main
                .poi_gas_total
                .put(&period.to_be_bytes(), &total.to_be_bytes())
        })?;
        Ok(())
    }

    pub fn get_poi_gas_used(&self, period: u64) -> StoreResult<u64> {
        let _guard = self.inc_mutex.lock().expect("inc mutex poisoned");
        self.get_poi_gas_used_locked(period)
    }

    fn get_poi_gas_used_locked(&self, period: u64) -> StoreResult<u64> {
        let raw = retry(self.retries(), || {
            self.main.poi_gas_total.get(&period.to_be_bytes())
        })?;
        Ok(u64_of(raw))
    }

    /// Recompute and save a validator's POI for a period: its share of the
    /// period's gas, in parts per million.
    pub fn calc_validator_poi(&self, v: &ValidatorId, period: u64) -> StoreResult<u64> {
        let used = self.get_address_gas_used(v)?;
        let total = self.get_poi_gas_used(period)?;
        let poi = if total == 0 {
            0
        } else {
            used.saturating_mul(1_000_000) / total
        };
        retry(self.retries(), || {
            self.main.poi_score.put(v.as_bytes(), &poi.to_be_bytes())
        })?;
        Ok(poi)
    }

    pub fn get_validator_poi(&self, v: &ValidatorId) -> StoreResult<u64> {
        let raw = retry(self.retries(), || self.main.poi_score.get(v.as_bytes()))?;
        Ok(u64_of(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DagStore;

    fn vid(tag: u8) -> ValidatorId {
        ValidatorId([tag; 20])
    }

    #[test]
    fn missed_blocks_count_and_reset() {
        let store = DagStore::open_mem();
        assert_eq!(store.get_blocks_missed(&vid(1)).unwrap(), 0);
        store.inc_blocks_missed(&vid(1)).unwrap();
        store.inc_blocks_missed(&vid(1)).unwrap();
        assert_eq!(store.get_blocks_missed(&vid(1)).unwrap(), 2);
        store.reset_blocks_missed(&vid(1)).unwrap();
        assert_eq!(store.get_blocks_missed(&vid(1)).unwrap(), 0);
    }

    #[test]
    fn dirty_scores_accumulate_then_migrate() {
        let store = DagStore::open_mem();
        store.add_dirty_validator_score(&vid(1), 100).unwrap();
        store.add_dirty_validator_score(&vid(1), 50).unwrap();
        store.add_dirty_validator_score(&vid(2), 7).unwrap();
        assert_eq!(store.get_dirty_validator_score(&vid(1)).unwrap(), 150);
        assert_eq!(store.get_active_validator_score(&vid(1)).unwrap(), 0);

        store.move_dirty_scores_to_active().unwrap();
        assert_eq!(store.get_active_validator_score(&vid(1)).unwrap(), 150);
        assert_eq!(store.get_active_validator_score(&vid(2)).unwrap(), 7);
        assert_eq!(store.get_dirty_validator_score(&vid(1)).unwrap(), 0);
    }

    #[test]
    fn poi_is_share_of_period_gas() {
        let store = DagStore::open_mem();
        store.set_address_gas_used(&vid(1), 250).unwrap();
        store.add_poi_gas_used(5, 1000).unwrap();
        let poi = store.calc_validator_poi(&vid(1), 5).unwrap();
        assert_eq!(poi, 250_000); // 25% in ppm
        assert_eq!(store.get_validator_poi(&vid(1)).unwrap(), 250_000);
    }

    #[test]
    fn poi_period_boundaries() {
        assert_eq!(poi_period(0), 0);
        assert_eq!(poi_period(POI_PERIOD_NANOS - 1), 0);
        assert_eq!(poi_period(POI_PERIOD_NANOS), 1);
    }

    #[test]
    fn checkpoint_roundtrip() {
        let store = DagStore::open_mem();
        assert_eq!(store.get_score_checkpoint().unwrap(), 0);
        store.set_score_checkpoint(123_456).unwrap();
        assert_eq!(store.get_score_checkpoint().unwrap(), 123_456);
    }
}
