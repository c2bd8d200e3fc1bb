//! Forkless-cause vector clocks.
//!
//! Per event e, `HighestBefore[e]` maps each validator to the highest
//! (seq, id) of that validator observed through non-forking ancestry, plus a
//! fork-seen flag; `LowestAfter[b]` maps each validator to the lowest seq of
//! its events that have b as an ancestor, filled in lazily as descendants
//! arrive. `forkless_cause(a, b)` counts the stake of validators whose
//! events both observe b and are observed by a; a strict supermajority
//! decides. A validator whose fork has been witnessed on either side is
//! excluded from the count entirely.
//!
//! Fork witnessing happens at merge time: two parents disagreeing on the
//! observed event of some creator at the same seq prove that creator
//! equivocated, and the flag propagates to every descendant.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ClothoError;
use crate::event::{EventHeader, EventId};
use crate::store::DagStore;
use crate::validators::Validators;

/// One column of `HighestBefore`: the highest observed event of a validator.
/// Seq zero means "not observed".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighestEntry {
    pub seq: u32,
    pub id: EventId,
    pub fork_seen: bool,
}

impl Default for HighestEntry {
    fn default() -> Self {
        HighestEntry {
            seq: 0,
            id: EventId::ZERO,
            fork_seen: false,
        }
    }
}

/// Merge the parents' `HighestBefore` vectors for a prospective event.
///
/// The result observes everything any parent observes; disagreement between
/// parents on a creator's event at equal seq marks that creator's fork as
/// witnessed. The event's own (creator, seq) is then folded in.
pub fn merge_parents(
    store: &DagStore,
    validators: &Validators,
    header: &EventHeader,
    id: &EventId,
) -> Result<Vec<HighestEntry>, ClothoError> {
    let n = validators.len();
    let mut hb = vec![HighestEntry::default(); n];

    for parent in &header.parents {
        let parent_hb = store.get_highest_before(parent)?.ok_or_else(|| {
            ClothoError::Invariant(format!("missing vector clock for parent {}", parent))
        })?;
        if parent_hb.len() != n {
            return Err(ClothoError::Invariant(format!(
                "vector clock width mismatch for parent {}",
                parent
            )));
        }
        for (cur, pe) in hb.iter_mut().zip(parent_hb) {
            if pe.fork_seen {
                cur.fork_seen = true;
            }
            if pe.seq > cur.seq {
                cur.seq = pe.seq;
                cur.id = pe.id;
            } else if pe.seq == cur.seq && pe.seq != 0 && pe.id != cur.id {
                // two parents disagree on the same seq: witnessed fork
                cur.fork_seen = true;
                if pe.id < cur.id {
                    cur.id = pe.id; // deterministic representative
                }
            }
        }
    }

    if let Some(i) = validators.index_of(&header.creator) {
        let cur = &mut hb[i];
        if cur.seq >= header.seq && !cur.id.is_zero() && cur.id != *id {
            // the event's ancestry already contains an own event at this or
            // a later seq: the creator equivocated
            cur.fork_seen = true;
        } else {
            cur.seq = header.seq;
            cur.id = *id;
        }
    }
    Ok(hb)
}

/// Persist the clocks of a newly inserted event and lazily propagate its
/// observation down to every ancestor not yet observed by this creator.
pub fn insert_event(
    store: &DagStore,
    validators: &Validators,
    header: &EventHeader,
    id: &EventId,
    hb: Vec<HighestEntry>,
) -> Result<(), ClothoError> {
    let n = validators.len();
    store.set_highest_before(id, &hb)?;

    let mut la = vec![0u32; n];
    let Some(creator_idx) = validators.index_of(&header.creator) else {
        store.set_lowest_after(id, &la)?;
        return Ok(());
    };
    la[creator_idx] = header.seq;
    store.set_lowest_after(id, &la)?;

    let mut stack: Vec<EventId> = header.parents.clone();
    let mut visited: HashSet<EventId> = HashSet::new();
    while let Some(ancestor) = stack.pop() {
        if !visited.insert(ancestor) {
            continue;
        }
        let mut la = store.get_lowest_after(&ancestor)?.ok_or_else(|| {
            ClothoError::Invariant(format!("missing vector clock for ancestor {}", ancestor))
        })?;
        if la[creator_idx] != 0 {
            // an earlier event of this creator already observes the whole
            // subgraph below here
            continue;
        }
        la[creator_idx] = header.seq;
        store.set_lowest_after(&ancestor, &la)?;

        let ancestor_header = store.get_header(&ancestor)?.ok_or_else(|| {
            ClothoError::Invariant(format!("missing header for ancestor {}", ancestor))
        })?;
        stack.extend(ancestor_header.parents.iter().copied());
    }
    Ok(())
}

/// Does `a` observe `b` through a supermajority of non-equivocating
/// witnesses?
pub fn forkless_cause(
    store: &DagStore,
    validators: &Validators,
    a: &EventId,
    b: &EventId,
) -> Result<bool, ClothoError> {
    let hb_a = store
        .get_highest_before(a)?
        .ok_or_else(|| ClothoError::Invariant(format!("missing vector clock for {}", a)))?;
    forkless_cause_from(store, validators, &hb_a, b)
}

/// Same predicate with the observer's `HighestBefore` supplied directly —
/// used while the observer is still being prepared and has no stored clock.
pub fn forkless_cause_from(
    store: &DagStore,
    validators: &Validators,
    hb_a: &[HighestEntry],
    b: &EventId,
) -> Result<bool, ClothoError> {
    let hb_b = store
        .get_highest_before(b)?
        .ok_or_else(|| ClothoError::Invariant(format!("missing vector clock for {}", b)))?;
    let la_b = store
        .get_lowest_after(b)?
        .ok_or_else(|| ClothoError::Invariant(format!("missing vector clock for {}", b)))?;

    let counter = validators.new_counter();
    for (i, v) in validators.sorted_ids().enumerate() {
        let ha = &hb_a[i];
        if ha.fork_seen || hb_b[i].fork_seen {
            continue; // forks by v remove v from the counting set
        }
        let lb = la_b[i];
        if lb > 0 && ha.seq >= lb {
            counter.count(*v);
            if counter.has_quorum() {
                return Ok(true);
            }
        }
    }
    Ok(counter.has_quorum())
}
