//! Deterministic ordering of confirmed events into blocks.

use std::collections::HashSet;

use crate::error::ClothoError;
use crate::event::EventId;
use crate::store::DagStore;
use crate::validators::Validators;
use crate::vecclock;

/// Collect the events confirmed by a freshly decided Atropos: ancestors of
/// the Atropos, not yet included in a prior block, forkless-caused by it
/// (the Atropos itself anchors the block). Events occupying a forked
/// (creator, seq) slot never enter a block — neither branch does. The result
/// is ordered by (lamport, creator, id).
pub(crate) fn collect_block_events(
    store: &DagStore,
    validators: &Validators,
    atropos: &EventId,
    allowed: &mut dyn FnMut(&EventId) -> bool,
) -> Result<Vec<EventId>, ClothoError> {
    let mut candidates: Vec<(u32, crate::validators::ValidatorId, EventId)> = Vec::new();
    let mut visited: HashSet<EventId> = HashSet::new();
    let mut stack = vec![*atropos];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let header = store.get_header(&id)?.ok_or_else(|| {
            ClothoError::Invariant(format!("ordering: missing header for {}", id))
        })?;
        // traversal continues through confirmed events: unconfirmed
        // stragglers can hide below an already-confirmed frontier
        stack.extend(header.parents.iter().copied());

        if store.is_confirmed(&id)? {
            continue;
        }
        let on_forked_slot = matches!(
            store.forked_at(&header.creator)?,
            Some(fork_seq) if header.seq >= fork_seq
        );
        if on_forked_slot {
            continue;
        }
        let confirmed =
            id == *atropos || vecclock::forkless_cause(store, validators, atropos, &id)?;
        if confirmed && allowed(&id) {
            candidates.push((header.lamport, header.creator, id));
        }
    }

    candidates.sort_unstable();
    Ok(candidates.into_iter().map(|(_, _, id)| id).collect())
}

/// Block timestamp: median of the Atropos's claimed time and its parents'.
pub(crate) fn median_claimed_time(
    store: &DagStore,
    atropos: &EventId,
) -> Result<u64, ClothoError> {
    let header = store.get_header(atropos)?.ok_or_else(|| {
        ClothoError::Invariant(format!("ordering: missing atropos header {}", atropos))
    })?;
    let mut times = vec![header.claimed_time];
    for p in &header.parents {
        let parent = store.get_header(p)?.ok_or_else(|| {
            ClothoError::Invariant(format!("ordering: missing parent header {}", p))
        })?;
        times.push(parent.claimed_time);
    }
    times.sort_unstable();
    Ok(times[times.len() / 2])
}
