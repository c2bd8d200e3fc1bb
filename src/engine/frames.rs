//! Frame and root assignment for freshly inserted events.

use crate::error::ClothoError;
use crate::event::EventHeader;
use crate::store::DagStore;
use crate::validators::Validators;
use crate::vecclock::{self, HighestEntry};

/// Compute the (frame, is_root) pair of a prospective event whose merged
/// `HighestBefore` vector is `hb`.
///
/// The frame starts at the self-parent's frame (frame 1 for a creator's
/// first event) and climbs while the event forkless-causes roots holding a
/// quorum of stake at that frame. The event is a root when it climbed above
/// its self-parent's frame, and always when it is the creator's first event
/// of the epoch. Parentless events open frame 1.
pub(crate) fn assign_frame(
    store: &DagStore,
    validators: &Validators,
    header: &EventHeader,
    hb: &[HighestEntry],
) -> Result<(u32, bool), ClothoError> {
    if header.parents.is_empty() {
        return Ok((crate::constants::FIRST_FRAME, true));
    }

    let base_frame = match header.self_parent() {
        Some(sp) => {
            store
                .get_header(sp)?
                .ok_or_else(|| {
                    ClothoError::Invariant(format!("frame assignment: missing self-parent {}", sp))
                })?
                .frame
        }
        None => crate::constants::FIRST_FRAME,
    };

    let mut frame = base_frame;
    while roots_observed_by_quorum(store, validators, hb, frame)? {
        frame += 1;
    }
    let is_root = frame > base_frame || header.seq == 1;
    Ok((frame, is_root))
}

/// Does the event (via its `HighestBefore`) forkless-cause roots of `frame`
/// whose creators hold a quorum of stake? The scan is evaluated against the
/// roots index, not against heads, and stops as soon as quorum is reached.
fn roots_observed_by_quorum(
    store: &DagStore,
    validators: &Validators,
    hb: &[HighestEntry],
    frame: u32,
) -> Result<bool, ClothoError> {
    let counter = validators.new_counter();
    let mut err: Option<ClothoError> = None;
    store.for_each_root_at(frame, &mut |creator, root_id| {
        match vecclock::forkless_cause_from(store, validators, hb, &root_id) {
            Ok(true) => {
                counter.count(creator);
            }
            Ok(false) => {}
            Err(e) => {
                err = Some(e);
                return false;
            }
        }
        !counter.has_quorum()
    })?;
    if let Some(e) = err {
        return Err(e);
    }
    Ok(counter.has_quorum())
}
