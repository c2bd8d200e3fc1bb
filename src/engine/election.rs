//! Atropos election: stake-weighted virtual voting over roots.
//!
//! The election decides one frame at a time (`frame_to_decide`). Roots of
//! frame `frame_to_decide + 1` cast direct observation votes for every
//! subject validator; roots further up aggregate the votes of the previous
//! frame's roots they forkless-cause, weighted by voter stake. A subject is
//! decided once either side reaches quorum; when all subjects are decided,
//! the Atropos is the decided-yes subject with the smallest observed-root
//! hash. Processing requires topological delivery: a root may only arrive
//! after every root it aggregates has been processed.

use std::collections::HashMap;

use tracing::debug;

use crate::error::ClothoError;
use crate::event::EventId;
use crate::validators::{ValidatorId, Validators};

/// A root and the slot it occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootAndSlot {
    pub id: EventId,
    pub frame: u32,
    pub creator: ValidatorId,
}

#[derive(Clone, Copy, Debug)]
struct VoteValue {
    decided: bool,
    yes: bool,
    observed_root: EventId,
}

impl Default for VoteValue {
    fn default() -> Self {
        VoteValue {
            decided: false,
            yes: false,
            observed_root: EventId::ZERO,
        }
    }
}

/// The decided root of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtroposDecision {
    pub frame: u32,
    pub atropos: EventId,
}

/// How the election observes the DAG. Implemented by the engine over the
/// store and vector clocks; tests may substitute a fake.
pub trait RootObserver {
    /// A root of the (frame, creator) slot forkless-caused by `observer`.
    fn observed_root(
        &self,
        observer: &EventId,
        frame: u32,
        creator: &ValidatorId,
    ) -> Result<Option<EventId>, ClothoError>;

    /// All roots of `frame` forkless-caused by `observer`.
    fn observed_roots(
        &self,
        observer: &EventId,
        frame: u32,
    ) -> Result<Vec<RootAndSlot>, ClothoError>;
}

/// Election state for one frame-to-decide.
pub struct Election {
    validators: Validators,
    frame_to_decide: u32,
    /// Vote of a voter root about a subject validator.
    votes: HashMap<(EventId, ValidatorId), VoteValue>,
    decided: HashMap<ValidatorId, VoteValue>,
}

impl Election {
    pub fn new(validators: Validators, frame_to_decide: u32) -> Self {
        Election {
            validators,
            frame_to_decide,
            votes: HashMap::new(),
            decided: HashMap::new(),
        }
    }

    pub fn frame_to_decide(&self) -> u32 {
        self.frame_to_decide
    }

    /// Drop all election state and start deciding another frame.
    pub fn reset(&mut self, validators: Validators, frame_to_decide: u32) {
        self.validators = validators;
        self.frame_to_decide = frame_to_decide;
        self.votes.clear();
        self.decided.clear();
    }

    /// Calculate Atropos votes for one new root. Returns the decision if
    /// this root completes the election of `frame_to_decide`.
    pub fn process_root<O: RootObserver>(
        &mut self,
        observer: &O,
        new_root: RootAndSlot,
    ) -> Result<Option<AtroposDecision>, ClothoError> {
        if self.decided.len() == self.validators.len() {
            // current election is already decided
            return self.choose_atropos().map(Some);
        }
        if new_root.frame <= self.frame_to_decide {
            // too old, out of interest for the current election
            return Ok(None);
        }
        let round = new_root.frame - self.frame_to_decide;

        let not_decided: Vec<ValidatorId> = self
            .validators
            .sorted_ids()
            .filter(|v| !self.decided.contains_key(v))
            .copied()
            .collect();

        for subject in not_decided {
            let mut vote = VoteValue::default();

            if round == 1 {
                // initial round: vote "yes" iff the subject's root is observed
                let observed =
                    observer.observed_root(&new_root.id, self.frame_to_decide, &subject)?;
                vote.yes = observed.is_some();
                vote.decided = false;
                if let Some(seen) = observed {
                    vote.observed_root = seen;
                }
            } else {
                let prev_roots = observer.observed_roots(&new_root.id, new_root.frame - 1)?;

                let yes_votes = self.validators.new_counter();
                let no_votes = self.validators.new_counter();
                let all_votes = self.validators.new_counter();
                let mut counted: HashMap<ValidatorId, EventId> = HashMap::new();
                let mut subject_hash: Option<EventId> = None;

                for prev_root in &prev_roots {
                    let Some(prev_vote) = self.votes.get(&(prev_root.id, subject)) else {
                        return Err(ClothoError::Invariant(format!(
                            "every root must vote for every undecided subject; \
                             roots processed out of order (root {})",
                            new_root.id
                        )));
                    };
                    if prev_vote.yes {
                        if let Some(h) = subject_hash {
                            if h != prev_vote.observed_root {
                                // two conflicting observed roots both backed
                                // by yes-votes: over 1/3W is faulty
                                return Err(ClothoError::Byzantine {
                                    frame: self.frame_to_decide,
                                    subject,
                                    observed_a: h,
                                    observed_b: prev_vote.observed_root,
                                });
                            }
                        }
                        subject_hash = Some(prev_vote.observed_root);
                        yes_votes.count(prev_root.creator);
                    } else {
                        no_votes.count(prev_root.creator);
                    }
                    if let Some(other) = counted.insert(prev_root.creator, prev_root.id) {
                        // one voter delivered two prev-frame roots: a fork
                        // slipped into the aggregation set
                        return Err(ClothoError::Byzantine {
                            frame: self.frame_to_decide,
                            subject,
                            observed_a: other,
                            observed_b: prev_root.id,
                        });
                    }
                    all_votes.count(prev_root.creator);
                }

                if !all_votes.has_quorum() {
                    return Err(ClothoError::Invariant(format!(
                        "root must be forkless-caused by a quorum of previous roots; \
                         roots processed out of order (root {}, voted stake {})",
                        new_root.id,
                        all_votes.sum()
                    )));
                }

                // vote as the stake-weighted majority of votes
                vote.yes = yes_votes.sum() >= no_votes.sum();
                if vote.yes {
                    if let Some(h) = subject_hash {
                        vote.observed_root = h;
                    }
                }
                // quorum on either side makes the decision final, consistent
                // unless over 1/3W is faulty
                vote.decided = yes_votes.has_quorum() || no_votes.has_quorum();
                if vote.decided {
                    debug!(
                        frame = self.frame_to_decide,
                        subject = %subject,
                        yes = vote.yes,
                        "subject decided"
                    );
                    self.decided.insert(subject, vote);
                }
            }
            // save the vote for later rounds
            self.votes.insert((new_root.id, subject), vote);
        }

        if self.decided.len() == self.validators.len() {
            return self.choose_atropos().map(Some);
        }
        Ok(None)
    }

    /// Pick the Atropos among decided-yes subjects: the one with the
    /// lexicographically smallest observed-root hash. Deterministic across
    /// nodes because the decided map is complete and votes are final.
    fn choose_atropos(&self) -> Result<AtroposDecision, ClothoError> {
        let mut best: Option<EventId> = None;
        for subject in self.validators.sorted_ids() {
            let vote = self.decided.get(subject).ok_or_else(|| {
                ClothoError::Invariant("choose_atropos before all subjects decided".into())
            })?;
            if !vote.yes {
                continue;
            }
            match best {
                None => best = Some(vote.observed_root),
                Some(cur) if vote.observed_root < cur => best = Some(vote.observed_root),
                Some(_) => {}
            }
        }
        let atropos = best.ok_or_else(|| {
            ClothoError::Invariant("election decided with no yes subjects".into())
        })?;
        Ok(AtroposDecision {
            frame: self.frame_to_decide,
            atropos,
        })
    }
}
