//! Event validation pipeline.
//!
//! Five checkers run in a fixed order, each with explicit fail codes:
//! basic (sizes and field ranges), epoch (membership and epoch gating),
//! parents (known, gapless seq chain, lamport), heavy (signature against
//! the epoch's public-key set), gas power (creator's budget).

use crate::config::EngineConfig;
use crate::constants;
use crate::error::ClothoError;
use crate::event::{Event, EventId};
use crate::store::DagStore;
use crate::validators::{ValidatorId, Validators};

/// Validation failures; the event is rejected and the error returned to the
/// caller. A missing parent additionally aborts the engine, since the
/// transport is obliged to deliver a topologically valid stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    // basic
    #[error("unsupported version {got}, want {want}")]
    VersionMismatch { got: u32, want: u32 },
    #[error("zero seq")]
    ZeroSeq,
    #[error("zero lamport")]
    ZeroLamport,
    #[error("zero claimed time")]
    ZeroClaimedTime,
    #[error("too many parents: {got} > {max}")]
    TooManyParents { got: usize, max: usize },
    #[error("extra payload too big: {got} > {max}")]
    TooBigExtra { got: usize, max: usize },
    #[error("duplicate parent reference")]
    DuplicateParents,
    #[error("serialized event too big")]
    EventTooBig,

    // epoch
    #[error("wrong epoch {got}, want {want}")]
    WrongEpoch { got: u32, want: u32 },
    #[error("creator {0} is not a validator of this epoch")]
    UnknownCreator(ValidatorId),

    // parents
    #[error("parent not found: {0}")]
    MissingParent(EventId),
    #[error("parent {0} belongs to another epoch")]
    ParentEpochMismatch(EventId),
    #[error("first parent must be the creator's event at seq {expected_seq}")]
    MissingSelfParent { expected_seq: u32 },
    #[error("first event of a creator must not reference own events")]
    UnexpectedSelfParent,
    #[error("lamport {got} below required minimum {min}")]
    WrongLamport { got: u32, min: u32 },

    // heavy
    #[error("bad creator signature")]
    BadSignature,

    // gas power
    #[error("gas power used {used} above available {available}")]
    TooMuchGasUsed { used: u64, available: u64 },
    #[error("gas power left {got}, want {want}")]
    WrongGasLeft { got: u64, want: u64 },

    // engine-level consistency of claimed derived metadata
    #[error("claimed frame {claimed} does not match computed {computed}")]
    FrameMismatch { claimed: u32, computed: u32 },
    #[error("claimed root flag {claimed} does not match computed {computed}")]
    RootMismatch { claimed: bool, computed: bool },
}

/// Everything the checkers need to look at.
pub struct CheckContext<'a> {
    pub store: &'a DagStore,
    pub validators: &'a Validators,
    pub epoch: u32,
}

/// The five-stage checker pipeline.
pub struct Checkers {
    cfg: EngineConfig,
}

impl Checkers {
    pub fn new(cfg: EngineConfig) -> Self {
        Checkers { cfg }
    }

    /// Run all checkers in order; the first failure wins.
    pub fn validate(&self, e: &Event, ctx: &CheckContext<'_>) -> Result<(), ClothoError> {
        self.basic(e)?;
        self.epoch(e, ctx)?;
        self.parents(e, ctx)?;
        self.heavy(e, ctx)?;
        self.gas_power(e, ctx)?;
        Ok(())
    }

    fn basic(&self, e: &Event) -> Result<(), ValidationError> {
        let h = &e.header;
        if h.version != constants::PROTOCOL_VERSION {
            return Err(ValidationError::VersionMismatch {
                got: h.version,
                want: constants::PROTOCOL_VERSION,
            });
        }
        if h.seq == 0 {
            return Err(ValidationError::ZeroSeq);
        }
        if h.lamport == 0 {
            return Err(ValidationError::ZeroLamport);
        }
        if h.claimed_time == 0 {
            return Err(ValidationError::ZeroClaimedTime);
        }
        if h.parents.len() > self.cfg.max_parents {
            return Err(ValidationError::TooManyParents {
                got: h.parents.len(),
                max: self.cfg.max_parents,
            });
        }
        if h.extra.len() > constants::MAX_EXTRA_BYTES {
            return Err(ValidationError::TooBigExtra {
                got: h.extra.len(),
                max: constants::MAX_EXTRA_BYTES,
            });
        }
        let mut seen = std::collections::HashSet::new();
        for p in &h.parents {
            if !seen.insert(p) {
                return Err(ValidationError::DuplicateParents);
            }
        }
        let payload: usize = e.transactions.iter().map(|tx| tx.len()).sum();
        if payload + h.extra.len() > constants::MAX_EVENT_BYTES {
            return Err(ValidationError::EventTooBig);
        }
        Ok(())
    }

    fn epoch(&self, e: &Event, ctx: &CheckContext<'_>) -> Result<(), ValidationError> {
        if e.header.epoch != ctx.epoch {
            return Err(ValidationError::WrongEpoch {
                got: e.header.epoch,
                want: ctx.epoch,
            });
        }
        if !ctx.validators.contains(&e.header.creator) {
            return Err(ValidationError::UnknownCreator(e.header.creator));
        }
        Ok(())
    }

    fn parents(&self, e: &Event, ctx: &CheckContext<'_>) -> Result<(), ClothoError> {
        let h = &e.header;
        let mut max_parent_lamport = 0u32;
        for p in &h.parents {
            if p.epoch() != h.epoch {
                return Err(ValidationError::ParentEpochMismatch(*p).into());
            }
            let parent = ctx
                .store
                .get_header(p)?
                .ok_or(ValidationError::MissingParent(*p))?;
            max_parent_lamport = max_parent_lamport.max(parent.lamport);
        }
        if h.lamport < max_parent_lamport + 1 {
            return Err(ValidationError::WrongLamport {
                got: h.lamport,
                min: max_parent_lamport + 1,
            }
            .into());
        }

        if h.seq == 1 {
            for p in &h.parents {
                let parent = ctx
                    .store
                    .get_header(p)?
                    .ok_or(ValidationError::MissingParent(*p))?;
                if parent.creator == h.creator {
                    return Err(ValidationError::UnexpectedSelfParent.into());
                }
            }
        } else {
            let sp = h
                .self_parent()
                .ok_or(ValidationError::MissingSelfParent { expected_seq: h.seq - 1 })?;
            let parent = ctx
                .store
                .get_header(sp)?
                .ok_or(ValidationError::MissingParent(*sp))?;
            if parent.creator != h.creator || parent.seq != h.seq - 1 {
                return Err(ValidationError::MissingSelfParent { expected_seq: h.seq - 1 }.into());
            }
        }
        Ok(())
    }

    fn heavy(&self, e: &Event, ctx: &CheckContext<'_>) -> Result<(), ValidationError> {
        // keyless validator sets (simulations, scheme tests) skip signature
        // verification; key distribution is the application's concern
        let Some(pubkey) = ctx.validators.pubkey_of(&e.header.creator) else {
            return Ok(());
        };
        if !e.verify(pubkey) {
            return Err(ValidationError::BadSignature);
        }
        Ok(())
    }

    /// Gas power available to an event: the self-parent's remainder plus
    /// stake-proportional regeneration over the claimed-time delta, capped.
    pub fn available_gas_power(
        &self,
        e_header: &crate::event::EventHeader,
        ctx: &CheckContext<'_>,
    ) -> Result<u64, ClothoError> {
        if e_header.seq == 1 {
            return Ok(self.cfg.gas_power_startup);
        }
        let sp = e_header
            .self_parent()
            .ok_or(ValidationError::MissingSelfParent {
                expected_seq: e_header.seq - 1,
            })?;
        let parent = ctx
            .store
            .get_header(sp)?
            .ok_or(ValidationError::MissingParent(*sp))?;
        let elapsed_secs = e_header.claimed_time.saturating_sub(parent.claimed_time) / 1_000_000_000;
        let stake = ctx.validators.stake_of(&e_header.creator) as u128;
        let total = ctx.validators.total_stake().max(1) as u128;
        let regen = (elapsed_secs as u128 * self.cfg.gas_power_per_second as u128 * stake / total)
            .min(u64::MAX as u128) as u64;
        Ok(parent
            .gas_power_left
            .saturating_add(regen)
            .min(self.cfg.gas_power_max))
    }

    fn gas_power(&self, e: &Event, ctx: &CheckContext<'_>) -> Result<(), ClothoError> {
        let available = self.available_gas_power(&e.header, ctx)?;
        if e.header.gas_power_used > available {
            return Err(ValidationError::TooMuchGasUsed {
                used: e.header.gas_power_used,
                available,
            }
            .into());
        }
        let want = available - e.header.gas_power_used;
        if e.header.gas_power_left != want {
            return Err(ValidationError::WrongGasLeft {
                got: e.header.gas_power_left,
                want,
            }
            .into());
        }
        Ok(())
    }
}
