//! Engine-wide error taxonomy.
//!
//! Every error kind carries a fixed handling policy:
//! - transient KV failures are retried by the store and escalate here only
//!   once the retry budget is spent;
//! - validation errors are returned to the caller, the event is rejected;
//! - forks are handled internally (stored if tolerated, demoted from voting);
//! - Byzantine, invariant, and codec errors are fatal — the top-level driver
//!   performs a final clean flush and exits with the matching code.

use crate::check::ValidationError;
use crate::event::codec::CodecError;
use crate::event::EventId;
use crate::kvdb::KvError;
use crate::store::StoreError;
use crate::validators::ValidatorId;

/// Top-level error type surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum ClothoError {
    /// Storage failure, already past the retry budget.
    #[error("storage: {0}")]
    Store(#[from] StoreError),

    /// Event rejected by the validation pipeline.
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    /// Header codec failure: round-trip mismatch indicates corruption.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// More than 1/3 of total stake is provably faulty: two conflicting
    /// observed roots each gathered yes-votes for the same subject.
    #[error(
        "byzantine fault: conflicting observed roots {observed_a} != {observed_b} \
         for subject {subject} at election frame {frame} (more than 1/3W faulty)"
    )]
    Byzantine {
        frame: u32,
        subject: ValidatorId,
        observed_a: EventId,
        observed_b: EventId,
    },

    /// Internal invariant violated; continuing would corrupt consensus state.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// An application callback failed or missed a hard deadline.
    #[error("application callback: {0}")]
    Callback(String),
}

impl ClothoError {
    /// Process exit code for the top-level driver. 0 is reserved for normal
    /// termination; every fatal kind gets a distinct non-zero code.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClothoError::Validation(ValidationError::MissingParent(_)) => 4,
            ClothoError::Validation(_) => 1,
            ClothoError::Byzantine { .. } => 2,
            ClothoError::Store(StoreError::Codec(_)) => 5,
            ClothoError::Store(StoreError::Kv(KvError::Corruption(_))) => 3,
            ClothoError::Store(_) => 3,
            ClothoError::Codec(_) => 5,
            ClothoError::Invariant(_) => 6,
            ClothoError::Callback(_) => 7,
        }
    }

    /// True for kinds that must abort the engine after a final clean flush.
    /// A missing parent is fatal even though it is a validation error: the
    /// transport is obliged to deliver a topologically valid stream.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClothoError::Validation(ValidationError::MissingParent(_)) => true,
            ClothoError::Validation(_) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_for_fatal_kinds() {
        let byz = ClothoError::Byzantine {
            frame: 1,
            subject: ValidatorId([0u8; 20]),
            observed_a: EventId([1u8; 32]),
            observed_b: EventId([2u8; 32]),
        };
        let inv = ClothoError::Invariant("out of order".into());
        let kv = ClothoError::Store(StoreError::Kv(KvError::Corruption("dirty".into())));
        assert_ne!(byz.exit_code(), inv.exit_code());
        assert_ne!(byz.exit_code(), kv.exit_code());
        assert_ne!(inv.exit_code(), kv.exit_code());
        assert!(byz.is_fatal());
        assert!(inv.is_fatal());
    }

    #[test]
    fn validation_is_not_fatal() {
        let err = ClothoError::Validation(ValidationError::ZeroSeq);
        assert!(!err.is_fatal());
        assert_eq!(err.exit_code(), 1);
    }
}
