//! Engine Errors
//!
//! One closed error type for every fairness operation. Each variant carries
//! the session (and where relevant the spin index) it concerns, and
//! [`FairnessError::kind`] maps it onto the recovery classes below.
//!
//! | Kind           | Recovery                                              |
//! |----------------|-------------------------------------------------------|
//! | Lifecycle      | rejected at the API boundary                          |
//! | Commitment     | operation rejected, session stays usable              |
//! | ChainIntegrity | session frozen and flagged for manual audit           |
//! | Concurrency    | retried locally, then surfaced as "retry requested"   |
//! | Input          | rejected at the API boundary                          |
//! | Collaborator   | external dependency failed, safe to retry             |
//! | Fatal          | implementation bug, logged with full inputs           |

use serde::{Serialize, Deserialize};

use crate::core::rng::RngError;
use crate::ledger::store::StoreError;
use crate::session::state::{PlayerId, SessionId, SessionStatus};

/// Recovery class of a [`FairnessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Session missing or in the wrong lifecycle state.
    Lifecycle,
    /// Client commitment handshake rejected.
    Commitment,
    /// Hash chain or secret commitment does not verify.
    ChainIntegrity,
    /// Lost a race or timed out.
    Concurrency,
    /// Malformed caller input.
    Input,
    /// External collaborator or storage failed.
    Collaborator,
    /// Should never happen.
    Fatal,
}

/// Errors returned by the fairness engine.
#[derive(Debug, thiserror::Error)]
pub enum FairnessError {
    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------
    /// No session with this id.
    #[error("session {session} not found")]
    SessionNotFound {
        /// Requested session.
        session: SessionId,
    },

    /// Owner already has a session that has not ended.
    #[error("owner {owner} already has active session {session}")]
    SessionAlreadyActive {
        /// Owner.
        owner: PlayerId,
        /// Their open session.
        session: SessionId,
    },

    /// Session already Ended.
    #[error("session {session} already ended")]
    AlreadyEnded {
        /// Session.
        session: SessionId,
    },

    /// Session cannot accept spins in its current state.
    #[error("session {session} is not active ({status:?})")]
    SessionInactive {
        /// Session.
        session: SessionId,
        /// Current status.
        status: SessionStatus,
    },

    /// Server secret not revealed yet, nothing to verify.
    #[error("session {session} has not revealed its server secret")]
    NotRevealed {
        /// Session.
        session: SessionId,
    },

    /// No index is left after the last record.
    #[error("session {session}: sequence exhausted after index {index}")]
    SequenceExhausted {
        /// Session.
        session: SessionId,
        /// Last recorded index.
        index: u64,
    },

    /// Lifecycle edge not allowed by the state machine.
    #[error("session {session} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        /// Session.
        session: SessionId,
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },

    // -------------------------------------------------------------------------
    // Commitment protocol
    // -------------------------------------------------------------------------
    /// Reveal called with no pending commitment, or spin attempted before reveal.
    #[error("session {session}: client secret required")]
    ClientSecretRequired {
        /// Session.
        session: SessionId,
    },

    /// Revealed client secret does not hash to the commitment.
    #[error("session {session}: client secret does not match commitment")]
    VerificationFailed {
        /// Session.
        session: SessionId,
    },

    /// Client secret was already verified.
    #[error("session {session}: client secret already verified")]
    AlreadyVerified {
        /// Session.
        session: SessionId,
    },

    // -------------------------------------------------------------------------
    // Chain integrity
    // -------------------------------------------------------------------------
    /// Stored record does not recompute to its hash, or the chain has a gap.
    #[error("session {session}: hash chain broken at index {index}: {reason}")]
    ChainBroken {
        /// Session.
        session: SessionId,
        /// First failing index.
        index: u64,
        /// What failed.
        reason: String,
    },

    /// First record does not point at the genesis hash.
    #[error("session {session}: first record does not match genesis")]
    GenesisMismatch {
        /// Session.
        session: SessionId,
    },

    /// Revealed server secret does not hash to the published commitment.
    #[error("session {session}: server secret does not match published hash")]
    SecretHashMismatch {
        /// Session.
        session: SessionId,
    },

    /// Session was frozen after an integrity failure.
    #[error("session {session} is frozen for audit: {reason}")]
    SessionFrozen {
        /// Session.
        session: SessionId,
        /// Freeze reason.
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Concurrency
    // -------------------------------------------------------------------------
    /// Caller's expected index disagrees with the chain tip.
    #[error("session {session}: expected index {expected}, chain is at {actual}")]
    NonceMismatch {
        /// Session.
        session: SessionId,
        /// Index the caller expected.
        expected: u64,
        /// Actual next index.
        actual: u64,
    },

    /// The spin at this index was already recorded with the same seed.
    #[error("session {session}: spin {index} already recorded")]
    DuplicateSpin {
        /// Session.
        session: SessionId,
        /// Recorded index.
        index: u64,
    },

    /// Optimistic update lost every retry.
    #[error("session {session}: version conflict after {attempts} attempts")]
    ConcurrencyConflict {
        /// Session.
        session: SessionId,
        /// Spin the conflict belongs to, if any.
        index: Option<u64>,
        /// Attempts made.
        attempts: u32,
    },

    /// An external call exceeded its timeout.
    #[error("session {session}: {operation} timed out")]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// Session.
        session: SessionId,
    },

    // -------------------------------------------------------------------------
    // Input
    // -------------------------------------------------------------------------
    /// Per-spin seed rejected.
    #[error("invalid seed: {reason}")]
    InvalidSeed {
        /// Why.
        reason: String,
    },

    /// Reel lengths from the provider cannot be sampled.
    #[error("session {session}: invalid reel lengths: {reason}")]
    InvalidReelLengths {
        /// Session.
        session: SessionId,
        /// Why.
        reason: String,
    },

    /// Balance cannot cover the stake.
    #[error("owner {owner}: balance {balance} cannot cover {required}")]
    InsufficientFunds {
        /// Owner.
        owner: PlayerId,
        /// Current balance.
        balance: u64,
        /// Amount needed.
        required: u64,
    },

    /// Request could not be parsed.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Why.
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Collaborators
    // -------------------------------------------------------------------------
    /// Reel provider, evaluator or balance ledger failed.
    #[error("{operation} failed: {message}")]
    Collaborator {
        /// Operation name.
        operation: &'static str,
        /// Error text.
        message: String,
    },

    /// Ledger storage failed.
    #[error("ledger storage: {0}")]
    Storage(#[from] StoreError),

    // -------------------------------------------------------------------------
    // Fatal
    // -------------------------------------------------------------------------
    /// Stream RNG failed. Statistically impossible outside a bug.
    #[error("session {session}: stream rng failed at index {index}: {source}")]
    Rng {
        /// Session.
        session: SessionId,
        /// Spin index.
        index: u64,
        /// Underlying failure.
        source: RngError,
    },
}

impl FairnessError {
    /// Recovery class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound { .. }
            | Self::SessionAlreadyActive { .. }
            | Self::AlreadyEnded { .. }
            | Self::SessionInactive { .. }
            | Self::NotRevealed { .. }
            | Self::SequenceExhausted { .. }
            | Self::IllegalTransition { .. } => ErrorKind::Lifecycle,

            Self::ClientSecretRequired { .. }
            | Self::VerificationFailed { .. }
            | Self::AlreadyVerified { .. } => ErrorKind::Commitment,

            Self::ChainBroken { .. }
            | Self::GenesisMismatch { .. }
            | Self::SecretHashMismatch { .. }
            | Self::SessionFrozen { .. } => ErrorKind::ChainIntegrity,

            Self::NonceMismatch { .. }
            | Self::DuplicateSpin { .. }
            | Self::ConcurrencyConflict { .. }
            | Self::Timeout { .. } => ErrorKind::Concurrency,

            Self::InvalidSeed { .. }
            | Self::InvalidReelLengths { .. }
            | Self::InsufficientFunds { .. }
            | Self::InvalidRequest { .. } => ErrorKind::Input,

            Self::Collaborator { .. } | Self::Storage(_) => ErrorKind::Collaborator,

            Self::Rng { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether the caller should retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::Timeout { .. } | Self::Collaborator { .. } | Self::Storage(_)
        )
    }

    /// Whether the session must be frozen.
    pub fn breaks_chain(&self) -> bool {
        matches!(
            self,
            Self::ChainBroken { .. } | Self::GenesisMismatch { .. } | Self::SecretHashMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let session = SessionId([1; 16]);

        assert_eq!(FairnessError::SessionNotFound { session }.kind(), ErrorKind::Lifecycle);
        assert_eq!(FairnessError::AlreadyVerified { session }.kind(), ErrorKind::Commitment);
        assert_eq!(FairnessError::GenesisMismatch { session }.kind(), ErrorKind::ChainIntegrity);
        assert_eq!(
            FairnessError::NonceMismatch { session, expected: 1, actual: 2 }.kind(),
            ErrorKind::Concurrency
        );
        assert_eq!(
            FairnessError::Rng { session, index: 0, source: RngError::EmptyRange }.kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_retry_and_freeze_flags() {
        let session = SessionId([1; 16]);

        assert!(FairnessError::Timeout { operation: "ledger append", session }.is_retryable());
        assert!(!FairnessError::DuplicateSpin { session, index: 3 }.is_retryable());
        assert!(FairnessError::ChainBroken { session, index: 3, reason: "x".into() }.breaks_chain());
        assert!(!FairnessError::VerificationFailed { session }.breaks_chain());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let session = SessionId([0; 16]);
        let msg = FairnessError::NonceMismatch { session, expected: 4, actual: 7 }.to_string();
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
        assert!(msg.contains('4') && msg.contains('7'));
    }
}
