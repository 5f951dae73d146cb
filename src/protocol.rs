//! Protocol Messages
//!
//! JSON wire format between the API layer and the engine. Identifiers travel
//! as UUID strings and hashes as lowercase hex. The server secret appears only
//! in `session_ended`, `transcript` and post-end `session` responses.

use serde::{Serialize, Deserialize};

use crate::core::hash::ChainHash;
use crate::engine::SessionEnded;
use crate::error::FairnessError;
use crate::proof::transcript::SessionTranscript;
use crate::proof::verify::SessionVerification;
use crate::session::state::{GameContext, PlayerId, SessionId, SessionStatus, SessionView};
use crate::spin::orchestrator::{SpinRequest, SpinResult};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Requests handled by [`crate::FairnessEngine::handle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Open a session.
    CreateSession {
        /// Session owner.
        owner: PlayerId,
        /// Game parameters.
        game: GameContext,
        /// `H(clientSecret)`, if the client commits to a secret.
        #[serde(default, with = "crate::core::hash::hex_option")]
        client_commitment: Option<ChainHash>,
    },

    /// Reveal the committed client secret.
    RevealClientSecret {
        /// Session.
        session_id: SessionId,
        /// Client secret.
        secret: String,
    },

    /// Spin once.
    ExecuteSpin(SpinRequest),

    /// End the session and reveal the server secret.
    EndSession {
        /// Session.
        session_id: SessionId,
    },

    /// Replay-verify an ended session.
    VerifySession {
        /// Session.
        session_id: SessionId,
    },

    /// Fetch the transcript of an ended session.
    ExportTranscript {
        /// Session.
        session_id: SessionId,
    },

    /// Fetch the public session view.
    GetSession {
        /// Session.
        session_id: SessionId,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Responses produced by [`crate::FairnessEngine::handle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerResponse {
    /// Session opened.
    SessionCreated {
        /// New session.
        session_id: SessionId,
        /// `H(serverSecret)`.
        #[serde(with = "hex")]
        server_secret_hash: ChainHash,
        /// Index of the first spin.
        start_sequence: u64,
        /// Initial status.
        status: SessionStatus,
    },

    /// Client secret opened its commitment.
    ClientSecretVerified {
        /// Session.
        session_id: SessionId,
    },

    /// Spin committed.
    SpinExecuted(SpinResult),

    /// Server secret revealed.
    SessionEnded(SessionEnded),

    /// Verification verdict.
    SessionVerified(SessionVerification),

    /// Session transcript.
    Transcript(SessionTranscript),

    /// Session view.
    Session(SessionView),

    /// Request failed.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
        /// Whether retrying the same request may succeed.
        retryable: bool,
    },
}

impl ServerResponse {
    /// Error response for an engine failure.
    pub fn error(err: &FairnessError) -> Self {
        Self::Error {
            code: ErrorCode::from(err),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Session not found.
    SessionNotFound,
    /// Owner already has an open session.
    SessionAlreadyActive,
    /// Session already ended.
    AlreadyEnded,
    /// Session cannot spin.
    SessionInactive,
    /// Server secret not revealed yet.
    NotRevealed,
    /// Session ran out of sequence indices.
    SequenceExhausted,
    /// Lifecycle edge not allowed.
    IllegalTransition,
    /// Client secret must be revealed first, or no commitment is pending.
    ClientSecretRequired,
    /// Client secret does not match commitment.
    VerificationFailed,
    /// Client secret already verified.
    AlreadyVerified,
    /// Hash chain broken.
    ChainBroken,
    /// Genesis pointer mismatch.
    GenesisMismatch,
    /// Server secret hash mismatch.
    SecretHashMismatch,
    /// Session frozen for audit.
    SessionFrozen,
    /// Expected index disagrees with chain.
    NonceMismatch,
    /// Spin already recorded.
    DuplicateSpin,
    /// Lost optimistic retries.
    ConcurrencyConflict,
    /// Operation timed out.
    Timeout,
    /// Seed rejected.
    InvalidSeed,
    /// Reel lengths rejected.
    InvalidReelLengths,
    /// Balance too low.
    InsufficientFunds,
    /// Request malformed.
    InvalidRequest,
    /// External collaborator failed.
    CollaboratorFailure,
    /// Ledger storage failed.
    StorageFailure,
    /// Internal error.
    InternalError,
}

impl From<&FairnessError> for ErrorCode {
    fn from(err: &FairnessError) -> Self {
        match err {
            FairnessError::SessionNotFound { .. } => Self::SessionNotFound,
            FairnessError::SessionAlreadyActive { .. } => Self::SessionAlreadyActive,
            FairnessError::AlreadyEnded { .. } => Self::AlreadyEnded,
            FairnessError::SessionInactive { .. } => Self::SessionInactive,
            FairnessError::NotRevealed { .. } => Self::NotRevealed,
            FairnessError::SequenceExhausted { .. } => Self::SequenceExhausted,
            FairnessError::IllegalTransition { .. } => Self::IllegalTransition,
            FairnessError::ClientSecretRequired { .. } => Self::ClientSecretRequired,
            FairnessError::VerificationFailed { .. } => Self::VerificationFailed,
            FairnessError::AlreadyVerified { .. } => Self::AlreadyVerified,
            FairnessError::ChainBroken { .. } => Self::ChainBroken,
            FairnessError::GenesisMismatch { .. } => Self::GenesisMismatch,
            FairnessError::SecretHashMismatch { .. } => Self::SecretHashMismatch,
            FairnessError::SessionFrozen { .. } => Self::SessionFrozen,
            FairnessError::NonceMismatch { .. } => Self::NonceMismatch,
            FairnessError::DuplicateSpin { .. } => Self::DuplicateSpin,
            FairnessError::ConcurrencyConflict { .. } => Self::ConcurrencyConflict,
            FairnessError::Timeout { .. } => Self::Timeout,
            FairnessError::InvalidSeed { .. } => Self::InvalidSeed,
            FairnessError::InvalidReelLengths { .. } => Self::InvalidReelLengths,
            FairnessError::InsufficientFunds { .. } => Self::InsufficientFunds,
            FairnessError::InvalidRequest { .. } => Self::InvalidRequest,
            FairnessError::Collaborator { .. } => Self::CollaboratorFailure,
            FairnessError::Storage(_) => Self::StorageFailure,
            FairnessError::Rng { .. } => Self::InternalError,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientRequest {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerResponse {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
