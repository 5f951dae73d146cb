//! Verification API
//!
//! Verify sessions by deterministic replay. [`verify_transcript`] is the whole
//! algorithm a third-party verifier reimplements:
//!
//! 1. `H(serverSecret) == serverSecretHash`
//! 2. `H(clientSecret) == clientCommitment` (when a commitment was used)
//! 3. For every record, in order:
//!    - index is `startSequence + position`
//!    - `prevHash` links to genesis or to the previous record
//!    - `hash` recomputes from `(prevHash, serverSecret, seed, index)`
//!    - `positions` re-derive from a fresh stream over the record's own reel lengths
//!
//! A record whose inputs were altered also invalidates the next record, whose
//! hash pointer no longer matches what the chain recomputes to.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tracing::{error, info, instrument};

use crate::core::hash::ChainHash;
use crate::core::rng::StreamRng;
use crate::error::FairnessError;
use crate::ledger::chain::HashChainLedger;
use crate::proof::commitment::{verify_client_reveal, verify_server_reveal};
use crate::proof::transcript::{SessionTranscript, TRANSCRIPT_VERSION};
use crate::session::manager::CommitmentManager;
use crate::session::state::{SessionId, SessionStatus};
use crate::spin::collaborators::PayoutEvaluator;
use crate::spin::orchestrator::with_timeout;

/// Why a record failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum RecordFault {
    /// Record names a different session.
    SessionMismatch {
        /// Session in the record.
        found: SessionId,
    },

    /// Index is not the next in sequence.
    IndexGap {
        /// Index the position implies.
        expected: u64,
        /// Stored index.
        found: u64,
    },

    /// Position in the log has no representable index.
    IndexOverflow {
        /// Offset from the first record.
        offset: u64,
    },

    /// Hash pointer does not link to the preceding record.
    PrevHashMismatch,

    /// Stored hash does not recompute.
    HashMismatch,

    /// Positions differ from a fresh derivation.
    PositionsMismatch {
        /// Freshly derived positions.
        expected: Vec<u32>,
    },

    /// Evaluator produced a different outcome digest.
    OutcomeMismatch,

    /// Stream could not be derived for this record.
    StreamFailure {
        /// Error text.
        reason: String,
    },
}

/// Result of verifying a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVerification {
    /// Stored index.
    pub index: u64,
    /// Did this record pass?
    pub valid: bool,
    /// Every fault found.
    pub faults: Vec<RecordFault>,
}

impl RecordVerification {
    fn push(&mut self, fault: RecordFault) {
        self.faults.push(fault);
        self.valid = false;
    }
}

/// Verdict for a whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionVerification {
    /// Session verified.
    pub session_id: SessionId,
    /// Did verification pass?
    pub valid: bool,
    /// Transcript version was understood.
    pub version_supported: bool,
    /// `H(serverSecret)` matched the published hash.
    pub secret_hash_valid: bool,
    /// Client secret opened the commitment (true when none was used).
    pub client_commitment_valid: bool,
    /// Per-record results, in order.
    pub records: Vec<RecordVerification>,
    /// Hash of the last record as recomputed.
    #[serde(with = "hex")]
    pub final_hash: ChainHash,
}

impl SessionVerification {
    /// Index of the first failing record.
    pub fn first_invalid(&self) -> Option<u64> {
        self.records.iter().find(|r| !r.valid).map(|r| r.index)
    }

    fn refresh(&mut self) {
        self.valid = self.version_supported
            && self.secret_hash_valid
            && self.client_commitment_valid
            && self.records.iter().all(|r| r.valid);
    }
}

/// Verify a transcript by full replay. Pure.
pub fn verify_transcript(transcript: &SessionTranscript) -> SessionVerification {
    let secret = &transcript.server_secret;
    let genesis = transcript.genesis_hash();

    let secret_hash_valid = verify_server_reveal(secret, &transcript.server_secret_hash).is_ok();
    let client_commitment_valid = match (&transcript.client_commitment, &transcript.client_secret) {
        (Some(commitment), Some(revealed)) => verify_client_reveal(revealed, commitment).is_ok(),
        // Ended before the reveal: legal only if nothing was spun.
        (Some(_), None) => transcript.records.is_empty(),
        (None, Some(_)) => false,
        (None, None) => true,
    };

    let mut records = Vec::with_capacity(transcript.records.len());
    let mut expected_prev = genesis;
    let mut stored_prev = genesis;

    for (offset, record) in transcript.records.iter().enumerate() {
        let mut result = RecordVerification { index: record.index, valid: true, faults: Vec::new() };

        if record.session_id != transcript.session_id {
            result.push(RecordFault::SessionMismatch { found: record.session_id });
        }

        let offset = offset as u64;
        match transcript.start_sequence.checked_add(offset) {
            Some(expected) if expected != record.index => {
                result.push(RecordFault::IndexGap { expected, found: record.index });
            }
            Some(_) => {}
            None => result.push(RecordFault::IndexOverflow { offset }),
        }

        if record.prev_hash != expected_prev || record.prev_hash != stored_prev {
            result.push(RecordFault::PrevHashMismatch);
        }

        let recomputed = record.expected_hash(secret);
        if recomputed != record.hash {
            result.push(RecordFault::HashMismatch);
        }

        match StreamRng::derive(secret, &record.seed, record.index, &record.prev_hash)
            .and_then(|mut rng| rng.positions(&record.reel_lengths))
        {
            Ok(expected) if expected != record.positions => {
                result.push(RecordFault::PositionsMismatch { expected });
            }
            Ok(_) => {}
            Err(e) => result.push(RecordFault::StreamFailure { reason: e.to_string() }),
        }

        expected_prev = recomputed;
        stored_prev = record.hash;
        records.push(result);
    }

    let mut verification = SessionVerification {
        session_id: transcript.session_id,
        valid: false,
        version_supported: transcript.version == TRANSCRIPT_VERSION,
        secret_hash_valid,
        client_commitment_valid,
        records,
        final_hash: expected_prev,
    };
    verification.refresh();
    verification
}

// =============================================================================
// SESSION AUDITOR
// =============================================================================

/// Builds transcripts from live state and verifies them.
///
/// A failed verification freezes the session for manual audit.
pub struct SessionAuditor {
    sessions: Arc<CommitmentManager>,
    ledger: HashChainLedger,
    evaluator: Option<Arc<dyn PayoutEvaluator>>,
    io_timeout: Duration,
}

impl SessionAuditor {
    /// Create an auditor that checks hashes and positions.
    pub fn new(
        sessions: Arc<CommitmentManager>,
        ledger: HashChainLedger,
        io_timeout: Duration,
    ) -> Self {
        Self { sessions, ledger, evaluator: None, io_timeout }
    }

    /// Also re-evaluate every outcome digest.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn PayoutEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Assemble the transcript of an ended session.
    pub async fn transcript(&self, session_id: &SessionId) -> Result<SessionTranscript, FairnessError> {
        let handle = self.sessions.get(session_id).await?;
        let (view, client_secret) = {
            let session = handle.lock().await;
            if session.status() != SessionStatus::Ended {
                return Err(FairnessError::NotRevealed { session: *session_id });
            }
            (session.view(), session.client_secret().map(str::to_string))
        };
        let audit = self
            .sessions
            .audit_record(session_id)
            .await
            .ok_or(FairnessError::NotRevealed { session: *session_id })?;

        let records = with_timeout(self.io_timeout, "ledger read", *session_id, self.ledger.records(session_id)).await??;

        Ok(SessionTranscript {
            version: TRANSCRIPT_VERSION,
            session_id: *session_id,
            owner: view.owner,
            game: view.game,
            start_sequence: view.start_sequence,
            server_secret_hash: view.server_secret_hash,
            client_commitment: view.client_commitment,
            client_secret,
            server_secret: audit.server_secret,
            revealed_at: audit.revealed_at,
            records,
        })
    }

    /// Verify an ended session from the ledger.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn verify(&self, session_id: &SessionId) -> Result<SessionVerification, FairnessError> {
        let transcript = self.transcript(session_id).await?;
        let mut verification = verify_transcript(&transcript);

        if let Some(evaluator) = &self.evaluator {
            for (record, result) in transcript.records.iter().zip(verification.records.iter_mut()) {
                let outcome = with_timeout(
                    self.io_timeout,
                    "payout evaluation",
                    *session_id,
                    evaluator.evaluate(&transcript.game, &record.positions),
                )
                .await?;
                match outcome {
                    Ok(outcome) if outcome.digest == record.outcome_digest => {}
                    _ => result.push(RecordFault::OutcomeMismatch),
                }
            }
            verification.refresh();
        }

        if verification.valid {
            info!(spins = transcript.spin_count(), final_hash = %hex::encode(verification.final_hash), "session verified");
        } else {
            error!(
                first_invalid = ?verification.first_invalid(),
                secret_hash_valid = verification.secret_hash_valid,
                client_commitment_valid = verification.client_commitment_valid,
                server_secret = %hex::encode(transcript.server_secret),
                "session failed verification"
            );
            let reason = match verification.first_invalid() {
                Some(index) => format!("verification failed at index {}", index),
                None => "verification failed: commitment check".to_string(),
            };
            self.sessions.freeze(session_id, &reason).await?;
        }

        Ok(verification)
    }
}
