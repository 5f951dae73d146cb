//! Fairness Proofs
//!
//! Provides verifiable spin outcomes through:
//! - Client/server commitment checks
//! - Self-contained session transcripts
//! - Verification by deterministic replay
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PROOF SYSTEM                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  commitment.rs   - Commit / reveal checks                   │
//! │  transcript.rs   - Publishable session transcript           │
//! │  verify.rs       - Replay verification + session auditor    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod commitment;
pub mod transcript;
pub mod verify;

pub use commitment::{ClientCommitment, CommitmentError, verify_client_reveal, verify_server_reveal};
pub use transcript::{SessionTranscript, TRANSCRIPT_VERSION};
pub use verify::{
    verify_transcript, RecordFault, RecordVerification, SessionAuditor, SessionVerification,
};
