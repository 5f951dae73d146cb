//! # SpinProof Fairness Engine
//!
//! Provably-fair spin engine: a dual commitment between player and server,
//! a hash-chained audit log of every spin, and a deterministic stream RNG
//! that turns committed secrets into reel stop positions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    SPINPROOF ENGINE                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  core/           - Protocol primitives                       │
//! │  ├── hash.rs     - SHA-256 commitments and chain hashes      │
//! │  └── rng.rs      - HKDF stream RNG with rejection sampling   │
//! │                                                              │
//! │  session/        - Commitment manager                        │
//! │  ├── state.rs    - Session lifecycle state machine           │
//! │  ├── store.rs    - Session rows and audits (memory, JSON)    │
//! │  └── manager.rs  - Create / reveal / end                     │
//! │                                                              │
//! │  ledger/         - Hash chain ledger                         │
//! │  ├── record.rs   - Spin records                              │
//! │  ├── store.rs    - Append-only storage (memory, JSONL)       │
//! │  └── chain.rs    - Tip recomputation, compare-and-append     │
//! │                                                              │
//! │  spin/           - Spin orchestrator                         │
//! │  ├── collaborators.rs - Reels, payouts, balances             │
//! │  └── orchestrator.rs  - One atomic spin                      │
//! │                                                              │
//! │  proof/          - Session auditor                           │
//! │  ├── commitment.rs - Reveal checks                           │
//! │  ├── transcript.rs - Publishable transcript                  │
//! │  └── verify.rs     - Replay verification                     │
//! │                                                              │
//! │  engine.rs       - Facade over all of the above              │
//! │  protocol.rs     - JSON request / response types             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` module and [`proof::verify_transcript`] are **100% deterministic**:
//! - Fixed-width big-endian integer encodings
//! - Byte-identical domain labels and retry cap
//! - No system time or process state in any derived value
//!
//! Given the revealed secrets and the stored records, any conforming
//! implementation reaches the **identical verdict**.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod proof;
pub mod protocol;
pub mod session;
pub mod spin;

// Re-export commonly used types
pub use config::EngineConfig;
pub use core::hash::ChainHash;
pub use core::rng::StreamRng;
pub use engine::{FairnessEngine, SessionEnded};
pub use error::{ErrorKind, FairnessError};
pub use proof::{verify_transcript, SessionTranscript, SessionVerification};
pub use session::{GameContext, PlayerId, SessionId, SessionStatus};
pub use spin::{SpinRequest, SpinResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
