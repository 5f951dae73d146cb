//! Spin execution and the collaborators it drives.

pub mod collaborators;
pub mod orchestrator;

pub use collaborators::{
    outcome_digest, AccountSnapshot, BalanceError, BalanceLedger, CollaboratorError, MemoryBalanceLedger,
    PayoutEvaluator, ReelLengthProvider, ReelMode, SpinOutcome, StripReelSet,
};
pub use orchestrator::{SpinOrchestrator, SpinRequest, SpinResult};
