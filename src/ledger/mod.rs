//! Spin Ledger
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SPIN LEDGER                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  record.rs  - Immutable spin record + chain hash            │
//! │  store.rs   - Index-addressed append-only storage           │
//! │  chain.rs   - Tip recomputation, compare-and-append         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod record;
pub mod store;
pub mod chain;

pub use record::{SpinRecord, validate_seed};
pub use store::{LedgerStore, MemoryLedgerStore, FileLedgerStore, StoreError};
pub use chain::{HashChainLedger, ChainTip, AppendRequest};
