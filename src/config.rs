//! Engine Configuration
//!
//! Tunables for the fairness engine. Defaults suit tests and the demo binary;
//! deployments override them through `SPINPROOF_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Largest accepted `start_sequence`. Leaves the upper half of the index
/// space for spins.
pub const MAX_START_SEQUENCE: u64 = i64::MAX as u64;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Index of the first spin record in every new session.
    pub start_sequence: u64,
    /// Timeout applied to every ledger and collaborator call.
    pub io_timeout: Duration,
    /// Optimistic-update attempts for balance settlement.
    pub balance_retry_limit: u32,
    /// Longest accepted per-spin seed, in bytes.
    pub max_seed_len: usize,
    /// Most reels a provider may return.
    pub max_reels: usize,
    /// Directory for the file-backed ledger. `None` keeps the ledger in memory.
    pub ledger_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_sequence: 0,
            io_timeout: Duration::from_millis(2000),
            balance_retry_limit: 3,
            max_seed_len: 256,
            max_reels: 16,
            ledger_dir: None,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            start_sequence: env_parse("SPINPROOF_START_SEQUENCE")
                .filter(|n: &u64| *n <= MAX_START_SEQUENCE)
                .unwrap_or(defaults.start_sequence),
            io_timeout: env_parse("SPINPROOF_IO_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.io_timeout),
            balance_retry_limit: env_parse("SPINPROOF_BALANCE_RETRIES")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.balance_retry_limit),
            max_seed_len: env_parse("SPINPROOF_MAX_SEED_LEN")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_seed_len),
            max_reels: env_parse("SPINPROOF_MAX_REELS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_reels),
            ledger_dir: std::env::var("SPINPROOF_LEDGER_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
