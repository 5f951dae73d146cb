//! External Collaborators
//!
//! Contracts for the services a spin depends on but does not own:
//! reel lengths, payout evaluation and the player balance. Each one is an
//! async trait so deployments can back it with anything.
//!
//! `StripReelSet` and `MemoryBalanceLedger` are the in-process implementations
//! used by the demo binary and the tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use tokio::sync::RwLock;

use crate::core::hash::{ChainHash, ChainHasher};
use crate::session::state::{GameContext, PlayerId};

/// Domain separator for reference outcome digests.
pub const OUTCOME_DOMAIN: &[u8] = b"SPINPROOF_OUTCOME_V1";

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

/// Evaluated result of one spin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinOutcome {
    /// Amount credited to the player.
    pub win_amount: u64,
    /// Opaque digest committed into the spin record.
    #[serde(with = "hex")]
    pub digest: ChainHash,
}

/// Supplies the reel lengths for a game mode.
#[async_trait]
pub trait ReelLengthProvider: Send + Sync {
    /// Ordered reel lengths, one per reel.
    async fn reel_lengths(&self, game_mode: &str) -> Result<Vec<u32>, CollaboratorError>;
}

/// Turns reel positions into a win amount and outcome digest.
///
/// Must be deterministic: the auditor re-evaluates stored positions and
/// compares digests.
#[async_trait]
pub trait PayoutEvaluator: Send + Sync {
    /// Evaluate one spin.
    async fn evaluate(&self, game: &GameContext, positions: &[u32]) -> Result<SpinOutcome, CollaboratorError>;
}

// =============================================================================
// BALANCE LEDGER
// =============================================================================

/// Balance and its optimistic version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Current balance.
    pub balance: u64,
    /// Bumped by every successful write.
    pub version: u64,
}

/// Balance update failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    /// Stored version moved since the caller's snapshot.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// Caller's version.
        expected: u64,
        /// Stored version.
        actual: u64,
    },

    /// Applying the delta would go negative.
    #[error("balance {balance} cannot cover {required}")]
    InsufficientFunds {
        /// Current balance.
        balance: u64,
        /// Amount needed.
        required: u64,
    },

    /// Backend failure.
    #[error("balance ledger unavailable: {0}")]
    Unavailable(String),
}

/// Optimistic-locked balance store.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Current balance and version.
    async fn snapshot(&self, owner: &PlayerId) -> Result<AccountSnapshot, BalanceError>;

    /// Apply `delta` if the stored version still equals `expected_version`.
    ///
    /// On success the version is incremented atomically with the balance.
    async fn apply(&self, owner: &PlayerId, delta: i64, expected_version: u64) -> Result<AccountSnapshot, BalanceError>;
}

/// In-process balance ledger.
#[derive(Default)]
pub struct MemoryBalanceLedger {
    accounts: RwLock<BTreeMap<PlayerId, AccountSnapshot>>,
}

impl MemoryBalanceLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an account unconditionally.
    pub async fn deposit(&self, owner: PlayerId, amount: u64) -> AccountSnapshot {
        let mut accounts = self.accounts.write().await;
        let account = accounts.entry(owner).or_default();
        account.balance = account.balance.saturating_add(amount);
        account.version += 1;
        *account
    }
}

#[async_trait]
impl BalanceLedger for MemoryBalanceLedger {
    async fn snapshot(&self, owner: &PlayerId) -> Result<AccountSnapshot, BalanceError> {
        Ok(self.accounts.read().await.get(owner).copied().unwrap_or_default())
    }

    async fn apply(&self, owner: &PlayerId, delta: i64, expected_version: u64) -> Result<AccountSnapshot, BalanceError> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.entry(*owner).or_default();

        if account.version != expected_version {
            return Err(BalanceError::VersionConflict { expected: expected_version, actual: account.version });
        }

        let next = i128::from(account.balance) + i128::from(delta);
        if next < 0 {
            return Err(BalanceError::InsufficientFunds {
                balance: account.balance,
                required: delta.unsigned_abs(),
            });
        }

        account.balance = u64::try_from(next).unwrap_or(u64::MAX);
        account.version += 1;
        Ok(*account)
    }
}

// =============================================================================
// REFERENCE REEL SET
// =============================================================================

/// Symbol strips and paytable for one game mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReelMode {
    /// One symbol strip per reel.
    pub strips: Vec<Vec<u32>>,
    /// Multiplier of the bet when every reel stops on the symbol.
    pub paytable: BTreeMap<u32, u64>,
}

/// Reel-length provider and evaluator backed by fixed strips.
///
/// A spin wins `bet × multiplier` when all reels stop on the same symbol.
#[derive(Debug, Clone, Default)]
pub struct StripReelSet {
    modes: BTreeMap<String, ReelMode>,
}

impl StripReelSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a game mode.
    pub fn with_mode(mut self, name: impl Into<String>, mode: ReelMode) -> Self {
        self.modes.insert(name.into(), mode);
        self
    }

    /// Three-reel "classic" mode.
    pub fn classic() -> Self {
        let strips = vec![
            vec![0, 1, 2, 3, 4, 0, 1, 2, 0, 5],
            vec![1, 0, 3, 2, 0, 4, 1, 0, 5, 2, 3],
            vec![2, 0, 1, 0, 3, 4, 0, 5, 1],
        ];
        let paytable = BTreeMap::from([(0, 2), (1, 4), (2, 6), (3, 10), (4, 25), (5, 100)]);
        Self::new().with_mode("classic", ReelMode { strips, paytable })
    }

    fn mode(&self, name: &str) -> Result<&ReelMode, CollaboratorError> {
        self.modes
            .get(name)
            .ok_or_else(|| CollaboratorError(format!("unknown game mode '{}'", name)))
    }

    /// Symbols under each reel's stop position.
    pub fn symbols(&self, game_mode: &str, positions: &[u32]) -> Result<Vec<u32>, CollaboratorError> {
        let mode = self.mode(game_mode)?;
        if positions.len() != mode.strips.len() {
            return Err(CollaboratorError(format!(
                "{} positions for {} reels",
                positions.len(),
                mode.strips.len()
            )));
        }
        mode.strips
            .iter()
            .zip(positions)
            .map(|(strip, &pos)| {
                strip
                    .get(pos as usize)
                    .copied()
                    .ok_or_else(|| CollaboratorError(format!("position {} outside strip of {}", pos, strip.len())))
            })
            .collect()
    }
}

/// `H(domain ‖ be32(symbol)… ‖ be64(win))`.
pub fn outcome_digest(symbols: &[u32], win_amount: u64) -> ChainHash {
    let mut hasher = ChainHasher::with_domain(OUTCOME_DOMAIN);
    for &symbol in symbols {
        hasher.update_u32(symbol);
    }
    hasher.update_u64(win_amount);
    hasher.finalize()
}

#[async_trait]
impl ReelLengthProvider for StripReelSet {
    async fn reel_lengths(&self, game_mode: &str) -> Result<Vec<u32>, CollaboratorError> {
        let mode = self.mode(game_mode)?;
        mode.strips
            .iter()
            .map(|s| u32::try_from(s.len()).map_err(|_| CollaboratorError("strip too long".to_string())))
            .collect()
    }
}

#[async_trait]
impl PayoutEvaluator for StripReelSet {
    async fn evaluate(&self, game: &GameContext, positions: &[u32]) -> Result<SpinOutcome, CollaboratorError> {
        let symbols = self.symbols(&game.game_mode, positions)?;
        let mode = self.mode(&game.game_mode)?;

        let win_amount = match symbols.split_first() {
            Some((first, rest)) if rest.iter().all(|s| s == first) => {
                let multiplier = mode.paytable.get(first).copied().unwrap_or(0);
                game.bet.saturating_mul(multiplier)
            }
            _ => 0,
        };

        Ok(SpinOutcome { win_amount, digest: outcome_digest(&symbols, win_amount) })
    }
}
