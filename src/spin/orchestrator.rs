//! Spin Orchestrator
//!
//! Executes one spin as a single unit per session:
//!
//! ```text
//! lock session ─▶ chain tip ─▶ settle pending ─▶ reel lengths ─▶ stream rng ─▶ evaluate ─▶ append ─▶ settle
//! ```
//!
//! The session mutex is held from the tip read to the balance settlement, so
//! concurrent spins on one session receive distinct, contiguous indices. The
//! ledger's compare-and-append catches any writer that bypasses the mutex.
//!
//! A record counts as settled once its balance change has been applied and the
//! session's `next_sequence` has moved past it. Records between
//! `next_sequence` and the chain tip are settled before anything else happens.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::core::hash::ChainHash;
use crate::core::rng::StreamRng;
use crate::error::FairnessError;
use crate::ledger::chain::{ChainTip, HashChainLedger};
use crate::ledger::record::{validate_seed, SpinRecord};
use crate::session::manager::CommitmentManager;
use crate::session::state::{Session, SessionId};
use crate::spin::collaborators::{BalanceError, BalanceLedger, PayoutEvaluator, ReelLengthProvider, SpinOutcome};

/// Request to spin once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinRequest {
    /// Target session.
    pub session_id: SessionId,
    /// Client-supplied per-spin seed.
    pub seed: String,
    /// Index the client believes is next. Guards against duplicate submission.
    #[serde(default)]
    pub expected_index: Option<u64>,
}

/// Result of a committed spin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinResult {
    /// Session.
    pub session_id: SessionId,
    /// Sequence index of the new record.
    pub index: u64,
    /// Hash of the new record.
    #[serde(with = "hex")]
    pub record_hash: ChainHash,
    /// Hash pointer it extends.
    #[serde(with = "hex")]
    pub prev_hash: ChainHash,
    /// Reel stop positions.
    pub positions: Vec<u32>,
    /// Amount won.
    pub win_amount: u64,
    /// Evaluator digest.
    #[serde(with = "hex")]
    pub outcome_digest: ChainHash,
    /// Balance after settlement.
    pub balance: u64,
}

/// A pending record settled ahead of a new spin.
struct Settled {
    index: u64,
    seed: String,
    result: SpinResult,
}

/// Composes RNG, ledger and collaborators into one spin.
pub struct SpinOrchestrator {
    sessions: Arc<CommitmentManager>,
    ledger: HashChainLedger,
    reels: Arc<dyn ReelLengthProvider>,
    evaluator: Arc<dyn PayoutEvaluator>,
    balances: Arc<dyn BalanceLedger>,
    config: EngineConfig,
}

impl SpinOrchestrator {
    /// Wire an orchestrator.
    pub fn new(
        sessions: Arc<CommitmentManager>,
        ledger: HashChainLedger,
        reels: Arc<dyn ReelLengthProvider>,
        evaluator: Arc<dyn PayoutEvaluator>,
        balances: Arc<dyn BalanceLedger>,
        config: EngineConfig,
    ) -> Self {
        Self { sessions, ledger, reels, evaluator, balances, config }
    }

    /// Execute one spin.
    ///
    /// Records appended earlier but never settled (a timed-out append that
    /// landed, or a settlement that failed) are settled first. A retry whose
    /// `expected_index` and seed name such a record returns that record's
    /// result instead of spinning again.
    #[instrument(skip_all, fields(session = %request.session_id))]
    pub async fn execute_spin(&self, request: SpinRequest) -> Result<SpinResult, FairnessError> {
        validate_seed(&request.seed, self.config.max_seed_len)?;

        let handle = self.sessions.get(&request.session_id).await?;
        let mut session = handle.lock().await;
        session.ensure_spinnable()?;

        // 1. Chain tip, recomputed from storage.
        let tip = self.tip(&mut session).await?;

        // 2. Unsettled tail.
        let mut replay = None;
        for result in self.settle_pending_locked(&mut session, &tip).await? {
            if request.expected_index == Some(result.index) && result.seed == request.seed {
                replay = Some(result.result);
            }
        }
        if let Some(result) = replay {
            info!(index = result.index, "retried spin settled");
            return Ok(result);
        }
        self.timed(
            "ledger read",
            session.id,
            self.ledger.check_expected_index(&session, &tip, request.expected_index, &request.seed),
        )
        .await??;

        // 3. Reel lengths and funds.
        let lengths = self.reel_lengths(&session).await?;
        self.check_funds(&session).await?;

        // 4. Positions.
        let positions = derive_positions(&session, &request.seed, &tip, &lengths)?;

        // 5. Outcome.
        let outcome = self.evaluate(&session, &positions).await?;

        // 6. Append.
        let record = self
            .timed(
                "ledger append",
                session.id,
                self.ledger.append_at(&session, &tip, request.seed, lengths, positions, outcome.digest),
            )
            .await??;

        // 7. Settle.
        let result = self.settle_record(&mut session, record, outcome.win_amount).await?;
        info!(
            index = result.index,
            hash = %hex::encode(result.record_hash),
            win = result.win_amount,
            balance = result.balance,
            "spin committed"
        );
        Ok(result)
    }

    /// Settle every appended record the session has not settled yet.
    ///
    /// Returns the number of records settled.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn settle_pending(&self, session_id: &SessionId) -> Result<usize, FairnessError> {
        let handle = self.sessions.get(session_id).await?;
        let mut session = handle.lock().await;
        let tip = self.tip(&mut session).await?;
        Ok(self.settle_pending_locked(&mut session, &tip).await?.len())
    }

    async fn tip(&self, session: &mut Session) -> Result<ChainTip, FairnessError> {
        match self.timed("ledger read", session.id, self.ledger.chain_tip(session)).await.and_then(|r| r) {
            Ok(tip) => Ok(tip),
            Err(e) if e.breaks_chain() => Err(self.freeze_on_integrity_failure(session, e).await),
            Err(e) => Err(e),
        }
    }

    async fn settle_pending_locked(&self, session: &mut Session, tip: &ChainTip) -> Result<Vec<Settled>, FairnessError> {
        let mut settled = Vec::new();
        let mut index = session.next_sequence();
        if tip.next_index < index {
            let err = broken(session.id, tip.next_index, "ledger ends before the last settled spin");
            return Err(self.freeze_on_integrity_failure(session, err).await);
        }
        while index < tip.next_index {
            let record = self
                .timed("ledger read", session.id, self.ledger.record_at(&session.id, index))
                .await??
                .ok_or_else(|| broken(session.id, index, "unsettled record missing"))?;

            let outcome = self.evaluate(session, &record.positions).await?;
            if outcome.digest != record.outcome_digest {
                let err = broken(session.id, index, "outcome digest does not re-evaluate");
                return Err(self.freeze_on_integrity_failure(session, err).await);
            }

            warn!(index, "settling record left from an earlier spin");
            let seed = record.seed.clone();
            let result = self.settle_record(session, record, outcome.win_amount).await?;
            settled.push(Settled { index, seed, result });
            index = index.saturating_add(1);
        }
        Ok(settled)
    }

    /// Settle an appended record and mark it settled on the session.
    async fn settle_record(&self, session: &mut Session, record: SpinRecord, win_amount: u64) -> Result<SpinResult, FairnessError> {
        let delta = i128::from(win_amount) - i128::from(session.game.bet);
        let balance = self.settle(session, record.index, delta).await?;

        session.advance(record.index);
        if let Err(e) = self.sessions.persist(session).await {
            error!(index = record.index, error = %e, "settled spin not persisted, needs reconciliation");
        }

        Ok(SpinResult {
            session_id: session.id,
            index: record.index,
            record_hash: record.hash,
            prev_hash: record.prev_hash,
            positions: record.positions,
            win_amount,
            outcome_digest: record.outcome_digest,
            balance,
        })
    }

    async fn evaluate(&self, session: &Session, positions: &[u32]) -> Result<SpinOutcome, FairnessError> {
        self.timed("payout evaluation", session.id, self.evaluator.evaluate(&session.game, positions))
            .await?
            .map_err(|e| FairnessError::Collaborator { operation: "payout evaluation", message: e.0 })
    }

    async fn freeze_on_integrity_failure(&self, session: &mut Session, err: FairnessError) -> FairnessError {
        error!(
            session = %session.id,
            server_secret_hash = %hex::encode(session.server_secret_hash()),
            genesis = %hex::encode(session.genesis_hash()),
            start_sequence = session.start_sequence(),
            error = %err,
            "chain integrity failure, freezing session"
        );
        self.sessions.freeze_locked(session, &err.to_string()).await;
        err
    }

    async fn reel_lengths(&self, session: &Session) -> Result<Vec<u32>, FairnessError> {
        let lengths = self
            .timed("reel lengths", session.id, self.reels.reel_lengths(&session.game.game_mode))
            .await?
            .map_err(|e| FairnessError::Collaborator { operation: "reel lengths", message: e.0 })?;

        let invalid = |reason: String| FairnessError::InvalidReelLengths { session: session.id, reason };
        if lengths.is_empty() {
            return Err(invalid("no reels".to_string()));
        }
        if lengths.len() > self.config.max_reels {
            return Err(invalid(format!("{} reels, limit is {}", lengths.len(), self.config.max_reels)));
        }
        if let Some(reel) = lengths.iter().position(|&len| len == 0) {
            return Err(invalid(format!("reel {} is empty", reel)));
        }
        Ok(lengths)
    }

    async fn check_funds(&self, session: &Session) -> Result<(), FairnessError> {
        let account = self
            .timed("balance read", session.id, self.balances.snapshot(&session.owner))
            .await?
            .map_err(balance_unavailable)?;

        if account.balance < session.game.bet {
            return Err(FairnessError::InsufficientFunds {
                owner: session.owner,
                balance: account.balance,
                required: session.game.bet,
            });
        }
        Ok(())
    }

    /// Apply `delta` with bounded optimistic retries.
    ///
    /// The record is already appended when this runs. Failures here are logged
    /// for reconciliation and surfaced to the caller; the chain is unaffected.
    async fn settle(&self, session: &Session, index: u64, delta: i128) -> Result<u64, FairnessError> {
        let delta = i64::try_from(delta).map_err(|_| FairnessError::Collaborator {
            operation: "balance settlement",
            message: format!("delta {} out of range", delta),
        })?;

        let attempts = self.config.balance_retry_limit;
        for attempt in 1..=attempts {
            let snapshot = self
                .timed("balance read", session.id, self.balances.snapshot(&session.owner))
                .await?
                .map_err(balance_unavailable)?;

            let applied = self
                .timed("balance update", session.id, self.balances.apply(&session.owner, delta, snapshot.version))
                .await?;

            match applied {
                Ok(account) => return Ok(account.balance),
                Err(BalanceError::VersionConflict { expected, actual }) => {
                    debug!(index, attempt, expected, actual, "balance version conflict, retrying");
                }
                Err(BalanceError::InsufficientFunds { balance, required }) => {
                    error!(index, delta, balance, "settlement rejected after append, needs reconciliation");
                    return Err(FairnessError::InsufficientFunds { owner: session.owner, balance, required });
                }
                Err(e) => {
                    error!(index, delta, error = %e, "settlement failed after append, needs reconciliation");
                    return Err(balance_unavailable(e));
                }
            }
        }

        error!(index, delta, attempts, "settlement lost every retry, needs reconciliation");
        Err(FairnessError::ConcurrencyConflict { session: session.id, index: Some(index), attempts })
    }

    /// Run `fut` under the configured I/O timeout.
    async fn timed<T>(
        &self,
        operation: &'static str,
        session: SessionId,
        fut: impl Future<Output = T>,
    ) -> Result<T, FairnessError> {
        with_timeout(self.config.io_timeout, operation, session, fut).await
    }
}

pub(crate) async fn with_timeout<T>(
    limit: Duration,
    operation: &'static str,
    session: SessionId,
    fut: impl Future<Output = T>,
) -> Result<T, FairnessError> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        warn!(session = %session, operation, timeout_ms = limit.as_millis() as u64, "operation timed out");
        FairnessError::Timeout { operation, session }
    })
}

/// Derive reel positions for the spin attaching at `tip`.
fn derive_positions(session: &Session, seed: &str, tip: &ChainTip, lengths: &[u32]) -> Result<Vec<u32>, FairnessError> {
    StreamRng::derive(session.server_secret().expose(), seed, tip.next_index, &tip.prev_hash)
        .and_then(|mut rng| rng.positions(lengths))
        .map_err(|source| {
            error!(
                session = %session.id,
                index = tip.next_index,
                seed,
                prev_hash = %hex::encode(tip.prev_hash),
                ?lengths,
                error = %source,
                "stream rng failed"
            );
            FairnessError::Rng { session: session.id, index: tip.next_index, source }
        })
}

fn broken(session: SessionId, index: u64, reason: &str) -> FairnessError {
    FairnessError::ChainBroken { session, index, reason: reason.to_string() }
}

fn balance_unavailable(e: BalanceError) -> FairnessError {
    FairnessError::Collaborator { operation: "balance ledger", message: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::core::hash;
    use crate::ledger::store::{LedgerStore, MemoryLedgerStore, StoreError};
    use crate::session::state::{GameContext, PlayerId, ServerSecret};
    use crate::spin::collaborators::{AccountSnapshot, MemoryBalanceLedger, StripReelSet};

    const OWNER: PlayerId = PlayerId::new([1; 16]);

    struct Fixture {
        orchestrator: Arc<SpinOrchestrator>,
        sessions: Arc<CommitmentManager>,
        store: Arc<MemoryLedgerStore>,
        balances: Arc<MemoryBalanceLedger>,
    }

    async fn fixture_with(balances_impl: Option<Arc<dyn BalanceLedger>>, config: EngineConfig) -> Fixture {
        let sessions = Arc::new(CommitmentManager::new(config.start_sequence));
        let store = Arc::new(MemoryLedgerStore::new());
        let reels = Arc::new(StripReelSet::classic());
        let balances = Arc::new(MemoryBalanceLedger::new());
        balances.deposit(OWNER, 1_000_000).await;

        let orchestrator = SpinOrchestrator::new(
            sessions.clone(),
            HashChainLedger::new(store.clone()),
            reels.clone(),
            reels,
            balances_impl.unwrap_or_else(|| balances.clone() as Arc<dyn BalanceLedger>),
            config,
        );
        Fixture { orchestrator: Arc::new(orchestrator), sessions, store, balances }
    }

    async fn fixture() -> Fixture {
        fixture_with(None, EngineConfig::default()).await
    }

    fn game() -> GameContext {
        GameContext { game_mode: "classic".to_string(), bet: 10 }
    }

    fn spin(session_id: SessionId, seed: &str, expected_index: Option<u64>) -> SpinRequest {
        SpinRequest { session_id, seed: seed.to_string(), expected_index }
    }

    #[tokio::test]
    async fn test_commit_reveal_spin_example() {
        let fx = fixture().await;
        let commitment = hash::client_commitment("abc");
        let created = fx
            .sessions
            .create_session_with_secret(OWNER, game(), Some(commitment), ServerSecret::from_bytes([42; 32]))
            .await
            .unwrap();
        let h1 = created.server_secret_hash;

        let early = fx.orchestrator.execute_spin(spin(created.session_id, "c0", None)).await;
        assert!(matches!(early, Err(FairnessError::ClientSecretRequired { .. })));

        fx.sessions.reveal_client_secret(&created.session_id, "abc").await.unwrap();
        let result = fx.orchestrator.execute_spin(spin(created.session_id, "c0", Some(0))).await.unwrap();

        let mut genesis_input = h1.to_vec();
        genesis_input.extend_from_slice(&hash::hash_bytes(b"abc"));
        let genesis = hash::hash_bytes(&genesis_input);

        assert_eq!(result.index, 0);
        assert_eq!(result.prev_hash, genesis);
        assert_eq!(result.record_hash, hash::record_hash(&genesis, &[42; 32], "c0", 0));

        let expected_positions = StreamRng::derive(&[42; 32], "c0", 0, &genesis)
            .unwrap()
            .positions(&[10, 11, 9])
            .unwrap();
        assert_eq!(result.positions, expected_positions);
    }

    #[tokio::test]
    async fn test_spin_settles_balance() {
        let fx = fixture().await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();

        let result = fx.orchestrator.execute_spin(spin(created.session_id, "s", None)).await.unwrap();
        assert_eq!(result.balance, 1_000_000 - 10 + result.win_amount);
        assert_eq!(fx.balances.snapshot(&OWNER).await.unwrap().balance, result.balance);
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let fx = fixture().await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();

        let empty = fx.orchestrator.execute_spin(spin(created.session_id, "", None)).await;
        assert!(matches!(empty, Err(FairnessError::InvalidSeed { .. })));

        let missing = fx.orchestrator.execute_spin(spin(SessionId([0xAA; 16]), "x", None)).await;
        assert!(matches!(missing, Err(FairnessError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_unknown_game_mode_is_collaborator_error() {
        let fx = fixture().await;
        let game = GameContext { game_mode: "missing".to_string(), bet: 1 };
        let created = fx.sessions.create_session(OWNER, game, None).await.unwrap();

        let err = fx.orchestrator.execute_spin(spin(created.session_id, "x", None)).await.unwrap_err();
        assert!(matches!(err, FairnessError::Collaborator { operation: "reel lengths", .. }));
        assert!(fx.store.records(&created.session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_funds_appends_nothing() {
        let fx = fixture().await;
        let poor = PlayerId::new([7; 16]);
        let created = fx.sessions.create_session(poor, game(), None).await.unwrap();

        let err = fx.orchestrator.execute_spin(spin(created.session_id, "x", None)).await.unwrap_err();
        assert!(matches!(err, FairnessError::InsufficientFunds { balance: 0, required: 10, .. }));
        assert!(fx.store.records(&created.session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_reports_duplicate() {
        let fx = fixture().await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();

        fx.orchestrator.execute_spin(spin(created.session_id, "c0", Some(0))).await.unwrap();
        let retry = fx.orchestrator.execute_spin(spin(created.session_id, "c0", Some(0))).await;
        assert!(matches!(retry, Err(FairnessError::DuplicateSpin { index: 0, .. })));

        let racing = fx.orchestrator.execute_spin(spin(created.session_id, "other", Some(0))).await;
        assert!(matches!(racing, Err(FairnessError::NonceMismatch { expected: 0, actual: 1, .. })));

        assert_eq!(fx.store.records(&created.session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ended_session_rejects_spins() {
        let fx = fixture().await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();
        fx.sessions.end_session(&created.session_id).await.unwrap();

        let err = fx.orchestrator.execute_spin(spin(created.session_id, "x", None)).await.unwrap_err();
        assert!(matches!(err, FairnessError::SessionInactive { .. }));
    }

    #[tokio::test]
    async fn test_tampered_chain_freezes_session() {
        let fx = fixture().await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();
        fx.orchestrator.execute_spin(spin(created.session_id, "c0", None)).await.unwrap();

        fx.store.tamper(&created.session_id, 0, |r| r.hash[0] ^= 0x01).await;

        let err = fx.orchestrator.execute_spin(spin(created.session_id, "c1", None)).await.unwrap_err();
        assert!(matches!(err, FairnessError::ChainBroken { index: 0, .. }));

        let again = fx.orchestrator.execute_spin(spin(created.session_id, "c1", None)).await.unwrap_err();
        assert!(matches!(again, FairnessError::SessionFrozen { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_spins_get_contiguous_indices() {
        const K: u64 = 32;
        let fx = fixture_with(None, EngineConfig { start_sequence: 5, ..EngineConfig::default() }).await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();

        let tasks: Vec<_> = (0..K)
            .map(|i| {
                let orchestrator = fx.orchestrator.clone();
                let session_id = created.session_id;
                tokio::spawn(async move { orchestrator.execute_spin(spin(session_id, &format!("seed-{}", i), None)).await })
            })
            .collect();

        let mut indices = BTreeSet::new();
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert!(indices.insert(result.index), "duplicate index {}", result.index);
        }
        assert_eq!(indices, (5..5 + K).collect::<BTreeSet<_>>());

        let records = fx.store.records(&created.session_id).await.unwrap();
        for pair in records.windows(2) {
            assert_eq!(pair[1].index, pair[0].index + 1);
            assert_eq!(pair[1].prev_hash, pair[0].hash);
        }
    }

    /// Balance ledger whose first `conflicts` writes lose the race.
    struct ContendedBalance {
        inner: MemoryBalanceLedger,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl BalanceLedger for ContendedBalance {
        async fn snapshot(&self, owner: &PlayerId) -> Result<AccountSnapshot, BalanceError> {
            self.inner.snapshot(owner).await
        }

        async fn apply(&self, owner: &PlayerId, delta: i64, expected_version: u64) -> Result<AccountSnapshot, BalanceError> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(BalanceError::VersionConflict { expected: expected_version, actual: expected_version + 1 });
            }
            self.inner.apply(owner, delta, expected_version).await
        }
    }

    async fn contended(conflicts: u32) -> Arc<ContendedBalance> {
        let inner = MemoryBalanceLedger::new();
        inner.deposit(OWNER, 100).await;
        Arc::new(ContendedBalance { inner, conflicts: AtomicU32::new(conflicts) })
    }

    #[tokio::test]
    async fn test_settlement_retries_version_conflicts() {
        let balances = contended(2).await;
        let fx = fixture_with(Some(balances.clone() as Arc<dyn BalanceLedger>), EngineConfig::default()).await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();

        let result = fx.orchestrator.execute_spin(spin(created.session_id, "x", None)).await.unwrap();
        assert_eq!(result.balance, 90 + result.win_amount);
    }

    #[tokio::test]
    async fn test_settlement_surfaces_conflict_after_retries() {
        let balances = contended(10).await;
        let fx = fixture_with(Some(balances.clone() as Arc<dyn BalanceLedger>), EngineConfig::default()).await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();

        let err = fx.orchestrator.execute_spin(spin(created.session_id, "x", None)).await.unwrap_err();
        assert!(matches!(err, FairnessError::ConcurrencyConflict { index: Some(0), attempts: 3, .. }));
        assert!(err.is_retryable());

        // The record stands; the next spin continues the chain.
        assert_eq!(fx.store.records(&created.session_id).await.unwrap().len(), 1);
        assert_eq!(balances.inner.snapshot(&OWNER).await.unwrap().balance, 100);
    }

    struct StalledReels;

    #[async_trait]
    impl ReelLengthProvider for StalledReels {
        async fn reel_lengths(&self, _game_mode: &str) -> Result<Vec<u32>, crate::spin::collaborators::CollaboratorError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![1])
        }
    }

    #[tokio::test]
    async fn test_collaborator_timeout() {
        let sessions = Arc::new(CommitmentManager::default());
        let reels = Arc::new(StripReelSet::classic());
        let balances = Arc::new(MemoryBalanceLedger::new());
        let config = EngineConfig { io_timeout: Duration::from_millis(20), ..EngineConfig::default() };
        let orchestrator = SpinOrchestrator::new(
            sessions.clone(),
            HashChainLedger::new(Arc::new(MemoryLedgerStore::new())),
            Arc::new(StalledReels),
            reels,
            balances,
            config,
        );
        let created = sessions.create_session(OWNER, game(), None).await.unwrap();

        let err = orchestrator.execute_spin(spin(created.session_id, "x", None)).await.unwrap_err();
        assert!(matches!(err, FairnessError::Timeout { operation: "reel lengths", .. }));
    }

    #[tokio::test]
    async fn test_retry_settles_conflicted_spin_once() {
        let balances = contended(3).await;
        let fx = fixture_with(Some(balances.clone() as Arc<dyn BalanceLedger>), EngineConfig::default()).await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();

        let err = fx.orchestrator.execute_spin(spin(created.session_id, "x", Some(0))).await.unwrap_err();
        assert!(matches!(err, FairnessError::ConcurrencyConflict { index: Some(0), .. }));

        let result = fx.orchestrator.execute_spin(spin(created.session_id, "x", Some(0))).await.unwrap();
        assert_eq!(result.index, 0);
        assert_eq!(result.balance, 90 + result.win_amount);

        // Settled now; a third submission is a plain duplicate.
        let again = fx.orchestrator.execute_spin(spin(created.session_id, "x", Some(0))).await;
        assert!(matches!(again, Err(FairnessError::DuplicateSpin { index: 0, .. })));
        assert_eq!(balances.inner.snapshot(&OWNER).await.unwrap().balance, result.balance);
    }

    /// Store whose first append lands and then hangs.
    struct StallingStore {
        inner: MemoryLedgerStore,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl LedgerStore for StallingStore {
        async fn append(&self, record: crate::ledger::record::SpinRecord, expected_len: u64) -> Result<(), StoreError> {
            self.inner.append(record, expected_len).await?;
            if !self.stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(())
        }

        async fn len(&self, session: &SessionId) -> Result<u64, StoreError> {
            self.inner.len(session).await
        }

        async fn last(&self, session: &SessionId) -> Result<Option<crate::ledger::record::SpinRecord>, StoreError> {
            self.inner.last(session).await
        }

        async fn get(&self, session: &SessionId, index: u64) -> Result<Option<crate::ledger::record::SpinRecord>, StoreError> {
            self.inner.get(session, index).await
        }

        async fn records(&self, session: &SessionId) -> Result<Vec<crate::ledger::record::SpinRecord>, StoreError> {
            self.inner.records(session).await
        }
    }

    #[tokio::test]
    async fn test_timed_out_append_settles_on_retry() {
        let sessions = Arc::new(CommitmentManager::default());
        let store = Arc::new(StallingStore { inner: MemoryLedgerStore::new(), stalled: AtomicBool::new(false) });
        let reels = Arc::new(StripReelSet::classic());
        let balances = Arc::new(MemoryBalanceLedger::new());
        balances.deposit(OWNER, 1_000).await;
        let config = EngineConfig { io_timeout: Duration::from_millis(50), ..EngineConfig::default() };
        let orchestrator = SpinOrchestrator::new(
            sessions.clone(),
            HashChainLedger::new(store.clone()),
            reels.clone(),
            reels,
            balances.clone(),
            config,
        );
        let created = sessions.create_session(OWNER, game(), None).await.unwrap();

        let err = orchestrator.execute_spin(spin(created.session_id, "c0", Some(0))).await.unwrap_err();
        assert!(matches!(err, FairnessError::Timeout { operation: "ledger append", .. }));
        assert_eq!(store.inner.len(&created.session_id).await.unwrap(), 1);
        assert_eq!(balances.snapshot(&OWNER).await.unwrap().balance, 1_000);

        let result = orchestrator.execute_spin(spin(created.session_id, "c0", Some(0))).await.unwrap();
        assert_eq!(result.index, 0);
        assert_eq!(result.balance, 1_000 - 10 + result.win_amount);
        assert_eq!(balances.snapshot(&OWNER).await.unwrap().balance, result.balance);
        assert_eq!(store.inner.len(&created.session_id).await.unwrap(), 1);

        let handle = sessions.get(&created.session_id).await.unwrap();
        assert_eq!(handle.lock().await.next_sequence(), 1);

        let next = orchestrator.execute_spin(spin(created.session_id, "c1", Some(1))).await.unwrap();
        assert_eq!(next.prev_hash, result.record_hash);
    }

    #[tokio::test]
    async fn test_settle_pending_without_new_spin() {
        let balances = contended(3).await;
        let fx = fixture_with(Some(balances.clone() as Arc<dyn BalanceLedger>), EngineConfig::default()).await;
        let created = fx.sessions.create_session(OWNER, game(), None).await.unwrap();

        assert!(fx.orchestrator.execute_spin(spin(created.session_id, "x", None)).await.is_err());
        let before = balances.inner.snapshot(&OWNER).await.unwrap().version;

        assert_eq!(fx.orchestrator.settle_pending(&created.session_id).await.unwrap(), 1);
        assert_eq!(fx.orchestrator.settle_pending(&created.session_id).await.unwrap(), 0);
        assert_eq!(balances.inner.snapshot(&OWNER).await.unwrap().version, before + 1);
    }
}
