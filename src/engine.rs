//! Fairness Engine
//!
//! Single entry point for the API layer. Wires the commitment manager,
//! ledger, orchestrator and auditor together and exposes the five protocol
//! operations plus transcript export.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::core::hash::ChainHash;
use crate::error::FairnessError;
use crate::ledger::chain::HashChainLedger;
use crate::ledger::store::{FileLedgerStore, LedgerStore, MemoryLedgerStore};
use crate::proof::transcript::SessionTranscript;
use crate::proof::verify::{SessionAuditor, SessionVerification};
use crate::protocol::{ClientRequest, ServerResponse};
use crate::session::manager::{CommitmentManager, SessionCreated};
use crate::session::store::{FileSessionStore, MemorySessionStore, SessionStore};
use crate::session::state::{GameContext, PlayerId, SessionId, SessionView};
use crate::spin::collaborators::{BalanceLedger, PayoutEvaluator, ReelLengthProvider};
use crate::spin::orchestrator::{with_timeout, SpinOrchestrator, SpinRequest, SpinResult};

/// Session rows live in this subdirectory of the ledger directory.
const SESSION_SUBDIR: &str = "sessions";

/// Returned by [`FairnessEngine::end_session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnded {
    /// Session.
    pub session_id: SessionId,
    /// Revealed server secret.
    #[serde(with = "hex")]
    pub server_secret: [u8; 32],
    /// Hash published at creation.
    #[serde(with = "hex")]
    pub server_secret_hash: ChainHash,
    /// Reveal time.
    pub revealed_at: DateTime<Utc>,
    /// Spins recorded.
    pub spin_count: u64,
    /// Hash of the last record (genesis if there were no spins).
    #[serde(with = "hex")]
    pub final_hash: ChainHash,
}

/// Provably-fair spin engine.
pub struct FairnessEngine {
    config: EngineConfig,
    sessions: Arc<CommitmentManager>,
    ledger: HashChainLedger,
    orchestrator: SpinOrchestrator,
    auditor: SessionAuditor,
}

impl FairnessEngine {
    /// Build an engine over explicit ledger and session stores.
    ///
    /// Sessions already in `session_store` are loaded and continue where
    /// they stopped.
    pub async fn new(
        config: EngineConfig,
        ledger_store: Arc<dyn LedgerStore>,
        session_store: Arc<dyn SessionStore>,
        reels: Arc<dyn ReelLengthProvider>,
        evaluator: Arc<dyn PayoutEvaluator>,
        balances: Arc<dyn BalanceLedger>,
    ) -> Result<Self, FairnessError> {
        let sessions = Arc::new(CommitmentManager::open(&config, session_store).await?);
        let ledger = HashChainLedger::new(ledger_store);
        let orchestrator = SpinOrchestrator::new(
            sessions.clone(),
            ledger.clone(),
            reels,
            evaluator.clone(),
            balances,
            config.clone(),
        );
        let auditor = SessionAuditor::new(sessions.clone(), ledger.clone(), config.io_timeout).with_evaluator(evaluator);

        Ok(Self { config, sessions, ledger, orchestrator, auditor })
    }

    /// Build an engine whose stores are chosen by `config.ledger_dir`.
    ///
    /// With a directory, spin records live in it and session rows in its
    /// `sessions/` subdirectory. Without one, both stay in memory.
    pub async fn from_config(
        config: EngineConfig,
        reels: Arc<dyn ReelLengthProvider>,
        evaluator: Arc<dyn PayoutEvaluator>,
        balances: Arc<dyn BalanceLedger>,
    ) -> Result<Self, FairnessError> {
        let (ledger_store, session_store): (Arc<dyn LedgerStore>, Arc<dyn SessionStore>) = match &config.ledger_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "using file ledger");
                (
                    Arc::new(FileLedgerStore::open(dir).await?),
                    Arc::new(FileSessionStore::open(dir.join(SESSION_SUBDIR)).await?),
                )
            }
            None => {
                info!("using in-memory ledger");
                (Arc::new(MemoryLedgerStore::new()), Arc::new(MemorySessionStore::new()))
            }
        };
        Self::new(config, ledger_store, session_store, reels, evaluator, balances).await
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a session. See [`CommitmentManager::create_session`].
    pub async fn create_session(
        &self,
        owner: PlayerId,
        game: GameContext,
        client_commitment: Option<ChainHash>,
    ) -> Result<SessionCreated, FairnessError> {
        self.sessions.create_session(owner, game, client_commitment).await
    }

    /// Verify the client secret.
    pub async fn reveal_client_secret(&self, session_id: &SessionId, secret: &str) -> Result<(), FairnessError> {
        self.sessions.reveal_client_secret(session_id, secret).await
    }

    /// Execute one spin.
    pub async fn execute_spin(&self, request: SpinRequest) -> Result<SpinResult, FairnessError> {
        self.orchestrator.execute_spin(request).await
    }

    /// End the session, revealing the server secret.
    ///
    /// Any spin still waiting for settlement is settled first.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<SessionEnded, FairnessError> {
        self.orchestrator.settle_pending(session_id).await?;
        let audit = self.sessions.end_session(session_id).await?;

        let handle = self.sessions.get(session_id).await?;
        let (genesis, start) = {
            let session = handle.lock().await;
            (session.genesis_hash(), session.start_sequence())
        };
        let last = with_timeout(self.config.io_timeout, "ledger read", *session_id, self.ledger.last_record(session_id))
            .await??;

        let (spin_count, final_hash) = match last {
            Some(record) => (record.index.saturating_sub(start).saturating_add(1), record.hash),
            None => (0, genesis),
        };

        Ok(SessionEnded {
            session_id: *session_id,
            server_secret: audit.server_secret,
            server_secret_hash: audit.server_secret_hash,
            revealed_at: audit.revealed_at,
            spin_count,
            final_hash,
        })
    }

    /// Replay-verify an ended session.
    pub async fn verify_session(&self, session_id: &SessionId) -> Result<SessionVerification, FairnessError> {
        self.auditor.verify(session_id).await
    }

    /// Transcript of an ended session.
    pub async fn export_transcript(&self, session_id: &SessionId) -> Result<SessionTranscript, FairnessError> {
        self.auditor.transcript(session_id).await
    }

    /// Public view of a session.
    pub async fn session_view(&self, session_id: &SessionId) -> Result<SessionView, FairnessError> {
        let handle = self.sessions.get(session_id).await?;
        let view = handle.lock().await.view();
        Ok(view)
    }

    /// Dispatch one protocol request.
    pub async fn handle(&self, request: ClientRequest) -> ServerResponse {
        let result = match request {
            ClientRequest::CreateSession { owner, game, client_commitment } => self
                .create_session(owner, game, client_commitment)
                .await
                .map(|c| ServerResponse::SessionCreated {
                    session_id: c.session_id,
                    server_secret_hash: c.server_secret_hash,
                    start_sequence: c.start_sequence,
                    status: c.status,
                }),
            ClientRequest::RevealClientSecret { session_id, secret } => self
                .reveal_client_secret(&session_id, &secret)
                .await
                .map(|()| ServerResponse::ClientSecretVerified { session_id }),
            ClientRequest::ExecuteSpin(spin) => self.execute_spin(spin).await.map(ServerResponse::SpinExecuted),
            ClientRequest::EndSession { session_id } => {
                self.end_session(&session_id).await.map(ServerResponse::SessionEnded)
            }
            ClientRequest::VerifySession { session_id } => {
                self.verify_session(&session_id).await.map(ServerResponse::SessionVerified)
            }
            ClientRequest::ExportTranscript { session_id } => {
                self.export_transcript(&session_id).await.map(ServerResponse::Transcript)
            }
            ClientRequest::GetSession { session_id } => {
                self.session_view(&session_id).await.map(ServerResponse::Session)
            }
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, kind = ?e.kind(), "request failed");
            ServerResponse::error(&e)
        })
    }

    /// Dispatch one JSON-encoded request and encode the response.
    pub async fn handle_json(&self, raw: &str) -> String {
        let response = match ClientRequest::from_json(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => ServerResponse::error(&FairnessError::InvalidRequest { reason: e.to_string() }),
        };
        response.to_json().unwrap_or_else(|e| internal_error_json(&e))
    }
}

/// Error response built without going through [`ServerResponse`].
fn internal_error_json(err: &dyn std::fmt::Display) -> String {
    serde_json::json!({
        "type": "error",
        "code": "internal_error",
        "message": err.to_string(),
        "retryable": false,
    })
    .to_string()
}
