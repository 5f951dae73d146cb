//! Commitment Manager
//!
//! Owns every session and drives the dual-commitment handshake:
//! - `create_session` publishes `H(serverSecret)` (and records the client commitment)
//! - `reveal_client_secret` checks the client secret against its commitment
//! - `end_session` reveals the server secret exactly once
//!
//! Each session sits behind its own async mutex. Holding that mutex is what
//! serializes spins on one session while different sessions proceed in parallel.
//! Every mutation is applied to a copy, written to the [`SessionStore`], and
//! only then installed, so memory never runs ahead of storage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::core::hash::{self, ChainHash};
use crate::error::FairnessError;
use crate::ledger::store::StoreError;
use crate::session::state::{AuditRecord, GameContext, PlayerId, ServerSecret, Session, SessionId, SessionStatus};
use crate::session::store::{MemorySessionStore, SessionStore};
use crate::spin::orchestrator::with_timeout;

/// Shared handle to one session.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Returned by [`CommitmentManager::create_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreated {
    /// New session.
    pub session_id: SessionId,
    /// `H(serverSecret)`.
    pub server_secret_hash: ChainHash,
    /// Index of the first spin.
    pub start_sequence: u64,
    /// Initial status (Active, or Committed with a client commitment).
    pub status: SessionStatus,
}

/// Session registry and commitment protocol.
pub struct CommitmentManager {
    start_sequence: u64,
    io_timeout: Duration,
    store: Arc<dyn SessionStore>,
    /// All sessions, including ended ones (retained for audit).
    sessions: RwLock<BTreeMap<SessionId, SessionHandle>>,
    /// Owner to their open session.
    owner_sessions: RwLock<BTreeMap<PlayerId, SessionId>>,
    /// Written once per session, at end.
    audits: RwLock<BTreeMap<SessionId, AuditRecord>>,
}

impl CommitmentManager {
    /// Create an in-memory manager whose sessions start at `start_sequence`.
    pub fn new(start_sequence: u64) -> Self {
        let config = EngineConfig { start_sequence, ..EngineConfig::default() };
        Self::empty(&config, Arc::new(MemorySessionStore::new()))
    }

    /// Open a manager over `store`, loading every session it holds.
    pub async fn open(config: &EngineConfig, store: Arc<dyn SessionStore>) -> Result<Self, FairnessError> {
        let manager = Self::empty(config, store);
        manager.restore().await?;
        Ok(manager)
    }

    fn empty(config: &EngineConfig, store: Arc<dyn SessionStore>) -> Self {
        Self {
            start_sequence: config.start_sequence,
            io_timeout: config.io_timeout,
            store,
            sessions: RwLock::new(BTreeMap::new()),
            owner_sessions: RwLock::new(BTreeMap::new()),
            audits: RwLock::new(BTreeMap::new()),
        }
    }

    async fn restore(&self) -> Result<(), FairnessError> {
        let rows = self.store.rows().await?;
        let mut stored_audits: BTreeMap<SessionId, AuditRecord> =
            self.store.audits().await?.into_iter().map(|a| (a.session_id, a)).collect();

        let mut sessions = self.sessions.write().await;
        let mut owners = self.owner_sessions.write().await;
        let mut audits = self.audits.write().await;

        for row in rows {
            let session = Session::restore(row)?;

            if session.status() == SessionStatus::Ended {
                let audit = match stored_audits.remove(&session.id) {
                    Some(audit) => audit,
                    None => {
                        // Crash between the row write and the audit write.
                        let audit = session.audit_record().ok_or(StoreError::Corrupt {
                            session: session.id,
                            reason: "ended session without reveal time".to_string(),
                        })?;
                        self.store.save_audit(&audit).await?;
                        warn!(session = %session.id, "audit record rebuilt from session row");
                        audit
                    }
                };
                if audit.server_secret_hash != *session.server_secret_hash()
                    || hash::server_secret_hash(&audit.server_secret) != audit.server_secret_hash
                {
                    error!(session = %session.id, "stored audit record does not open the published hash");
                    return Err(FairnessError::SecretHashMismatch { session: session.id });
                }
                audits.insert(session.id, audit);
            } else if let Some(existing) = owners.insert(session.owner, session.id) {
                warn!(owner = %session.owner, session = %session.id, other = %existing, "owner has two open sessions in storage");
            }

            sessions.insert(session.id, Arc::new(Mutex::new(session)));
        }

        info!(sessions = sessions.len(), open = owners.len(), "sessions restored");
        Ok(())
    }

    /// Write the session's current state to storage.
    pub async fn persist(&self, session: &Session) -> Result<(), FairnessError> {
        with_timeout(self.io_timeout, "session store", session.id, self.store.save(&session.row())).await??;
        Ok(())
    }

    /// Open a session with a fresh server secret.
    pub async fn create_session(
        &self,
        owner: PlayerId,
        game: GameContext,
        client_commitment: Option<ChainHash>,
    ) -> Result<SessionCreated, FairnessError> {
        self.create_session_with_secret(owner, game, client_commitment, ServerSecret::generate()).await
    }

    /// Open a session with a caller-supplied server secret.
    #[instrument(skip_all, fields(owner = %owner))]
    pub async fn create_session_with_secret(
        &self,
        owner: PlayerId,
        game: GameContext,
        client_commitment: Option<ChainHash>,
        server_secret: ServerSecret,
    ) -> Result<SessionCreated, FairnessError> {
        // Held until the insert: at most one open session per owner.
        let mut owners = self.owner_sessions.write().await;
        if let Some(existing) = owners.get(&owner) {
            return Err(FairnessError::SessionAlreadyActive { owner, session: *existing });
        }

        let session = Session::open_with_secret(
            SessionId::generate(),
            owner,
            game,
            client_commitment,
            self.start_sequence,
            server_secret,
        )?;
        let created = SessionCreated {
            session_id: session.id,
            server_secret_hash: *session.server_secret_hash(),
            start_sequence: session.start_sequence(),
            status: session.status(),
        };

        self.persist(&session).await?;
        self.sessions.write().await.insert(session.id, Arc::new(Mutex::new(session)));
        owners.insert(owner, created.session_id);

        info!(
            session = %created.session_id,
            server_secret_hash = %hex::encode(created.server_secret_hash),
            committed = client_commitment.is_some(),
            "session created"
        );
        Ok(created)
    }

    /// Handle for a session.
    pub async fn get(&self, session_id: &SessionId) -> Result<SessionHandle, FairnessError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or(FairnessError::SessionNotFound { session: *session_id })
    }

    /// Verify the client secret against its commitment.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn reveal_client_secret(&self, session_id: &SessionId, secret: &str) -> Result<(), FairnessError> {
        let handle = self.get(session_id).await?;
        let mut session = handle.lock().await;

        let mut next = session.clone();
        if let Err(e) = next.reveal_client_secret(secret) {
            warn!(error = %e, "client secret rejected");
            return Err(e);
        }
        self.persist(&next).await?;
        *session = next;

        info!("client secret verified");
        Ok(())
    }

    /// End the session and reveal its server secret.
    ///
    /// One-shot: a second call fails with [`FairnessError::AlreadyEnded`] and
    /// never rewrites the audit record.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn end_session(&self, session_id: &SessionId) -> Result<AuditRecord, FairnessError> {
        let handle = self.get(session_id).await?;
        let mut session = handle.lock().await;

        let mut next = session.clone();
        let audit = next.end()?;
        self.persist(&next).await?;
        with_timeout(self.io_timeout, "session store", *session_id, self.store.save_audit(&audit)).await??;
        *session = next;

        self.audits.write().await.entry(*session_id).or_insert_with(|| audit.clone());

        let mut owners = self.owner_sessions.write().await;
        if owners.get(&session.owner) == Some(session_id) {
            owners.remove(&session.owner);
        }

        info!(server_secret = %hex::encode(audit.server_secret), "server secret revealed");
        Ok(audit)
    }

    /// Audit record of an ended session.
    pub async fn audit_record(&self, session_id: &SessionId) -> Option<AuditRecord> {
        self.audits.read().await.get(session_id).cloned()
    }

    /// Freeze a session for manual audit.
    pub async fn freeze(&self, session_id: &SessionId, reason: &str) -> Result<(), FairnessError> {
        let handle = self.get(session_id).await?;
        let mut session = handle.lock().await;
        self.freeze_locked(&mut session, reason).await;
        Ok(())
    }

    /// Freeze a session whose lock the caller already holds.
    ///
    /// The in-memory freeze always takes effect; a failed write is logged.
    pub async fn freeze_locked(&self, session: &mut Session, reason: &str) {
        session.freeze(reason);
        warn!(session = %session.id, reason, "session frozen");
        if let Err(e) = self.persist(session).await {
            error!(session = %session.id, error = %e, "frozen state not persisted");
        }
    }

    /// Number of sessions held, ended ones included.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for CommitmentManager {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game() -> GameContext {
        GameContext { game_mode: "classic".to_string(), bet: 1 }
    }

    #[tokio::test]
    async fn test_create_session_publishes_secret_hash() {
        let manager = CommitmentManager::new(7);
        let secret = ServerSecret::from_bytes([3; 32]);
        let created = manager
            .create_session_with_secret(PlayerId::new([1; 16]), game(), None, secret)
            .await
            .unwrap();

        assert_eq!(created.server_secret_hash, hash::server_secret_hash(&[3; 32]));
        assert_eq!(created.start_sequence, 7);
        assert_eq!(created.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_one_open_session_per_owner() {
        let manager = CommitmentManager::default();
        let owner = PlayerId::new([1; 16]);
        let first = manager.create_session(owner, game(), None).await.unwrap();

        let err = manager.create_session(owner, game(), None).await.unwrap_err();
        assert!(matches!(err, FairnessError::SessionAlreadyActive { session, .. } if session == first.session_id));

        manager.end_session(&first.session_id).await.unwrap();
        assert!(manager.create_session(owner, game(), None).await.is_ok());
        assert_eq!(manager.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_reveal_through_manager() {
        let manager = CommitmentManager::default();
        let created = manager
            .create_session(PlayerId::new([1; 16]), game(), Some(hash::client_commitment("abc")))
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Committed);

        manager.reveal_client_secret(&created.session_id, "abc").await.unwrap();
        let again = manager.reveal_client_secret(&created.session_id, "abc").await;
        assert!(matches!(again, Err(FairnessError::AlreadyVerified { .. })));
    }

    #[tokio::test]
    async fn test_end_session_is_one_shot() {
        let manager = CommitmentManager::default();
        let created = manager.create_session(PlayerId::new([1; 16]), game(), None).await.unwrap();

        let audit = manager.end_session(&created.session_id).await.unwrap();
        assert_eq!(hash::server_secret_hash(&audit.server_secret), created.server_secret_hash);

        let err = manager.end_session(&created.session_id).await.unwrap_err();
        assert!(matches!(err, FairnessError::AlreadyEnded { .. }));
        assert_eq!(manager.audit_record(&created.session_id).await, Some(audit));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = CommitmentManager::default();
        let missing = SessionId([0xEE; 16]);
        assert!(matches!(manager.get(&missing).await, Err(FairnessError::SessionNotFound { .. })));
        assert!(matches!(manager.end_session(&missing).await, Err(FairnessError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_creates_for_one_owner() {
        let manager = Arc::new(CommitmentManager::default());
        let owner = PlayerId::new([4; 16]);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.create_session(owner, game(), None).await })
            })
            .collect();

        let mut ok = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_reopen_restores_sessions_and_audits() {
        let store = Arc::new(MemorySessionStore::new());
        let config = EngineConfig::default();
        let owner = PlayerId::new([2; 16]);
        let other = PlayerId::new([3; 16]);

        let (open, ended, audit) = {
            let manager = CommitmentManager::open(&config, store.clone()).await.unwrap();
            let open = manager
                .create_session(owner, game(), Some(hash::client_commitment("abc")))
                .await
                .unwrap();
            manager.reveal_client_secret(&open.session_id, "abc").await.unwrap();
            let ended = manager.create_session(other, game(), None).await.unwrap();
            let audit = manager.end_session(&ended.session_id).await.unwrap();
            (open, ended, audit)
        };

        let manager = CommitmentManager::open(&config, store).await.unwrap();
        assert_eq!(manager.session_count().await, 2);
        assert_eq!(manager.audit_record(&ended.session_id).await, Some(audit));

        let session = manager.get(&open.session_id).await.unwrap();
        let session = session.lock().await;
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.client_secret(), Some("abc"));
        drop(session);

        let err = manager.create_session(owner, game(), None).await.unwrap_err();
        assert!(matches!(err, FairnessError::SessionAlreadyActive { session, .. } if session == open.session_id));
        assert!(manager.create_session(other, game(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_audit_rebuilt_from_row() {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::open(PlayerId::new([5; 16]), game(), None, 0).unwrap();
        let audit = session.end().unwrap();
        store.save(&session.row()).await.unwrap();

        let manager = CommitmentManager::open(&EngineConfig::default(), store.clone()).await.unwrap();
        assert_eq!(manager.audit_record(&session.id).await, Some(audit.clone()));
        assert_eq!(store.audits().await.unwrap(), vec![audit]);
    }

    #[tokio::test]
    async fn test_tampered_row_refuses_to_load() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::open(PlayerId::new([5; 16]), game(), None, 0).unwrap();
        let mut row = session.row();
        row.server_secret = [0; 32];
        store.save(&row).await.unwrap();

        let err = CommitmentManager::open(&EngineConfig::default(), store).await.err().unwrap();
        assert!(matches!(err, FairnessError::SecretHashMismatch { .. }));
    }
}
