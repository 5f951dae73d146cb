//! Session State
//!
//! Session entity, its lifecycle state machine and the audit record written
//! when the server secret is revealed.
//!
//! ```text
//!            commitment supplied
//!  Created ───────────────────────▶ Committed ──reveal──▶ Active ──end──▶ Ended
//!     │                                 │                   ▲             ▲
//!     └──────────── no commitment ──────┼───────────────────┘             │
//!                                       └────────────────end──────────────┘
//! ```

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::hash::{self, ChainHash};
use crate::error::FairnessError;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Unique session identifier (UUID as bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0))
    }
}

/// Session owner (player) identifier.
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0))
    }
}

/// Serialize identifiers as hyphenated UUID strings.
macro_rules! uuid_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                $ty::from_uuid_str(&raw)
                    .ok_or_else(|| serde::de::Error::custom(concat!("invalid ", stringify!($ty))))
            }
        }
    };
}

uuid_serde!(SessionId);
uuid_serde!(PlayerId);

// =============================================================================
// SERVER SECRET
// =============================================================================

/// 256-bit server secret.
///
/// Not `Serialize`. It leaves the process only through [`AuditRecord`],
/// which exists once the session has Ended.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerSecret([u8; 32]);

impl ServerSecret {
    /// Fresh secret from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap known bytes (tests, replay tooling).
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }

    /// `H(serverSecret)`.
    pub fn commitment(&self) -> ChainHash {
        hash::server_secret_hash(&self.0)
    }
}

impl std::fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerSecret(<redacted>)")
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Secrets generated, not yet open for play.
    Created,
    /// Client commitment recorded, waiting for the client secret.
    Committed,
    /// Spins may be appended.
    Active,
    /// Server secret revealed. Terminal.
    Ended,
}

impl SessionStatus {
    /// Legal edges of the lifecycle state machine.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Committed) | (Created, Active) | (Committed, Active) | (Committed, Ended) | (Active, Ended)
        )
    }
}

/// Game parameters the session was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameContext {
    /// Game mode / configuration identifier handed to the reel-length provider.
    pub game_mode: String,
    /// Stake debited per spin.
    pub bet: u64,
}

/// A provably-fair game session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Player who owns the session.
    pub owner: PlayerId,
    /// Game parameters.
    pub game: GameContext,
    status: SessionStatus,
    server_secret: ServerSecret,
    server_secret_hash: ChainHash,
    client_commitment: Option<ChainHash>,
    client_secret: Option<String>,
    client_revealed: bool,
    start_sequence: u64,
    next_sequence: u64,
    version: u64,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    frozen: Option<String>,
}

impl Session {
    /// Create a session with a fresh server secret and open it.
    pub fn open(
        owner: PlayerId,
        game: GameContext,
        client_commitment: Option<ChainHash>,
        start_sequence: u64,
    ) -> Result<Self, FairnessError> {
        Self::open_with_secret(SessionId::generate(), owner, game, client_commitment, start_sequence, ServerSecret::generate())
    }

    /// Create a session with a known secret and open it.
    pub fn open_with_secret(
        id: SessionId,
        owner: PlayerId,
        game: GameContext,
        client_commitment: Option<ChainHash>,
        start_sequence: u64,
        server_secret: ServerSecret,
    ) -> Result<Self, FairnessError> {
        let mut session = Self {
            id,
            owner,
            game,
            status: SessionStatus::Created,
            server_secret_hash: server_secret.commitment(),
            server_secret,
            client_commitment,
            client_secret: None,
            client_revealed: false,
            start_sequence,
            next_sequence: start_sequence,
            version: 0,
            created_at: Utc::now(),
            ended_at: None,
            frozen: None,
        };

        let next = if session.client_commitment.is_some() {
            SessionStatus::Committed
        } else {
            SessionStatus::Active
        };
        session.transition(next)?;
        Ok(session)
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// `H(serverSecret)`, public from creation.
    pub fn server_secret_hash(&self) -> &ChainHash {
        &self.server_secret_hash
    }

    /// Server secret for chain computation inside the engine.
    pub(crate) fn server_secret(&self) -> &ServerSecret {
        &self.server_secret
    }

    /// Client commitment, if one was supplied.
    pub fn client_commitment(&self) -> Option<&ChainHash> {
        self.client_commitment.as_ref()
    }

    /// Revealed client secret.
    pub fn client_secret(&self) -> Option<&str> {
        self.client_secret.as_deref()
    }

    /// Whether the client secret has been verified.
    pub fn client_revealed(&self) -> bool {
        self.client_revealed
    }

    /// Index of the first spin record.
    pub fn start_sequence(&self) -> u64 {
        self.start_sequence
    }

    /// Index after the last spin that was appended and settled.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Optimistic version, bumped by every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Reveal time, once Ended.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Reason the session was frozen for manual audit.
    pub fn frozen_reason(&self) -> Option<&str> {
        self.frozen.as_deref()
    }

    /// Hash pointer of the first record.
    pub fn genesis_hash(&self) -> ChainHash {
        hash::genesis_hash(&self.server_secret_hash, self.client_commitment.as_ref())
    }

    /// Check that a spin may be appended right now.
    pub fn ensure_spinnable(&self) -> Result<(), FairnessError> {
        if let Some(reason) = &self.frozen {
            return Err(FairnessError::SessionFrozen { session: self.id, reason: reason.clone() });
        }
        match self.status {
            SessionStatus::Active => Ok(()),
            SessionStatus::Committed => Err(FairnessError::ClientSecretRequired { session: self.id }),
            status => Err(FairnessError::SessionInactive { session: self.id, status }),
        }
    }

    /// Verify and record the client secret.
    ///
    /// Legal only while Committed, i.e. before any spin has been appended.
    pub fn reveal_client_secret(&mut self, secret: &str) -> Result<(), FairnessError> {
        if self.status == SessionStatus::Ended {
            return Err(FairnessError::AlreadyEnded { session: self.id });
        }
        let commitment = self
            .client_commitment
            .ok_or(FairnessError::ClientSecretRequired { session: self.id })?;
        if self.client_revealed {
            return Err(FairnessError::AlreadyVerified { session: self.id });
        }
        if self.next_sequence != self.start_sequence {
            return Err(FairnessError::IllegalTransition {
                session: self.id,
                from: self.status,
                to: SessionStatus::Active,
            });
        }
        if hash::client_commitment(secret) != commitment {
            return Err(FairnessError::VerificationFailed { session: self.id });
        }

        self.transition(SessionStatus::Active)?;
        self.client_secret = Some(secret.to_string());
        self.client_revealed = true;
        Ok(())
    }

    /// Record that the spin at `index` was appended and settled.
    pub fn advance(&mut self, index: u64) {
        debug_assert!(index >= self.next_sequence);
        self.next_sequence = index.saturating_add(1);
        self.version += 1;
    }

    /// Transition to Ended and produce the audit record.
    pub fn end(&mut self) -> Result<AuditRecord, FairnessError> {
        if !matches!(self.status, SessionStatus::Active | SessionStatus::Committed) {
            return Err(FairnessError::AlreadyEnded { session: self.id });
        }
        self.transition(SessionStatus::Ended)?;
        let revealed_at = Utc::now();
        self.ended_at = Some(revealed_at);
        Ok(self.audit_at(revealed_at))
    }

    /// Audit record, once Ended.
    pub fn audit_record(&self) -> Option<AuditRecord> {
        let revealed_at = self.ended_at.filter(|_| self.status == SessionStatus::Ended)?;
        Some(self.audit_at(revealed_at))
    }

    fn audit_at(&self, revealed_at: DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            session_id: self.id,
            server_secret: *self.server_secret.expose(),
            server_secret_hash: self.server_secret_hash,
            revealed_at,
        }
    }

    /// Freeze the session after a chain-integrity failure.
    pub fn freeze(&mut self, reason: impl Into<String>) {
        if self.frozen.is_none() {
            self.frozen = Some(reason.into());
            self.version += 1;
        }
    }

    fn transition(&mut self, next: SessionStatus) -> Result<(), FairnessError> {
        if !self.status.can_transition_to(next) {
            return Err(FairnessError::IllegalTransition { session: self.id, from: self.status, to: next });
        }
        self.status = next;
        self.version += 1;
        Ok(())
    }

    /// Durable form of the session.
    pub fn row(&self) -> SessionRow {
        SessionRow {
            session_id: self.id,
            owner: self.owner,
            game: self.game.clone(),
            status: self.status,
            server_secret: *self.server_secret.expose(),
            server_secret_hash: self.server_secret_hash,
            client_commitment: self.client_commitment,
            client_secret: self.client_secret.clone(),
            start_sequence: self.start_sequence,
            next_sequence: self.next_sequence,
            version: self.version,
            created_at: self.created_at,
            ended_at: self.ended_at,
            frozen: self.frozen.clone(),
        }
    }

    /// Rebuild a session from its durable form.
    ///
    /// Fails with [`FairnessError::SecretHashMismatch`] if the stored secret
    /// no longer opens the published hash.
    pub fn restore(row: SessionRow) -> Result<Self, FairnessError> {
        let server_secret = ServerSecret::from_bytes(row.server_secret);
        if server_secret.commitment() != row.server_secret_hash {
            return Err(FairnessError::SecretHashMismatch { session: row.session_id });
        }
        if let (Some(commitment), Some(secret)) = (&row.client_commitment, &row.client_secret) {
            if hash::client_commitment(secret) != *commitment {
                return Err(FairnessError::VerificationFailed { session: row.session_id });
            }
        }

        Ok(Self {
            id: row.session_id,
            owner: row.owner,
            game: row.game,
            status: row.status,
            server_secret,
            server_secret_hash: row.server_secret_hash,
            client_commitment: row.client_commitment,
            client_revealed: row.client_secret.is_some(),
            client_secret: row.client_secret,
            start_sequence: row.start_sequence,
            next_sequence: row.next_sequence,
            version: row.version,
            created_at: row.created_at,
            ended_at: row.ended_at,
            frozen: row.frozen,
        })
    }

    /// Public view of the session. Contains the server secret only once Ended.
    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id,
            owner: self.owner,
            game: self.game.clone(),
            status: self.status,
            server_secret_hash: self.server_secret_hash,
            client_commitment: self.client_commitment,
            client_revealed: self.client_revealed,
            start_sequence: self.start_sequence,
            next_sequence: self.next_sequence,
            version: self.version,
            created_at: self.created_at,
            revealed_server_secret: (self.status == SessionStatus::Ended).then(|| *self.server_secret.expose()),
            frozen: self.frozen.clone(),
        }
    }
}

/// Serializable projection of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owner.
    pub owner: PlayerId,
    /// Game parameters.
    pub game: GameContext,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// `H(serverSecret)`.
    #[serde(with = "hex")]
    pub server_secret_hash: ChainHash,
    /// Client commitment.
    #[serde(default, with = "crate::core::hash::hex_option")]
    pub client_commitment: Option<ChainHash>,
    /// Whether the client secret was verified.
    pub client_revealed: bool,
    /// First record index.
    pub start_sequence: u64,
    /// Next record index.
    pub next_sequence: u64,
    /// Optimistic version.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Server secret, only after Ended.
    #[serde(default, with = "crate::core::hash::hex_option")]
    pub revealed_server_secret: Option<[u8; 32]>,
    /// Freeze reason.
    pub frozen: Option<String>,
}

/// Durable form of a [`Session`], server secret included.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owner.
    pub owner: PlayerId,
    /// Game parameters.
    pub game: GameContext,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Server secret.
    #[serde(with = "hex")]
    pub server_secret: [u8; 32],
    /// `H(serverSecret)`.
    #[serde(with = "hex")]
    pub server_secret_hash: ChainHash,
    /// Client commitment.
    #[serde(default, with = "crate::core::hash::hex_option")]
    pub client_commitment: Option<ChainHash>,
    /// Verified client secret.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// First record index.
    pub start_sequence: u64,
    /// Index after the last settled spin.
    pub next_sequence: u64,
    /// Optimistic version.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Reveal time.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Freeze reason.
    #[serde(default)]
    pub frozen: Option<String>,
}

impl std::fmt::Debug for SessionRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRow")
            .field("session_id", &self.session_id)
            .field("status", &self.status)
            .field("next_sequence", &self.next_sequence)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Written exactly once, when the session Ends. Immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Session the secret belongs to.
    pub session_id: SessionId,
    /// Revealed server secret.
    #[serde(with = "hex")]
    pub server_secret: [u8; 32],
    /// Hash published at creation.
    #[serde(with = "hex")]
    pub server_secret_hash: ChainHash,
    /// Reveal time.
    pub revealed_at: DateTime<Utc>,
}
