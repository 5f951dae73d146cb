//! Session Transcript
//!
//! Everything an independent verifier needs to re-check an ended session,
//! in one self-contained JSON document.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::hash::{self, ChainHash};
use crate::ledger::record::SpinRecord;
use crate::session::state::{GameContext, PlayerId, SessionId};

/// Current transcript version.
pub const TRANSCRIPT_VERSION: u8 = 1;

/// Complete, publishable record of an ended session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTranscript {
    /// Version for forward compatibility.
    pub version: u8,

    /// Session identifier.
    pub session_id: SessionId,

    /// Session owner.
    pub owner: PlayerId,

    /// Game parameters.
    pub game: GameContext,

    /// Index of the first record.
    pub start_sequence: u64,

    /// `H(serverSecret)` published at creation.
    #[serde(with = "hex")]
    pub server_secret_hash: ChainHash,

    /// Client commitment, if the session used one.
    #[serde(default, with = "crate::core::hash::hex_option")]
    pub client_commitment: Option<ChainHash>,

    /// Revealed client secret.
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Revealed server secret.
    #[serde(with = "hex")]
    pub server_secret: [u8; 32],

    /// When the server secret was revealed.
    pub revealed_at: DateTime<Utc>,

    /// Every spin record, in index order.
    pub records: Vec<SpinRecord>,
}

impl SessionTranscript {
    /// `prevHash` of the first record.
    pub fn genesis_hash(&self) -> ChainHash {
        hash::genesis_hash(&self.server_secret_hash, self.client_commitment.as_ref())
    }

    /// Number of spins.
    pub fn spin_count(&self) -> usize {
        self.records.len()
    }

    /// Hash of the final record, or genesis for a session without spins.
    pub fn final_hash(&self) -> ChainHash {
        self.records.last().map_or_else(|| self.genesis_hash(), |r| r.hash)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
