//! Commitment Protocol
//!
//! Client side of the handshake, and the reveal checks both parties run.
//!
//! 1. Client picks a secret and publishes `H(secret)` when the session opens.
//! 2. Server publishes `H(serverSecret)` in the create response.
//! 3. Client reveals its secret before the first spin.
//! 4. Server reveals its secret when the session ends.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::core::hash::{self, ChainHash};

/// Errors raised when a revealed secret does not open its commitment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitmentError {
    /// `H(clientSecret)` differs from the published commitment.
    #[error("client secret does not match commitment")]
    ClientPreimageMismatch,

    /// `H(serverSecret)` differs from the published hash.
    #[error("server secret does not match published hash")]
    ServerPreimageMismatch,
}

/// A client secret together with its commitment.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCommitment {
    secret: String,
    commitment: ChainHash,
}

impl ClientCommitment {
    /// Fresh random secret (32 bytes from the OS CSPRNG, hex encoded).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::from_secret(hex::encode(bytes))
    }

    /// Commit to a known secret.
    pub fn from_secret(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        let commitment = hash::client_commitment(&secret);
        Self { secret, commitment }
    }

    /// Secret to reveal.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Value to publish.
    pub fn commitment(&self) -> ChainHash {
        self.commitment
    }
}

impl std::fmt::Debug for ClientCommitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCommitment")
            .field("commitment", &hex::encode(self.commitment))
            .finish_non_exhaustive()
    }
}

/// Check a revealed client secret.
pub fn verify_client_reveal(secret: &str, commitment: &ChainHash) -> Result<(), CommitmentError> {
    if hash::client_commitment(secret) == *commitment {
        Ok(())
    } else {
        Err(CommitmentError::ClientPreimageMismatch)
    }
}

/// Check a revealed server secret.
pub fn verify_server_reveal(server_secret: &[u8; 32], published: &ChainHash) -> Result<(), CommitmentError> {
    if hash::server_secret_hash(server_secret) == *published {
        Ok(())
    } else {
        Err(CommitmentError::ServerPreimageMismatch)
    }
}
