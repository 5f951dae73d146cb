//! Protocol Hashing
//!
//! SHA-256 primitives for the commitment protocol and the spin hash chain:
//! - Server secret hash (published at session start)
//! - Client commitment (published before the client secret is revealed)
//! - Genesis pointer and per-record chain hashes
//!
//! Every function here is part of the verification protocol. The byte layout
//! must never change, or existing sessions stop verifying.

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes).
pub type ChainHash = [u8; 32];

/// Incremental hasher with fixed-width integer helpers.
///
/// Integers are encoded big-endian. Order of updates is part of the protocol.
pub struct ChainHasher {
    hasher: Sha256,
}

impl Default for ChainHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainHasher {
    /// Create a hasher with no domain prefix.
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    /// Create a hasher with a domain separator prefix.
    pub fn with_domain(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u32 value (big-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_be_bytes());
    }

    /// Update with a u64 value (big-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_be_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ChainHash {
        self.hasher.finalize().into()
    }
}

/// Compute a simple hash of arbitrary data.
pub fn hash_bytes(data: &[u8]) -> ChainHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `H(serverSecret)`, published when the session is created.
pub fn server_secret_hash(server_secret: &[u8; 32]) -> ChainHash {
    hash_bytes(server_secret)
}

/// `H(clientSecret)`, the commitment a client publishes before revealing.
pub fn client_commitment(client_secret: &str) -> ChainHash {
    hash_bytes(client_secret.as_bytes())
}

/// Hash pointer used as `prevHash` of the first record in a session.
///
/// `H(serverSecretHash ‖ clientCommitment)`, or `serverSecretHash` itself
/// when the session was opened without a client commitment.
pub fn genesis_hash(server_secret_hash: &ChainHash, client_commitment: Option<&ChainHash>) -> ChainHash {
    match client_commitment {
        Some(commitment) => {
            let mut hasher = ChainHasher::new();
            hasher.update_bytes(server_secret_hash);
            hasher.update_bytes(commitment);
            hasher.finalize()
        }
        None => *server_secret_hash,
    }
}

/// `H(prevHash ‖ serverSecret ‖ perSpinSeed ‖ index)`.
///
/// `prevHash` and `serverSecret` are 32 bytes and `index` is 8 bytes, so the
/// variable-length seed in between needs no length prefix.
pub fn record_hash(prev_hash: &ChainHash, server_secret: &[u8; 32], seed: &str, index: u64) -> ChainHash {
    let mut hasher = ChainHasher::new();
    hasher.update_bytes(prev_hash);
    hasher.update_bytes(server_secret);
    hasher.update_bytes(seed.as_bytes());
    hasher.update_u64(index);
    hasher.finalize()
}

/// Parse a 64-character hex string into a hash.
pub fn parse_hash_hex(s: &str) -> Option<ChainHash> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Serde adapter for optional hex-encoded hashes.
pub mod hex_option {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::ChainHash;

    /// Serialize `Some(hash)` as a hex string, `None` as null.
    pub fn serialize<S: Serializer>(value: &Option<ChainHash>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(hash) => serializer.serialize_some(&hex::encode(hash)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional hex string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<ChainHash>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| super::parse_hash_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 32-byte hex")))
            .transpose()
    }
}

// =============================================================================
// TESTS
// =============================================================================
