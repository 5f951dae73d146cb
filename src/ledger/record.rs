//! Spin Records
//!
//! One immutable record per spin. Every field is covered by verification:
//! `prev_hash`, `seed` and `index` by the record hash, `positions` by stream
//! re-derivation against the stored `reel_lengths`, `outcome_digest` by
//! re-evaluation.

use serde::{Serialize, Deserialize};

use crate::core::hash::{self, ChainHash};
use crate::error::FairnessError;
use crate::session::state::SessionId;

/// Append-only record of one spin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinRecord {
    /// Owning session.
    pub session_id: SessionId,
    /// Sequence index (monotonic, gapless within the session).
    pub index: u64,
    /// Client-supplied per-spin seed.
    pub seed: String,
    /// Hash of the previous record, or the genesis hash.
    #[serde(with = "hex")]
    pub prev_hash: ChainHash,
    /// `H(prevHash ‖ serverSecret ‖ seed ‖ index)`.
    #[serde(with = "hex")]
    pub hash: ChainHash,
    /// Reel lengths the positions were drawn against.
    pub reel_lengths: Vec<u32>,
    /// Reel stop positions, one per reel.
    pub positions: Vec<u32>,
    /// Opaque digest returned by the payout evaluator.
    #[serde(with = "hex")]
    pub outcome_digest: ChainHash,
}

impl SpinRecord {
    /// Build a record, computing its chain hash.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        session_id: SessionId,
        index: u64,
        seed: String,
        prev_hash: ChainHash,
        server_secret: &[u8; 32],
        reel_lengths: Vec<u32>,
        positions: Vec<u32>,
        outcome_digest: ChainHash,
    ) -> Self {
        let hash = hash::record_hash(&prev_hash, server_secret, &seed, index);
        Self {
            session_id,
            index,
            seed,
            prev_hash,
            hash,
            reel_lengths,
            positions,
            outcome_digest,
        }
    }

    /// Recompute the chain hash from the stored fields.
    pub fn expected_hash(&self, server_secret: &[u8; 32]) -> ChainHash {
        hash::record_hash(&self.prev_hash, server_secret, &self.seed, self.index)
    }

    /// Does the stored hash recompute?
    pub fn verify_hash(&self, server_secret: &[u8; 32]) -> bool {
        self.expected_hash(server_secret) == self.hash
    }
}

/// Reject seeds that are empty or longer than `max_len` bytes.
pub fn validate_seed(seed: &str, max_len: usize) -> Result<(), FairnessError> {
    if seed.is_empty() {
        return Err(FairnessError::InvalidSeed { reason: "seed is empty".to_string() });
    }
    if seed.len() > max_len {
        return Err(FairnessError::InvalidSeed {
            reason: format!("seed is {} bytes, limit is {}", seed.len(), max_len),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SpinRecord {
        SpinRecord::compute(
            SessionId([1; 16]),
            4,
            "c4".to_string(),
            [2; 32],
            &[3; 32],
            vec![5, 5, 5],
            vec![1, 2, 3],
            [4; 32],
        )
    }

    #[test]
    fn test_compute_matches_formula() {
        let rec = record();
        assert_eq!(rec.hash, hash::record_hash(&[2; 32], &[3; 32], "c4", 4));
        assert!(rec.verify_hash(&[3; 32]));
        assert!(!rec.verify_hash(&[9; 32]));
    }

    #[test]
    fn test_tampered_fields_fail_hash() {
        let mut rec = record();
        rec.seed = "c5".to_string();
        assert!(!rec.verify_hash(&[3; 32]));

        let mut rec = record();
        rec.index = 5;
        assert!(!rec.verify_hash(&[3; 32]));

        let mut rec = record();
        rec.prev_hash[31] ^= 1;
        assert!(!rec.verify_hash(&[3; 32]));
    }

    #[test]
    fn test_reel_lengths_persist() {
        let json = serde_json::to_string(&record()).unwrap();
        assert!(json.contains("\"reel_lengths\":[5,5,5]"));
    }

    #[test]
    fn test_json_uses_hex() {
        let json = serde_json::to_string(&record()).unwrap();
        assert!(json.contains(&hex::encode([2u8; 32])));
        let parsed: SpinRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record());
    }

    #[test]
    fn test_validate_seed() {
        assert!(validate_seed("abc", 8).is_ok());
        assert!(matches!(validate_seed("", 8), Err(FairnessError::InvalidSeed { .. })));
        assert!(matches!(validate_seed("123456789", 8), Err(FairnessError::InvalidSeed { .. })));
    }
}
