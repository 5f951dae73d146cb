//! Stream RNG
//!
//! Converts committed secrets plus chain state into unbiased reel stop positions.
//!
//! ```text
//! master  = HKDF-SHA256(salt = serverSecret,
//!                       ikm  = prevHash ‖ perSpinSeed ‖ be64(index),
//!                       info = "SPINPROOF_STREAM_V1", L = 32)
//! draw    = HKDF-Expand(prk  = master,
//!                       info = "SPINPROOF_DRAW_V1" ‖ be32(call) ‖ be32(attempt), L = 8)
//! value   = be_u64(draw), rejected while value >= floor(2^64 / max) * max
//! ```
//!
//! The call counter lives in the `StreamRng` value the orchestrator owns for a
//! single spin. Nothing here is shared between spins.

use hkdf::Hkdf;
use sha2::Sha256;

use super::hash::ChainHash;

/// HKDF info label for the per-spin master key.
pub const STREAM_KEY_LABEL: &[u8] = b"SPINPROOF_STREAM_V1";

/// HKDF info prefix for individual draws.
pub const DRAW_LABEL: &[u8] = b"SPINPROOF_DRAW_V1";

/// Rejection-sampling attempts per draw before giving up.
///
/// Heuristic, not a security parameter. Verifiers must use the same value.
pub const MAX_DRAW_ATTEMPTS: u32 = 100;

/// Stream RNG failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RngError {
    /// `next_int(0)` has no valid output.
    #[error("cannot draw from an empty range")]
    EmptyRange,

    /// Every attempt landed in the rejection zone.
    #[error("draw {call} exhausted {attempts} attempts for max {max}")]
    Exhausted {
        /// Call counter of the failed draw.
        call: u32,
        /// Upper bound requested.
        max: u64,
        /// Attempts made.
        attempts: u32,
    },

    /// The call counter ran out.
    #[error("draw counter overflow")]
    CounterOverflow,

    /// HKDF rejected a key or output length.
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Deterministic integer stream for one spin.
///
/// # Determinism Guarantee
///
/// Identical `(serverSecret, perSpinSeed, index, prevHash)` always yield the
/// identical sequence of draws, on every implementation of the protocol.
#[derive(Clone)]
pub struct StreamRng {
    expander: Hkdf<Sha256>,
    counter: u32,
}

impl std::fmt::Debug for StreamRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRng")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl StreamRng {
    /// Derive the stream for one spin. Pure and side-effect free.
    pub fn derive(
        server_secret: &[u8; 32],
        seed: &str,
        index: u64,
        prev_hash: &ChainHash,
    ) -> Result<Self, RngError> {
        let master = derive_master_key(server_secret, seed, index, prev_hash)?;
        Self::from_master_key(&master)
    }

    /// Build a stream from an already derived master key.
    pub fn from_master_key(master: &[u8; 32]) -> Result<Self, RngError> {
        let expander = Hkdf::<Sha256>::from_prk(master).map_err(|_| RngError::KeyDerivation)?;
        Ok(Self { expander, counter: 0 })
    }

    /// Draw a uniformly distributed integer in `[0, max)`.
    pub fn next_int(&mut self, max: u64) -> Result<u64, RngError> {
        self.next_int_capped(max, MAX_DRAW_ATTEMPTS)
    }

    /// Draw one stop position per reel, strictly in slice order.
    ///
    /// The iteration order is part of the protocol.
    pub fn positions(&mut self, reel_lengths: &[u32]) -> Result<Vec<u32>, RngError> {
        let mut out = Vec::with_capacity(reel_lengths.len());
        for &len in reel_lengths {
            // value < len <= u32::MAX
            out.push(self.next_int(u64::from(len))? as u32);
        }
        Ok(out)
    }

    fn next_int_capped(&mut self, max: u64, max_attempts: u32) -> Result<u64, RngError> {
        if max == 0 {
            return Err(RngError::EmptyRange);
        }

        let call = self.counter;
        self.counter = self.counter.checked_add(1).ok_or(RngError::CounterOverflow)?;

        let limit = rejection_limit(max);
        for attempt in 0..max_attempts {
            let value = self.draw_u64(call, attempt)?;
            if u128::from(value) < limit {
                return Ok(value % max);
            }
        }

        Err(RngError::Exhausted { call, max, attempts: max_attempts })
    }

    /// Expand the 8-byte sub-key for `(call, attempt)`.
    fn draw_u64(&self, call: u32, attempt: u32) -> Result<u64, RngError> {
        let mut info = Vec::with_capacity(DRAW_LABEL.len() + 8);
        info.extend_from_slice(DRAW_LABEL);
        info.extend_from_slice(&call.to_be_bytes());
        info.extend_from_slice(&attempt.to_be_bytes());

        let mut okm = [0u8; 8];
        self.expander
            .expand(&info, &mut okm)
            .map_err(|_| RngError::KeyDerivation)?;
        Ok(u64::from_be_bytes(okm))
    }
}

/// Derive the 32-byte master key for one spin.
pub fn derive_master_key(
    server_secret: &[u8; 32],
    seed: &str,
    index: u64,
    prev_hash: &ChainHash,
) -> Result<[u8; 32], RngError> {
    let mut ikm = Vec::with_capacity(32 + seed.len() + 8);
    ikm.extend_from_slice(prev_hash);
    ikm.extend_from_slice(seed.as_bytes());
    ikm.extend_from_slice(&index.to_be_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&server_secret[..]), &ikm);
    let mut master = [0u8; 32];
    hk.expand(STREAM_KEY_LABEL, &mut master)
        .map_err(|_| RngError::KeyDerivation)?;
    Ok(master)
}

/// Largest multiple of `max` not exceeding 2^64. Draws at or above it are discarded.
#[inline]
pub fn rejection_limit(max: u64) -> u128 {
    let space = 1u128 << 64;
    let max = u128::from(max);
    (space / max) * max
}

// =============================================================================
// TESTS
// =============================================================================
