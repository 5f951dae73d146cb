//! Core deterministic primitives.
//!
//! Everything in this module is part of the verification protocol and must
//! produce bit-identical output on every platform and implementation.

pub mod hash;
pub mod rng;

// Re-export core types
pub use hash::{ChainHash, ChainHasher};
pub use rng::{RngError, StreamRng, MAX_DRAW_ATTEMPTS};
