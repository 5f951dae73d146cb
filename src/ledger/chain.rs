//! Hash Chain Ledger
//!
//! Binds every spin record to its predecessor. The chain tip (next index and
//! `prevHash`) is always recomputed from durable storage and re-verified
//! before it is used, so a restarted process continues the exact chain the
//! store holds instead of forking it.

use std::sync::Arc;

use tracing::{debug, error};

use crate::core::hash::ChainHash;
use crate::error::FairnessError;
use crate::ledger::record::SpinRecord;
use crate::ledger::store::{LedgerStore, StoreError};
use crate::session::state::{Session, SessionId};

/// Where the next record attaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    /// Index the next record will take.
    pub next_index: u64,
    /// `prevHash` the next record will carry.
    pub prev_hash: ChainHash,
    /// Most recent record, if any.
    pub last: Option<SpinRecord>,
}

/// Payload of a standalone append.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    /// Per-spin client seed.
    pub seed: String,
    /// Reel lengths the positions were drawn against.
    pub reel_lengths: Vec<u32>,
    /// Reel stop positions.
    pub positions: Vec<u32>,
    /// Evaluator digest.
    pub outcome_digest: ChainHash,
    /// Index the caller believes is next.
    pub expected_index: Option<u64>,
}

/// Append-only hash chain over a [`LedgerStore`].
#[derive(Clone)]
pub struct HashChainLedger {
    store: Arc<dyn LedgerStore>,
}

impl HashChainLedger {
    /// Wrap a store.
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Recompute the chain tip from storage.
    ///
    /// Fails with a chain-integrity error if the stored tail has a gap, does
    /// not recompute, or (for a single-record chain) does not point at genesis.
    pub async fn chain_tip(&self, session: &Session) -> Result<ChainTip, FairnessError> {
        let len = self.store.len(&session.id).await?;
        let last = self.store.last(&session.id).await?;

        let Some(last) = last else {
            if len != 0 {
                return Err(broken(session.id, session.start_sequence(), "store reports records but no tail"));
            }
            return Ok(ChainTip {
                next_index: session.start_sequence(),
                prev_hash: session.genesis_hash(),
                last: None,
            });
        };

        let expected_index = session.start_sequence().checked_add(len.saturating_sub(1));
        if Some(last.index) != expected_index {
            return Err(broken(
                session.id,
                last.index,
                format!("tail index {} but {} records from {}", last.index, len, session.start_sequence()),
            ));
        }
        if last.session_id != session.id {
            return Err(broken(session.id, last.index, format!("tail belongs to session {}", last.session_id)));
        }
        if len == 1 && last.prev_hash != session.genesis_hash() {
            return Err(FairnessError::GenesisMismatch { session: session.id });
        }
        if !last.verify_hash(session.server_secret().expose()) {
            error!(
                session = %session.id,
                index = last.index,
                seed = %last.seed,
                prev_hash = %hex::encode(last.prev_hash),
                stored_hash = %hex::encode(last.hash),
                "stored tail hash does not recompute"
            );
            return Err(broken(session.id, last.index, "stored hash does not recompute"));
        }

        let next_index = last
            .index
            .checked_add(1)
            .ok_or(FairnessError::SequenceExhausted { session: session.id, index: last.index })?;

        Ok(ChainTip {
            next_index,
            prev_hash: last.hash,
            last: Some(last),
        })
    }

    /// Reject a caller-supplied expected index that disagrees with the tip.
    ///
    /// A stale index whose stored record carries the same seed is a retried
    /// spin that already landed and reports [`FairnessError::DuplicateSpin`].
    pub async fn check_expected_index(
        &self,
        session: &Session,
        tip: &ChainTip,
        expected: Option<u64>,
        seed: &str,
    ) -> Result<(), FairnessError> {
        let Some(expected) = expected else {
            return Ok(());
        };
        if expected == tip.next_index {
            return Ok(());
        }

        if expected < tip.next_index {
            if let Some(existing) = self.store.get(&session.id, expected).await? {
                if existing.seed == seed {
                    debug!(session = %session.id, index = expected, "spin already recorded");
                    return Err(FairnessError::DuplicateSpin { session: session.id, index: expected });
                }
            }
        }

        Err(FairnessError::NonceMismatch { session: session.id, expected, actual: tip.next_index })
    }

    /// Append a record at `tip`.
    ///
    /// Compare-and-append: if another writer moved the tip since it was read,
    /// nothing is written and [`FairnessError::NonceMismatch`] is returned.
    pub async fn append_at(
        &self,
        session: &Session,
        tip: &ChainTip,
        seed: String,
        reel_lengths: Vec<u32>,
        positions: Vec<u32>,
        outcome_digest: ChainHash,
    ) -> Result<SpinRecord, FairnessError> {
        let record = SpinRecord::compute(
            session.id,
            tip.next_index,
            seed,
            tip.prev_hash,
            session.server_secret().expose(),
            reel_lengths,
            positions,
            outcome_digest,
        );

        let expected_len = tip.next_index - session.start_sequence();
        match self.store.append(record.clone(), expected_len).await {
            Ok(()) => {
                debug!(session = %session.id, index = record.index, hash = %hex::encode(record.hash), "record appended");
                Ok(record)
            }
            Err(StoreError::Conflict { actual, .. }) => Err(FairnessError::NonceMismatch {
                session: session.id,
                expected: tip.next_index,
                actual: session.start_sequence().saturating_add(actual),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Append the next record, computing index and `prevHash` from storage.
    pub async fn append(&self, session: &Session, request: AppendRequest) -> Result<SpinRecord, FairnessError> {
        let tip = self.chain_tip(session).await?;
        self.check_expected_index(session, &tip, request.expected_index, &request.seed).await?;
        self.append_at(session, &tip, request.seed, request.reel_lengths, request.positions, request.outcome_digest)
            .await
    }

    /// Most recent record.
    pub async fn last_record(&self, session: &SessionId) -> Result<Option<SpinRecord>, FairnessError> {
        Ok(self.store.last(session).await?)
    }

    /// Record at `index`.
    pub async fn record_at(&self, session: &SessionId, index: u64) -> Result<Option<SpinRecord>, FairnessError> {
        Ok(self.store.get(session, index).await?)
    }

    /// Every record of the session, in order.
    pub async fn records(&self, session: &SessionId) -> Result<Vec<SpinRecord>, FairnessError> {
        Ok(self.store.records(session).await?)
    }
}

fn broken(session: SessionId, index: u64, reason: impl Into<String>) -> FairnessError {
    FairnessError::ChainBroken { session, index, reason: reason.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash;
    use crate::ledger::store::{FileLedgerStore, MemoryLedgerStore};
    use crate::session::state::{GameContext, PlayerId, ServerSecret};

    fn session(start: u64, commitment: Option<ChainHash>) -> Session {
        Session::open_with_secret(
            SessionId([9; 16]),
            PlayerId::new([1; 16]),
            GameContext { game_mode: "classic".to_string(), bet: 1 },
            commitment,
            start,
            ServerSecret::from_bytes([5; 32]),
        )
        .unwrap()
    }

    fn request(seed: &str, expected_index: Option<u64>) -> AppendRequest {
        AppendRequest {
            seed: seed.to_string(),
            reel_lengths: vec![3, 3, 3],
            positions: vec![0, 1, 2],
            outcome_digest: [0; 32],
            expected_index,
        }
    }

    #[tokio::test]
    async fn test_first_record_points_at_genesis() {
        let commitment = hash::client_commitment("abc");
        let mut s = session(0, Some(commitment));
        s.reveal_client_secret("abc").unwrap();
        let ledger = HashChainLedger::new(Arc::new(MemoryLedgerStore::new()));

        let record = ledger.append(&s, request("c0", Some(0))).await.unwrap();
        let genesis = hash::genesis_hash(&hash::server_secret_hash(&[5; 32]), Some(&commitment));
        assert_eq!(record.index, 0);
        assert_eq!(record.prev_hash, genesis);
        assert_eq!(record.hash, hash::record_hash(&genesis, &[5; 32], "c0", 0));
    }

    #[tokio::test]
    async fn test_records_link_and_respect_start_sequence() {
        let s = session(100, None);
        let ledger = HashChainLedger::new(Arc::new(MemoryLedgerStore::new()));

        let r0 = ledger.append(&s, request("a", None)).await.unwrap();
        let r1 = ledger.append(&s, request("b", None)).await.unwrap();

        assert_eq!((r0.index, r1.index), (100, 101));
        assert_eq!(r1.prev_hash, r0.hash);
        assert_eq!(ledger.last_record(&s.id).await.unwrap(), Some(r1.clone()));
        assert_eq!(ledger.record_at(&s.id, 100).await.unwrap(), Some(r0));
        assert_eq!(ledger.chain_tip(&s).await.unwrap().next_index, 102);
    }

    #[tokio::test]
    async fn test_expected_index_mismatch_and_duplicate() {
        let s = session(0, None);
        let ledger = HashChainLedger::new(Arc::new(MemoryLedgerStore::new()));
        ledger.append(&s, request("c0", Some(0))).await.unwrap();

        let dup = ledger.append(&s, request("c0", Some(0))).await.unwrap_err();
        assert!(matches!(dup, FairnessError::DuplicateSpin { index: 0, .. }));

        let stale = ledger.append(&s, request("other", Some(0))).await.unwrap_err();
        assert!(matches!(stale, FairnessError::NonceMismatch { expected: 0, actual: 1, .. }));

        let ahead = ledger.append(&s, request("c5", Some(5))).await.unwrap_err();
        assert!(matches!(ahead, FairnessError::NonceMismatch { expected: 5, actual: 1, .. }));

        assert_eq!(ledger.records(&s.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_tip_loses_race() {
        let s = session(0, None);
        let ledger = HashChainLedger::new(Arc::new(MemoryLedgerStore::new()));
        let tip = ledger.chain_tip(&s).await.unwrap();

        ledger.append_at(&s, &tip, "first".to_string(), vec![4], vec![1], [0; 32]).await.unwrap();
        let err = ledger.append_at(&s, &tip, "second".to_string(), vec![4], vec![2], [0; 32]).await.unwrap_err();
        assert!(matches!(err, FairnessError::NonceMismatch { expected: 0, actual: 1, .. }));
    }

    #[tokio::test]
    async fn test_tampered_tail_breaks_tip() {
        let s = session(0, None);
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = HashChainLedger::new(store.clone());
        ledger.append(&s, request("c0", None)).await.unwrap();
        ledger.append(&s, request("c1", None)).await.unwrap();

        store.tamper(&s.id, 1, |r| r.seed = "evil".to_string()).await;
        let err = ledger.chain_tip(&s).await.unwrap_err();
        assert!(matches!(err, FairnessError::ChainBroken { index: 1, .. }));
        assert!(err.breaks_chain());
    }

    #[tokio::test]
    async fn test_wrong_genesis_detected() {
        let s = session(0, None);
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = HashChainLedger::new(store.clone());

        let forged = SpinRecord::compute(s.id, 0, "c0".to_string(), [1; 32], &[5; 32], vec![], vec![], [0; 32]);
        store.append(forged, 0).await.unwrap();
        assert!(matches!(ledger.chain_tip(&s).await, Err(FairnessError::GenesisMismatch { .. })));
    }

    #[tokio::test]
    async fn test_last_index_exhausts_sequence() {
        let s = session(u64::MAX, None);
        let ledger = HashChainLedger::new(Arc::new(MemoryLedgerStore::new()));

        let last = ledger.append(&s, request("c0", None)).await.unwrap();
        assert_eq!(last.index, u64::MAX);

        let err = ledger.append(&s, request("c1", None)).await.unwrap_err();
        assert!(matches!(err, FairnessError::SequenceExhausted { index: u64::MAX, .. }));
        assert!(!err.breaks_chain());
    }

    #[tokio::test]
    async fn test_restart_continues_chain() {
        let dir = std::env::temp_dir().join(format!("spinproof-chain-{}", uuid::Uuid::new_v4()));
        let s = session(0, None);

        let first = {
            let ledger = HashChainLedger::new(Arc::new(FileLedgerStore::open(&dir).await.unwrap()));
            ledger.append(&s, request("c0", None)).await.unwrap()
        };

        let ledger = HashChainLedger::new(Arc::new(FileLedgerStore::open(&dir).await.unwrap()));
        let second = ledger.append(&s, request("c1", Some(1))).await.unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.prev_hash, first.hash);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
