//! Ledger Storage
//!
//! Index-addressed, append-only log of spin records per session. Appends are
//! compare-and-append on the log length, so two writers racing for the same
//! index cannot both succeed. Chain correctness depends only on
//! `SpinRecord::index`, never on storage-assigned identifiers.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::ledger::record::SpinRecord;
use crate::session::state::SessionId;

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization error.
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// Log length changed since the caller read it.
    #[error("append conflict: expected length {expected}, found {actual}")]
    Conflict {
        /// Length the caller expected.
        expected: u64,
        /// Length found.
        actual: u64,
    },

    /// A write-once record already exists with different contents.
    #[error("record for session {session} already written")]
    AlreadyWritten {
        /// Session.
        session: SessionId,
    },

    /// Persisted log is unreadable.
    #[error("corrupt log for session {session}: {reason}")]
    Corrupt {
        /// Session.
        session: SessionId,
        /// What is wrong.
        reason: String,
    },
}

/// Durable spin-record log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append `record` if the session's log currently holds `expected_len` records.
    async fn append(&self, record: SpinRecord, expected_len: u64) -> Result<(), StoreError>;

    /// Number of records in the session's log.
    async fn len(&self, session: &SessionId) -> Result<u64, StoreError>;

    /// Most recent record.
    async fn last(&self, session: &SessionId) -> Result<Option<SpinRecord>, StoreError>;

    /// Record with the given sequence index.
    async fn get(&self, session: &SessionId, index: u64) -> Result<Option<SpinRecord>, StoreError>;

    /// All records in append order.
    async fn records(&self, session: &SessionId) -> Result<Vec<SpinRecord>, StoreError>;
}

/// Locate `index` in a contiguous run of records.
fn find_index(records: &[SpinRecord], index: u64) -> Option<&SpinRecord> {
    let first = records.first()?.index;
    let offset = usize::try_from(index.checked_sub(first)?).ok()?;
    records.get(offset).filter(|r| r.index == index)
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Process-local store.
#[derive(Default)]
pub struct MemoryLedgerStore {
    logs: RwLock<BTreeMap<SessionId, Vec<SpinRecord>>>,
}

impl MemoryLedgerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored record in place. Simulates storage tampering.
    #[cfg(test)]
    pub(crate) async fn tamper<F: FnOnce(&mut SpinRecord)>(&self, session: &SessionId, index: u64, f: F) {
        let mut logs = self.logs.write().await;
        if let Some(record) = logs.get_mut(session).and_then(|v| v.iter_mut().find(|r| r.index == index)) {
            f(record);
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, record: SpinRecord, expected_len: u64) -> Result<(), StoreError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(record.session_id).or_default();
        let actual = log.len() as u64;
        if actual != expected_len {
            return Err(StoreError::Conflict { expected: expected_len, actual });
        }
        log.push(record);
        Ok(())
    }

    async fn len(&self, session: &SessionId) -> Result<u64, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.get(session).map_or(0, |v| v.len() as u64))
    }

    async fn last(&self, session: &SessionId) -> Result<Option<SpinRecord>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.get(session).and_then(|v| v.last().cloned()))
    }

    async fn get(&self, session: &SessionId, index: u64) -> Result<Option<SpinRecord>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.get(session).and_then(|v| find_index(v, index).cloned()))
    }

    async fn records(&self, session: &SessionId) -> Result<Vec<SpinRecord>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.get(session).cloned().unwrap_or_default())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// One JSON-lines file per session, fsynced after every append.
///
/// Each session keeps a cached tail (record count, byte offset of the last
/// complete line, last record) behind its own lock, so appends to different
/// sessions never wait on each other. The cache is checked against the file
/// length before use and rebuilt from disk when they disagree, so a fresh
/// instance (or another writer) over the same directory continues exactly
/// the chain on disk. A torn final line (crash mid-write) is ignored on read
/// and truncated by the next append.
pub struct FileLedgerStore {
    dir: PathBuf,
    tails: RwLock<BTreeMap<SessionId, Arc<Mutex<TailCache>>>>,
}

/// Cached view of the end of one session file.
#[derive(Default)]
struct TailCache {
    loaded: bool,
    /// File length when the cache was last brought in line with disk.
    file_len: u64,
    /// Byte length of the complete lines.
    valid_len: u64,
    /// Complete records in the file.
    len: u64,
    last: Option<SpinRecord>,
}

/// Parsed log plus the byte lengths it was parsed from.
struct LoadedLog {
    records: Vec<SpinRecord>,
    valid_len: u64,
    file_len: u64,
}

impl FileLedgerStore {
    /// Open (and create) a ledger directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, tails: RwLock::new(BTreeMap::new()) })
    }

    fn path_for(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session))
    }

    async fn tail_slot(&self, session: &SessionId) -> Arc<Mutex<TailCache>> {
        if let Some(slot) = self.tails.read().await.get(session) {
            return slot.clone();
        }
        self.tails.write().await.entry(*session).or_default().clone()
    }

    async fn file_len(&self, session: &SessionId) -> Result<u64, StoreError> {
        match tokio::fs::metadata(self.path_for(session)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild `tail` from disk unless it still matches the file length.
    async fn refresh(&self, session: &SessionId, tail: &mut TailCache) -> Result<(), StoreError> {
        if tail.loaded && tail.file_len == self.file_len(session).await? {
            return Ok(());
        }

        let loaded = self.load(session).await?;
        *tail = TailCache {
            loaded: true,
            file_len: loaded.file_len,
            valid_len: loaded.valid_len,
            len: loaded.records.len() as u64,
            last: loaded.records.into_iter().last(),
        };
        debug!(session = %session, records = tail.len, bytes = tail.file_len, "ledger tail loaded");
        Ok(())
    }

    async fn load(&self, session: &SessionId) -> Result<LoadedLog, StoreError> {
        let raw = match tokio::fs::read_to_string(self.path_for(session)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadedLog { records: Vec::new(), valid_len: 0, file_len: 0 });
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut valid_len = 0u64;
        let mut rest = raw.as_str();
        while !rest.is_empty() {
            // Only a line without its newline can be a torn write.
            let Some(end) = rest.find('\n') else {
                warn!(session = %session, bytes = rest.len(), "ignoring torn ledger tail");
                break;
            };
            let line = &rest[..end];
            if !line.trim().is_empty() {
                let record: SpinRecord = serde_json::from_str(line)?;
                if record.session_id != *session {
                    return Err(StoreError::Corrupt {
                        session: *session,
                        reason: format!("record {} belongs to {}", record.index, record.session_id),
                    });
                }
                records.push(record);
            }
            valid_len += end as u64 + 1;
            rest = &rest[end + 1..];
        }

        Ok(LoadedLog { records, valid_len, file_len: raw.len() as u64 })
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn append(&self, record: SpinRecord, expected_len: u64) -> Result<(), StoreError> {
        let slot = self.tail_slot(&record.session_id).await;
        let mut tail = slot.lock().await;
        self.refresh(&record.session_id, &mut tail).await?;

        if tail.len != expected_len {
            return Err(StoreError::Conflict { expected: expected_len, actual: tail.len });
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.path_for(&record.session_id))
            .await?;
        if tail.file_len != tail.valid_len {
            warn!(session = %record.session_id, bytes = tail.file_len.saturating_sub(tail.valid_len), "truncating torn ledger tail");
            file.set_len(tail.valid_len).await?;
        }
        file.seek(SeekFrom::Start(tail.valid_len)).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;

        tail.valid_len += line.len() as u64;
        tail.file_len = tail.valid_len;
        tail.len += 1;
        debug!(session = %record.session_id, index = record.index, "ledger record persisted");
        tail.last = Some(record);
        Ok(())
    }

    async fn len(&self, session: &SessionId) -> Result<u64, StoreError> {
        let slot = self.tail_slot(session).await;
        let mut tail = slot.lock().await;
        self.refresh(session, &mut tail).await?;
        Ok(tail.len)
    }

    async fn last(&self, session: &SessionId) -> Result<Option<SpinRecord>, StoreError> {
        let slot = self.tail_slot(session).await;
        let mut tail = slot.lock().await;
        self.refresh(session, &mut tail).await?;
        Ok(tail.last.clone())
    }

    async fn get(&self, session: &SessionId, index: u64) -> Result<Option<SpinRecord>, StoreError> {
        let slot = self.tail_slot(session).await;
        let mut tail = slot.lock().await;
        self.refresh(session, &mut tail).await?;
        if let Some(last) = tail.last.as_ref().filter(|r| r.index == index) {
            return Ok(Some(last.clone()));
        }
        let loaded = self.load(session).await?;
        Ok(find_index(&loaded.records, index).cloned())
    }

    async fn records(&self, session: &SessionId) -> Result<Vec<SpinRecord>, StoreError> {
        let slot = self.tail_slot(session).await;
        let _tail = slot.lock().await;
        Ok(self.load(session).await?.records)
    }
}
