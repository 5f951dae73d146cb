//! Session Storage
//!
//! Durable home of session rows (server secret included) and the write-once
//! audit records. Together with the ledger store this is everything a
//! restarted process needs to continue or verify a chain.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ledger::store::StoreError;
use crate::session::state::{AuditRecord, SessionId, SessionRow};

/// Durable session registry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session row.
    async fn save(&self, row: &SessionRow) -> Result<(), StoreError>;

    /// Write the audit record of an ended session.
    ///
    /// Writing the same record again is a no-op; a different record for the
    /// same session fails with [`StoreError::AlreadyWritten`].
    async fn save_audit(&self, audit: &AuditRecord) -> Result<(), StoreError>;

    /// Every stored session row.
    async fn rows(&self) -> Result<Vec<SessionRow>, StoreError>;

    /// Every stored audit record.
    async fn audits(&self) -> Result<Vec<AuditRecord>, StoreError>;
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Process-local session store.
#[derive(Default)]
pub struct MemorySessionStore {
    rows: RwLock<BTreeMap<SessionId, SessionRow>>,
    audits: RwLock<BTreeMap<SessionId, AuditRecord>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, row: &SessionRow) -> Result<(), StoreError> {
        self.rows.write().await.insert(row.session_id, row.clone());
        Ok(())
    }

    async fn save_audit(&self, audit: &AuditRecord) -> Result<(), StoreError> {
        let mut audits = self.audits.write().await;
        match audits.get(&audit.session_id) {
            Some(existing) if existing == audit => Ok(()),
            Some(_) => Err(StoreError::AlreadyWritten { session: audit.session_id }),
            None => {
                audits.insert(audit.session_id, audit.clone());
                Ok(())
            }
        }
    }

    async fn rows(&self) -> Result<Vec<SessionRow>, StoreError> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn audits(&self) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(self.audits.read().await.values().cloned().collect())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

const ROW_SUFFIX: &str = ".session.json";
const AUDIT_SUFFIX: &str = ".audit.json";

/// One JSON file per session row and per audit record.
///
/// Rows are replaced atomically (temp file, fsync, rename). Audit records are
/// created exclusively and never rewritten.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Open (and create) a session directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn row_path(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{}{}", session, ROW_SUFFIX))
    }

    fn audit_path(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{}{}", session, AUDIT_SUFFIX))
    }

    async fn read_all<T: DeserializeOwned>(&self, suffix: &str) -> Result<Vec<T>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(suffix) {
                continue;
            }
            let raw = tokio::fs::read(entry.path()).await?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }
}

async fn write_synced(path: &Path, value: &impl Serialize, create_new: bool) -> Result<(), std::io::Error> {
    let bytes = serde_json::to_vec(value)?;
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true);
    if create_new {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    let mut file = options.open(path).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, row: &SessionRow) -> Result<(), StoreError> {
        let path = self.row_path(&row.session_id);
        let tmp = path.with_extension("json.tmp");
        write_synced(&tmp, row, false).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(session = %row.session_id, version = row.version, "session row persisted");
        Ok(())
    }

    async fn save_audit(&self, audit: &AuditRecord) -> Result<(), StoreError> {
        let path = self.audit_path(&audit.session_id);
        match write_synced(&path, audit, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing: AuditRecord = serde_json::from_slice(&tokio::fs::read(&path).await?)?;
                if existing == *audit {
                    Ok(())
                } else {
                    Err(StoreError::AlreadyWritten { session: audit.session_id })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn rows(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.read_all(ROW_SUFFIX).await
    }

    async fn audits(&self) -> Result<Vec<AuditRecord>, StoreError> {
        self.read_all(AUDIT_SUFFIX).await
    }
}
