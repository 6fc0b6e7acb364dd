//! Device-side offline queue.
//!
//! Files captured while disconnected are persisted in a local redb file,
//! indexed by owner and by status, and later drained into an
//! [`UploadSink`]. Nothing here touches the network except the sink.

mod upload;

pub use upload::{HttpUploader, PendingUpload, UploadError, UploadSink};

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use redb::{Database as RedbDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::ingest::resolve_mime;
use crate::storage::index::{index_add, index_get, index_remove};
use crate::storage::models::SyncStatus;
use crate::storage::DatabaseError;

/// Queue entries: id -> QueuedFile (msgpack)
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_entries");

/// Captured bytes: id -> raw payload. Dropped once the entry is synced.
const PAYLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_payloads");

/// Owner index: owner_id -> msgpack Vec of entry ids
const OWNER_ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_owner_entries");

/// Status index: status -> msgpack Vec of entry ids
const STATUS_ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_status_entries");

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Queue entry not found: {0}")]
    NotFound(String),
    #[error("Queue storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Route redb and codec errors through `DatabaseError` so `?` works here.
macro_rules! via_database_error {
    ($($ty:ty),*) => {
        $(impl From<$ty> for QueueError {
            fn from(e: $ty) -> Self {
                QueueError::Database(DatabaseError::from(e))
            }
        })*
    };
}

via_database_error!(
    redb::CommitError,
    redb::DatabaseError,
    redb::StorageError,
    redb::TableError,
    redb::TransactionError,
    rmp_serde::encode::Error,
    rmp_serde::decode::Error,
    std::io::Error
);

/// Descriptive metadata captured with the bytes.
#[derive(Debug, Clone)]
pub struct QueueMetadata {
    pub original_name: String,
    pub mime_type: Option<String>,
}

/// One buffered file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedFile {
    pub id: String,
    pub owner_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Server-side file id, once uploaded.
    #[serde(default)]
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DrainOutcome {
    Synced { file_id: String },
    Failed { error: String },
    /// Uploaded as `file_id`, but the entry could not be marked synced.
    /// Left outstanding, it would be uploaded again.
    Unrecorded { file_id: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DrainedEntry {
    pub entry_id: String,
    #[serde(flatten)]
    pub outcome: DrainOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub entries: Vec<DrainedEntry>,
}

impl DrainReport {
    pub fn synced(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, DrainOutcome::Synced { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, DrainOutcome::Failed { .. }))
            .count()
    }

    pub fn unrecorded(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, DrainOutcome::Unrecorded { .. }))
            .count()
    }
}

pub struct OfflineQueue {
    db: Arc<RedbDatabase>,
    clock: Arc<dyn Clock>,
    drain_lock: Mutex<()>,
}

impl OfflineQueue {
    /// Open or create the queue file inside `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, QueueError> {
        Self::open_with_clock(dir, Arc::new(SystemClock))
    }

    pub fn open_with_clock<P: AsRef<Path>>(
        dir: P,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let db = RedbDatabase::create(dir.as_ref().join("offline-queue.redb"))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTRIES)?;
            let _ = write_txn.open_table(PAYLOADS)?;
            let _ = write_txn.open_table(OWNER_ENTRIES)?;
            let _ = write_txn.open_table(STATUS_ENTRIES)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            clock,
            drain_lock: Mutex::new(()),
        })
    }

    /// Buffer a file for later upload. Returns the entry id.
    pub fn enqueue(
        &self,
        data: Bytes,
        metadata: QueueMetadata,
        owner_id: &str,
    ) -> Result<String, QueueError> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(QueueError::Validation("owner id must not be empty".into()));
        }
        let original_name = metadata.original_name.trim();
        if original_name.is_empty() {
            return Err(QueueError::Validation("file name must not be empty".into()));
        }
        if data.is_empty() {
            return Err(QueueError::Validation("file must not be empty".into()));
        }

        let entry = QueuedFile {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            original_name: original_name.to_string(),
            mime_type: resolve_mime(metadata.mime_type.as_deref(), original_name),
            size: data.len() as u64,
            sync_status: SyncStatus::Pending,
            created_at: self.clock.now(),
            last_attempt: None,
            last_error: None,
            file_id: None,
        };

        let write_txn = self.db.begin_write()?;
        {
            let mut payloads = write_txn.open_table(PAYLOADS)?;
            payloads.insert(entry.id.as_str(), data.as_ref())?;

            let mut entries = write_txn.open_table(ENTRIES)?;
            let encoded = rmp_serde::to_vec_named(&entry)?;
            entries.insert(entry.id.as_str(), encoded.as_slice())?;

            let mut owners = write_txn.open_table(OWNER_ENTRIES)?;
            index_add(&mut owners, &entry.owner_id, &entry.id)?;

            let mut statuses = write_txn.open_table(STATUS_ENTRIES)?;
            index_add(&mut statuses, entry.sync_status.as_str(), &entry.id)?;
        }
        write_txn.commit()?;

        tracing::debug!(entry_id = %entry.id, owner_id = %entry.owner_id, size = entry.size, "Queued file");
        Ok(entry.id)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedFile>, QueueError> {
        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(ENTRIES)?;
        let entry = match entries.get(id)? {
            Some(data) => Some(rmp_serde::from_slice(data.value())?),
            None => None,
        };
        Ok(entry)
    }

    /// The buffered bytes of an entry; `None` once it has synced.
    pub fn payload(&self, id: &str) -> Result<Option<Bytes>, QueueError> {
        let read_txn = self.db.begin_read()?;
        let payloads = read_txn.open_table(PAYLOADS)?;
        let payload = payloads
            .get(id)?
            .map(|data| Bytes::copy_from_slice(data.value()));
        Ok(payload)
    }

    /// All entries of an owner, oldest first.
    pub fn list(&self, owner_id: &str) -> Result<Vec<QueuedFile>, QueueError> {
        let read_txn = self.db.begin_read()?;
        let owners = read_txn.open_table(OWNER_ENTRIES)?;
        let entries = read_txn.open_table(ENTRIES)?;

        let mut list = Vec::new();
        for id in index_get(&owners, owner_id)? {
            if let Some(data) = entries.get(id.as_str())? {
                list.push(rmp_serde::from_slice::<QueuedFile>(data.value())?);
            }
        }
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    /// Entries of an owner still waiting to go out: pending or failed.
    pub fn outstanding(&self, owner_id: &str) -> Result<Vec<QueuedFile>, QueueError> {
        let read_txn = self.db.begin_read()?;
        let statuses = read_txn.open_table(STATUS_ENTRIES)?;
        let entries = read_txn.open_table(ENTRIES)?;

        let mut list = Vec::new();
        for status in [SyncStatus::Pending, SyncStatus::Failed] {
            for id in index_get(&statuses, status.as_str())? {
                if let Some(data) = entries.get(id.as_str())? {
                    let entry: QueuedFile = rmp_serde::from_slice(data.value())?;
                    if entry.owner_id == owner_id {
                        list.push(entry);
                    }
                }
            }
        }
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    /// Remove an entry and its payload. Returns false if it did not exist.
    pub fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut entries = write_txn.open_table(ENTRIES)?;
            let removed = match entries.remove(id)? {
                Some(data) => Some(rmp_serde::from_slice::<QueuedFile>(data.value())?),
                None => None,
            };
            removed
        };

        if let Some(ref entry) = removed {
            let mut payloads = write_txn.open_table(PAYLOADS)?;
            payloads.remove(id)?;

            let mut owners = write_txn.open_table(OWNER_ENTRIES)?;
            index_remove(&mut owners, &entry.owner_id, id)?;

            let mut statuses = write_txn.open_table(STATUS_ENTRIES)?;
            index_remove(&mut statuses, entry.sync_status.as_str(), id)?;
        }
        write_txn.commit()?;
        Ok(removed.is_some())
    }

    /// Forget every synced entry of an owner. Returns how many were removed.
    pub fn purge_synced(&self, owner_id: &str) -> Result<usize, QueueError> {
        let synced: Vec<String> = self
            .list(owner_id)?
            .into_iter()
            .filter(|e| e.sync_status == SyncStatus::Synced)
            .map(|e| e.id)
            .collect();

        let mut removed = 0;
        for id in synced {
            if self.remove(&id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Upload every outstanding entry of `owner_id` through `sink`.
    ///
    /// Entries are independent: a failed upload marks that entry failed and
    /// the drain moves on. Failed entries are retried by the next drain.
    /// Concurrent drains on the same queue run one after the other.
    pub async fn drain(
        &self,
        owner_id: &str,
        sink: &dyn UploadSink,
    ) -> Result<DrainReport, QueueError> {
        let _guard = self.drain_lock.lock().await;
        let outstanding = self.outstanding(owner_id)?;
        let mut report = DrainReport::default();

        for entry in outstanding {
            let outcome = self.drain_one(&entry, sink).await;
            report.entries.push(DrainedEntry {
                entry_id: entry.id,
                outcome,
            });
        }

        if !report.entries.is_empty() {
            tracing::info!(
                owner_id = %owner_id,
                synced = report.synced(),
                failed = report.failed(),
                unrecorded = report.unrecorded(),
                "Drained offline queue"
            );
        }
        Ok(report)
    }

    async fn drain_one(&self, entry: &QueuedFile, sink: &dyn UploadSink) -> DrainOutcome {
        let data = match self.payload(&entry.id) {
            Ok(Some(data)) => data,
            Ok(None) => return self.fail(entry, "buffered bytes are missing".to_string()),
            Err(e) => return self.fail(entry, e.to_string()),
        };

        let upload = PendingUpload {
            owner_id: entry.owner_id.clone(),
            original_name: entry.original_name.clone(),
            mime_type: entry.mime_type.clone(),
            data,
        };

        match sink.upload(upload).await {
            Ok(file_id) => match self.record_upload(&entry.id, &file_id) {
                Ok(()) => DrainOutcome::Synced { file_id },
                Err(e) => {
                    tracing::error!(
                        entry_id = %entry.id,
                        file_id = %file_id,
                        error = %e,
                        "Uploaded entry could not be marked synced"
                    );
                    DrainOutcome::Unrecorded {
                        file_id,
                        error: e.to_string(),
                    }
                }
            },
            Err(e) => self.fail(entry, e.to_string()),
        }
    }

    fn fail(&self, entry: &QueuedFile, error: String) -> DrainOutcome {
        tracing::warn!(entry_id = %entry.id, error = %error, "Failed to upload queued file");
        if let Err(e) = self.mark_failed(&entry.id, &error) {
            tracing::error!(entry_id = %entry.id, error = %e, "Failed to record queue failure");
        }
        DrainOutcome::Failed { error }
    }

    /// Mark an uploaded entry synced, retrying once on a storage error.
    fn record_upload(&self, id: &str, file_id: &str) -> Result<(), QueueError> {
        match self.mark_synced(id, file_id) {
            Err(QueueError::Database(e)) => {
                tracing::warn!(entry_id = %id, error = %e, "Retrying synced transition");
                self.mark_synced(id, file_id)
            }
            result => result,
        }
    }

    fn mark_synced(&self, id: &str, file_id: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        self.transition(id, |entry| {
            entry.sync_status = SyncStatus::Synced;
            entry.last_attempt = Some(now);
            entry.last_error = None;
            entry.file_id = Some(file_id.to_string());
        })
    }

    fn mark_failed(&self, id: &str, error: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        self.transition(id, |entry| {
            entry.sync_status = SyncStatus::Failed;
            entry.last_attempt = Some(now);
            entry.last_error = Some(error.to_string());
        })
    }

    /// Apply a status change, keeping the status index in step. A synced
    /// entry no longer needs its payload.
    fn transition<F>(&self, id: &str, apply: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut QueuedFile),
    {
        let write_txn = self.db.begin_write()?;
        {
            let existing = {
                let entries = write_txn.open_table(ENTRIES)?;
                let result = match entries.get(id)? {
                    Some(data) => rmp_serde::from_slice::<QueuedFile>(data.value())?,
                    None => return Err(QueueError::NotFound(id.to_string())),
                };
                result
            };

            let previous = existing.sync_status;
            let mut entry = existing;
            apply(&mut entry);

            let mut entries = write_txn.open_table(ENTRIES)?;
            let encoded = rmp_serde::to_vec_named(&entry)?;
            entries.insert(id, encoded.as_slice())?;

            if previous != entry.sync_status {
                let mut statuses = write_txn.open_table(STATUS_ENTRIES)?;
                index_remove(&mut statuses, previous.as_str(), id)?;
                index_add(&mut statuses, entry.sync_status.as_str(), id)?;
            }

            if entry.sync_status == SyncStatus::Synced {
                let mut payloads = write_txn.open_table(PAYLOADS)?;
                payloads.remove(id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drain whenever connectivity comes back. Drains once up front if
    /// already online; returns when the connectivity sender is dropped.
    pub async fn drain_on_reconnect(
        &self,
        owner_id: &str,
        sink: &dyn UploadSink,
        mut online: watch::Receiver<bool>,
    ) {
        loop {
            if *online.borrow_and_update() {
                match self.drain(owner_id, sink).await {
                    Ok(report) => {
                        tracing::debug!(entries = report.entries.len(), "Drain after reconnect finished")
                    }
                    Err(e) => tracing::warn!(error = %e, "Drain after reconnect failed"),
                }
            }

            // Wait for the next offline -> online edge.
            loop {
                if online.changed().await.is_err() {
                    return;
                }
                if *online.borrow_and_update() {
                    break;
                }
            }
        }
    }
}
