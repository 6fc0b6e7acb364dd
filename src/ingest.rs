//! Ingest pipeline: write the bytes to the backend the mode selects, then
//! record the metadata. A record is only ever created for bytes that are
//! already durable.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::FileError;
use crate::object_store::{
    KeyGenerator, LocalStore, ObjectStore, ObjectStoreError, PresignedUrl, RemoteStore,
    PRESIGN_TTL,
};
use crate::storage::models::{FileCategory, FileRecord, SyncStatus};
use crate::storage::Database;

const MAX_NAME_BYTES: usize = 255;
const FALLBACK_MIME: &str = "application/octet-stream";

/// Which backend a new file is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Straight to the remote store; the record is created synced.
    #[default]
    Online,
    /// Staged on the local store; the record is created pending.
    Offline,
}

impl FromStr for IngestMode {
    type Err = FileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(IngestMode::Online),
            "offline" => Ok(IngestMode::Offline),
            other => Err(FileError::validation(format!(
                "mode must be 'online' or 'offline', got '{other}'"
            ))),
        }
    }
}

/// A new file as handed to the pipeline.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub data: Bytes,
    pub original_name: String,
    /// Declared MIME type; guessed from the name when absent or generic.
    pub mime_type: Option<String>,
    pub owner_id: String,
}

pub struct Ingest {
    db: Database,
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    keys: KeyGenerator,
    clock: Arc<dyn Clock>,
    max_upload_size: u64,
}

impl Ingest {
    pub fn new(
        db: Database,
        local: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        max_upload_size: u64,
    ) -> Self {
        Self {
            db,
            local,
            remote,
            keys: KeyGenerator::new(Arc::clone(&clock)),
            clock,
            max_upload_size,
        }
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Write a new file and create its record.
    ///
    /// On any error no record exists afterwards.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        mode: IngestMode,
    ) -> Result<FileRecord, FileError> {
        let owner_id = validate_owner(&request.owner_id)?;
        let original_name = validate_name(&request.original_name)?;
        if request.data.is_empty() {
            return Err(FileError::validation("file must not be empty"));
        }
        if request.data.len() as u64 > self.max_upload_size {
            return Err(FileError::validation(format!(
                "file exceeds maximum upload size of {} bytes",
                self.max_upload_size
            )));
        }
        let mime_type = resolve_mime(request.mime_type.as_deref(), &original_name);

        let now = self.clock.now();
        let mut record = FileRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            category: FileCategory::from_mime(&mime_type),
            original_name,
            mime_type,
            size: request.data.len() as u64,
            local_key: None,
            remote_key: None,
            remote_ref: None,
            sync_status: SyncStatus::Pending,
            last_sync_attempt: None,
            sync_attempts: 0,
            last_sync_error: None,
            created_at: now,
            updated_at: now,
        };

        // Phase 1: bytes
        match mode {
            IngestMode::Offline => {
                let key = self.keys.local_key(&record.original_name);
                self.local
                    .put(&key, request.data, &record.mime_type)
                    .await?;
                record.local_key = Some(key);
            }
            IngestMode::Online => {
                let (key, remote_ref) = self
                    .write_remote(owner_id, &record.original_name, request.data, &record.mime_type)
                    .await?;
                record.remote_key = Some(key);
                record.remote_ref = Some(remote_ref);
                record.sync_status = SyncStatus::Synced;
            }
        }

        // Phase 2: metadata
        if let Err(e) = self.db.put_file(&record) {
            self.discard_bytes(&record, mode).await;
            return Err(e.into());
        }

        tracing::debug!(
            file_id = %record.id,
            owner_id = %record.owner_id,
            mode = ?mode,
            size = record.size,
            "Ingested file"
        );
        Ok(record)
    }

    /// Copy a staged file's local bytes to the remote store.
    ///
    /// Returns the record in its synced shape without persisting it; the
    /// caller owns the state transition.
    pub async fn ingest_from_local_handle(
        &self,
        record: &FileRecord,
    ) -> Result<FileRecord, FileError> {
        let local_key = record.local_key.as_deref().ok_or_else(|| {
            FileError::validation(format!("file {} has no local copy", record.id))
        })?;

        let data = self.local.get(local_key).await?;
        let (remote_key, remote_ref) = self
            .write_remote(&record.owner_id, &record.original_name, data, &record.mime_type)
            .await?;

        let mut synced = record.clone();
        synced.remote_key = Some(remote_key);
        synced.remote_ref = Some(remote_ref);
        synced.sync_status = SyncStatus::Synced;
        synced.last_sync_error = None;
        Ok(synced)
    }

    /// Best-effort removal of bytes whose record could not be written.
    async fn discard_bytes(&self, record: &FileRecord, mode: IngestMode) {
        let result = match (mode, record.storage_key()) {
            (IngestMode::Offline, Some(key)) => self.local.delete(key).await,
            (IngestMode::Online, Some(key)) => self.remote.delete(key).await,
            (_, None) => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(file_id = %record.id, error = %e, "Failed to remove bytes of unrecorded upload");
        }
    }

    /// Put to the remote store and presign the new key. A presign failure
    /// removes the object again so nothing is left unreferenced.
    async fn write_remote(
        &self,
        owner_id: &str,
        original_name: &str,
        data: Bytes,
        mime_type: &str,
    ) -> Result<(String, PresignedUrl), ObjectStoreError> {
        let key = self.keys.remote_key(owner_id, original_name);
        self.remote.put(&key, data, mime_type).await?;

        match self.remote.presign(&key, PRESIGN_TTL).await {
            Ok(remote_ref) => Ok((key, remote_ref)),
            Err(e) => {
                if let Err(cleanup) = self.remote.delete(&key).await {
                    tracing::warn!(key = %key, error = %cleanup, "Failed to remove unsigned remote object");
                }
                Err(e)
            }
        }
    }
}

fn validate_owner(owner_id: &str) -> Result<&str, FileError> {
    let owner_id = owner_id.trim();
    if owner_id.is_empty() {
        return Err(FileError::validation("owner id must not be empty"));
    }
    if owner_id.contains('/') || owner_id.contains('\\') {
        return Err(FileError::validation(
            "owner id must not contain path separators",
        ));
    }
    Ok(owner_id)
}

fn validate_name(original_name: &str) -> Result<String, FileError> {
    let name = original_name.trim();
    if name.is_empty() {
        return Err(FileError::validation("file name must not be empty"));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(FileError::validation(format!(
            "file name '{name}' is not a plain file name"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(FileError::validation(
            "file name must not contain control characters",
        ));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(FileError::validation(format!(
            "file name exceeds {MAX_NAME_BYTES} bytes"
        )));
    }
    Ok(name.to_string())
}

/// Declared MIME type, or a guess from the file name, or the generic fallback.
pub fn resolve_mime(declared: Option<&str>, original_name: &str) -> String {
    declared
        .map(str::trim)
        .filter(|ct| !ct.is_empty() && *ct != FALLBACK_MIME)
        .map(|ct| ct.to_string())
        .or_else(|| {
            mime_guess::from_path(original_name)
                .first()
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("online".parse::<IngestMode>().unwrap(), IngestMode::Online);
        assert_eq!(" Offline ".parse::<IngestMode>().unwrap(), IngestMode::Offline);
        assert!(matches!(
            "later".parse::<IngestMode>(),
            Err(FileError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  report.pdf ").unwrap(), "report.pdf");
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b.txt").is_err());
        assert!(validate_name("a\\b.txt").is_err());
        assert!(validate_name("bad\nname").is_err());
        assert!(validate_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_validate_owner() {
        assert_eq!(validate_owner("user-1").unwrap(), "user-1");
        assert!(validate_owner(" ").is_err());
        assert!(validate_owner("a/b").is_err());
    }

    #[test]
    fn test_resolve_mime() {
        assert_eq!(resolve_mime(Some("image/png"), "x.bin"), "image/png");
        assert_eq!(resolve_mime(None, "notes.txt"), "text/plain");
        assert_eq!(
            resolve_mime(Some("application/octet-stream"), "slides.pdf"),
            "application/pdf"
        );
        assert_eq!(resolve_mime(Some(""), "no-extension"), FALLBACK_MIME);
    }
}
