use std::sync::Arc;

use bytes::Bytes;

use crate::clock::Clock;
use crate::error::FileError;
use crate::ingest::{Ingest, IngestMode, IngestRequest};
use crate::object_store::{ObjectStore, ObjectStoreError, PRESIGN_TTL};
use crate::storage::models::FileRecord;
use crate::storage::Database;

/// Presigned URLs this close to expiry are re-derived before being handed out.
fn refresh_margin() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

/// Owner-scoped file operations on top of the ingest pipeline.
pub struct FileService {
    db: Database,
    ingest: Arc<Ingest>,
    clock: Arc<dyn Clock>,
}

impl FileService {
    pub fn new(db: Database, ingest: Arc<Ingest>, clock: Arc<dyn Clock>) -> Self {
        Self { db, ingest, clock }
    }

    pub fn ingest(&self) -> &Arc<Ingest> {
        &self.ingest
    }

    pub async fn upload(
        &self,
        request: IngestRequest,
        mode: IngestMode,
    ) -> Result<FileRecord, FileError> {
        self.ingest.ingest(request, mode).await
    }

    /// All files of `owner_id`, newest first, with fresh remote URLs.
    pub async fn list_files(&self, owner_id: &str) -> Result<Vec<FileRecord>, FileError> {
        let files = self.db.list_files_by_owner(owner_id)?;
        let mut refreshed = Vec::with_capacity(files.len());
        for file in files {
            refreshed.push(self.refresh_remote_ref(file).await);
        }
        Ok(refreshed)
    }

    pub async fn get_file(&self, owner_id: &str, id: &str) -> Result<FileRecord, FileError> {
        let file = self.owned_file(owner_id, id)?;
        Ok(self.refresh_remote_ref(file).await)
    }

    /// The file's bytes, read from whichever backend is authoritative.
    pub async fn read_content(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<(FileRecord, Bytes), FileError> {
        let file = self.owned_file(owner_id, id)?;

        let data = match (file.remote_key.as_deref(), file.local_key.as_deref()) {
            (Some(remote_key), local_key) if file.is_synced() => {
                match self.ingest.remote().get(remote_key).await {
                    Ok(data) => data,
                    Err(e) => match local_key {
                        Some(local_key) => {
                            tracing::debug!(file_id = %id, error = %e, "Remote read failed, serving local copy");
                            self.ingest.local().get(local_key).await?
                        }
                        None => return Err(e.into()),
                    },
                }
            }
            (_, Some(local_key)) => self.ingest.local().get(local_key).await?,
            _ => {
                return Err(FileError::Storage(ObjectStoreError::NotFound(format!(
                    "no stored copy of file {id}"
                ))))
            }
        };

        Ok((file, data))
    }

    /// Remove the file's bytes from every backend holding them, then its record.
    /// Backend cleanup is best-effort; the record is removed regardless.
    pub async fn delete_file(&self, owner_id: &str, id: &str) -> Result<FileRecord, FileError> {
        let file = self.owned_file(owner_id, id)?;
        self.delete_owned(file).await
    }

    async fn delete_owned(&self, file: FileRecord) -> Result<FileRecord, FileError> {
        let id = file.id.as_str();
        self.delete_copies(&file, file.local_key.as_deref(), file.remote_key.as_deref())
            .await;

        let removed = self
            .db
            .delete_file(id)?
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;

        // A pass may have synced or reclaimed the file while the copies above
        // were being deleted. The removed record holds the final locators.
        let late_local = removed
            .local_key
            .as_deref()
            .filter(|k| file.local_key.as_deref() != Some(*k));
        let late_remote = removed
            .remote_key
            .as_deref()
            .filter(|k| file.remote_key.as_deref() != Some(*k));
        self.delete_copies(&removed, late_local, late_remote).await;

        tracing::debug!(file_id = %id, "Deleted file");
        Ok(removed)
    }

    async fn delete_copies(
        &self,
        file: &FileRecord,
        local_key: Option<&str>,
        remote_key: Option<&str>,
    ) {
        if let Some(local_key) = local_key {
            if let Err(e) = self.ingest.local().delete(local_key).await {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to delete local copy");
            }
        }
        if let Some(remote_key) = remote_key {
            if let Err(e) = self.ingest.remote().delete(remote_key).await {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to delete remote copy");
            }
        }
    }

    /// Put a failed (or stuck pending) file back in line for the next pass.
    /// Synced files are returned unchanged.
    pub async fn request_resync(&self, owner_id: &str, id: &str) -> Result<FileRecord, FileError> {
        let file = self.owned_file(owner_id, id)?;

        match self.db.reset_for_resync(id, self.clock.now())? {
            Some(reset) => {
                tracing::info!(file_id = %id, previous = %file.sync_status.as_str(), "Resync requested");
                Ok(reset)
            }
            None => Ok(file),
        }
    }

    fn owned_file(&self, owner_id: &str, id: &str) -> Result<FileRecord, FileError> {
        match self.db.get_file(id)? {
            Some(file) if file.owner_id == owner_id => Ok(file),
            _ => Err(FileError::NotFound(id.to_string())),
        }
    }

    /// Re-derive an expired presigned URL. Failures leave the old one in place.
    async fn refresh_remote_ref(&self, file: FileRecord) -> FileRecord {
        let (Some(remote_key), Some(remote_ref)) = (file.remote_key.as_deref(), &file.remote_ref)
        else {
            return file;
        };
        if !file.is_synced() || !remote_ref.is_expired(self.clock.now(), refresh_margin()) {
            return file;
        }

        let fresh = match self.ingest.remote().presign(remote_key, PRESIGN_TTL).await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to refresh presigned URL");
                return file;
            }
        };

        match self.db.set_remote_ref(&file.id, &fresh, self.clock.now()) {
            Ok(Some(updated)) => updated,
            Ok(None) => file,
            Err(e) => {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to store refreshed presigned URL");
                let mut file = file;
                file.remote_ref = Some(fresh);
                file
            }
        }
    }
}
