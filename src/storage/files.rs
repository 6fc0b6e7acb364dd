use chrono::{DateTime, Utc};
use redb::{ReadableTable, Table};

use super::db::{Database, DatabaseError};
use super::models::{FileRecord, SyncStatus};
use super::index::{index_add, index_get, index_remove};
use super::tables::*;
use crate::object_store::PresignedUrl;

impl Database {
    // ========================================================================
    // File operations
    // ========================================================================

    /// Store a file record and update the owner and pending indexes
    pub fn put_file(&self, file: &FileRecord) -> Result<(), DatabaseError> {
        debug_assert!(!file.id.is_empty(), "file id must not be empty");
        debug_assert!(!file.owner_id.is_empty(), "owner id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(FILES)?;
            let data = rmp_serde::to_vec_named(file)?;
            table.insert(file.id.as_str(), data.as_slice())?;

            let mut owner_table = write_txn.open_table(OWNER_FILES)?;
            index_add(&mut owner_table, &file.owner_id, &file.id)?;

            let mut pending_table = write_txn.open_table(PENDING_FILES)?;
            sync_pending_index(&mut pending_table, file)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a file by its UUID
    pub fn get_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(id)? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// All files of one owner, newest first
    pub fn list_files_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let owner_table = read_txn.open_table(OWNER_FILES)?;
        let files_table = read_txn.open_table(FILES)?;

        let file_ids = index_get(&owner_table, owner_id)?;

        let mut files = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            if let Some(data) = files_table.get(file_id.as_str())? {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                files.push(file);
            }
        }

        files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(files)
    }

    /// Get all files
    pub fn get_all_files(&self) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let mut files = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let file: FileRecord = rmp_serde::from_slice(value.value())?;
            files.push(file);
        }

        Ok(files)
    }

    /// Pending files never attempted, or last attempted at or before `cutoff`
    pub fn due_for_sync(&self, cutoff: DateTime<Utc>) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let pending_table = read_txn.open_table(PENDING_FILES)?;
        let files_table = read_txn.open_table(FILES)?;

        let mut due = Vec::new();
        for result in pending_table.iter()? {
            let (key, _) = result?;
            if let Some(data) = files_table.get(key.value())? {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                if file.is_due(cutoff) {
                    due.push(file);
                }
            }
        }

        Ok(due)
    }

    /// Delete a file by its UUID, returning the removed record
    pub fn delete_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;

        let removed = {
            let mut table = write_txn.open_table(FILES)?;
            let removed = match table.remove(id)? {
                Some(data) => Some(rmp_serde::from_slice::<FileRecord>(data.value())?),
                None => None,
            };
            removed
        };

        if let Some(ref file) = removed {
            let mut owner_table = write_txn.open_table(OWNER_FILES)?;
            index_remove(&mut owner_table, &file.owner_id, id)?;

            let mut pending_table = write_txn.open_table(PENDING_FILES)?;
            pending_table.remove(id)?;
        }

        write_txn.commit()?;
        Ok(removed)
    }

    // ========================================================================
    // Sync state transitions
    // ========================================================================

    /// pending -> synced. Returns `None` if the record is gone or no longer pending.
    pub fn mark_synced(
        &self,
        id: &str,
        remote_key: &str,
        remote_ref: &PresignedUrl,
        attempted_at: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        self.modify_file(id, attempted_at, |file| {
            if file.sync_status != SyncStatus::Pending {
                return false;
            }
            file.sync_status = SyncStatus::Synced;
            file.remote_key = Some(remote_key.to_string());
            file.remote_ref = Some(remote_ref.clone());
            file.last_sync_attempt = Some(attempted_at);
            file.sync_attempts += 1;
            file.last_sync_error = None;
            true
        })
    }

    /// pending -> failed. The local key is left untouched.
    pub fn mark_failed(
        &self,
        id: &str,
        attempted_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        self.modify_file(id, attempted_at, |file| {
            if file.sync_status != SyncStatus::Pending {
                return false;
            }
            file.sync_status = SyncStatus::Failed;
            file.last_sync_attempt = Some(attempted_at);
            file.sync_attempts += 1;
            file.last_sync_error = Some(error.to_string());
            true
        })
    }

    /// failed|pending -> pending with the attempt timestamp cleared.
    /// Synced records are left alone and yield `None`.
    pub fn reset_for_resync(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        self.modify_file(id, now, |file| {
            if file.sync_status == SyncStatus::Synced {
                return false;
            }
            file.sync_status = SyncStatus::Pending;
            file.last_sync_attempt = None;
            true
        })
    }

    /// Replace the cached presigned URL of a synced record.
    pub fn set_remote_ref(
        &self,
        id: &str,
        remote_ref: &PresignedUrl,
        now: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        self.modify_file(id, now, |file| {
            if !file.is_synced() {
                return false;
            }
            file.remote_ref = Some(remote_ref.clone());
            true
        })
    }

    /// Forget the local locator of a synced record once its bytes are reclaimed.
    pub fn clear_local_key(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        self.modify_file(id, now, |file| {
            if !file.is_synced() || file.local_key.is_none() {
                return false;
            }
            file.local_key = None;
            true
        })
    }

    /// Read-modify-write one record inside a single write transaction.
    /// `apply` returns false to leave the record unchanged; otherwise
    /// `updated_at` becomes `now`.
    fn modify_file<F>(
        &self,
        id: &str,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Option<FileRecord>, DatabaseError>
    where
        F: FnOnce(&mut FileRecord) -> bool,
    {
        let write_txn = self.begin_write()?;

        let existing = {
            let table = write_txn.open_table(FILES)?;
            let result = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice::<FileRecord>(data.value())?),
                None => None,
            };
            result
        };

        let updated = match existing {
            Some(mut file) => {
                if apply(&mut file) {
                    file.updated_at = now;

                    let serialized = rmp_serde::to_vec_named(&file)?;
                    let mut table = write_txn.open_table(FILES)?;
                    table.insert(id, serialized.as_slice())?;

                    let mut pending_table = write_txn.open_table(PENDING_FILES)?;
                    sync_pending_index(&mut pending_table, &file)?;
                    Some(file)
                } else {
                    None
                }
            }
            None => None,
        };

        write_txn.commit()?;
        Ok(updated)
    }
}

fn sync_pending_index(
    table: &mut Table<'_, &'static str, ()>,
    file: &FileRecord,
) -> Result<(), DatabaseError> {
    if file.sync_status == SyncStatus::Pending {
        table.insert(file.id.as_str(), ())?;
    } else {
        table.remove(file.id.as_str())?;
    }
    Ok(())
}
