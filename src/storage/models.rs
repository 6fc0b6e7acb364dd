use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object_store::PresignedUrl;

/// Classification of a file derived from its MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Audio,
    Document,
    Image,
    Other,
    Video,
}

impl FileCategory {
    /// Derive a category from a MIME type string. Never fails.
    pub fn from_mime(mime_type: &str) -> Self {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let (primary, sub) = essence.split_once('/').unwrap_or((essence.as_str(), ""));

        match primary {
            "audio" => FileCategory::Audio,
            "image" => FileCategory::Image,
            "video" => FileCategory::Video,
            "text" if sub == "plain" => FileCategory::Document,
            "application" => match sub {
                "pdf" | "msword" => FileCategory::Document,
                // Legacy Office types, including the macro-enabled variants
                _ if ["vnd.ms-excel", "vnd.ms-powerpoint", "vnd.ms-word"]
                    .iter()
                    .any(|prefix| sub.starts_with(prefix)) =>
                {
                    FileCategory::Document
                }
                _ if sub.starts_with("vnd.openxmlformats-officedocument.") => {
                    FileCategory::Document
                }
                _ => FileCategory::Other,
            },
            _ => FileCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Audio => "audio",
            FileCategory::Document => "document",
            FileCategory::Image => "image",
            FileCategory::Other => "other",
            FileCategory::Video => "video",
        }
    }
}

/// Where a file's bytes currently live, as far as the record store knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Only a local copy exists.
    Pending,
    /// The remote copy is confirmed durable.
    Synced,
    /// The latest reconciliation attempt errored; waits for a resync request.
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

/// A file record stored in redb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub owner_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub category: FileCategory,
    pub size: u64,

    /// Locator on the local backend; set while pending/failed.
    #[serde(default)]
    pub local_key: Option<String>,
    /// Locator on the remote backend; set once synced.
    #[serde(default)]
    pub remote_key: Option<String>,
    #[serde(default)]
    pub remote_ref: Option<PresignedUrl>,

    pub sync_status: SyncStatus,
    #[serde(default)]
    pub last_sync_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_attempts: u32,
    #[serde(default)]
    pub last_sync_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// The locator that is authoritative for the current sync status.
    pub fn storage_key(&self) -> Option<&str> {
        match self.sync_status {
            SyncStatus::Synced => self.remote_key.as_deref(),
            SyncStatus::Pending | SyncStatus::Failed => self.local_key.as_deref(),
        }
    }

    /// True once the record is synced and its remote copy confirmed.
    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced && self.remote_key.is_some()
    }

    /// Pending and either never attempted or last attempted at or before `cutoff`.
    pub fn is_due(&self, cutoff: DateTime<Utc>) -> bool {
        if self.sync_status != SyncStatus::Pending {
            return false;
        }
        match self.last_sync_attempt {
            None => true,
            Some(attempted_at) => attempted_at <= cutoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn pending(last_sync_attempt: Option<DateTime<Utc>>) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            id: "f".to_string(),
            owner_id: "o".to_string(),
            original_name: "a.txt".to_string(),
            mime_type: "text/plain".to_string(),
            category: FileCategory::Document,
            size: 1,
            local_key: Some("1-a.txt".to_string()),
            remote_key: None,
            remote_ref: None,
            sync_status: SyncStatus::Pending,
            last_sync_attempt,
            sync_attempts: 0,
            last_sync_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_never_attempted_is_always_due() {
        let cutoff = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert!(pending(None).is_due(cutoff));
    }

    #[test]
    fn test_due_boundary_is_inclusive() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert!(pending(Some(t)).is_due(t));
        assert!(!pending(Some(t)).is_due(t - Duration::milliseconds(1)));
    }

    #[test]
    fn test_failed_is_never_due() {
        let mut record = pending(None);
        record.sync_status = SyncStatus::Failed;
        assert!(!record.is_due(Utc::now()));
    }

    #[test]
    fn test_category_from_mime() {
        let documents = [
            "application/pdf",
            "text/plain; charset=utf-8",
            "application/msword",
            "application/vnd.ms-excel",
            "application/vnd.ms-excel.sheet.macroEnabled.12",
            "application/vnd.ms-powerpoint.presentation.macroenabled.12",
            "application/vnd.ms-word.document.macroEnabled.12",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ];
        for mime in documents {
            assert_eq!(FileCategory::from_mime(mime), FileCategory::Document, "{mime}");
        }

        assert_eq!(FileCategory::from_mime("image/png"), FileCategory::Image);
        assert_eq!(FileCategory::from_mime("text/html"), FileCategory::Other);
        assert_eq!(FileCategory::from_mime("application/zip"), FileCategory::Other);
    }

    #[test]
    fn test_storage_key_follows_status() {
        let mut record = pending(None);
        assert_eq!(record.storage_key(), Some("1-a.txt"));

        record.sync_status = SyncStatus::Synced;
        record.remote_key = Some("o/2-a.txt".to_string());
        assert_eq!(record.storage_key(), Some("o/2-a.txt"));
    }
}
