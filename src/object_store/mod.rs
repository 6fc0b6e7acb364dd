mod gcs;
mod keys;
mod local;
mod memory;

pub use gcs::GcsStore;
pub use keys::KeyGenerator;
pub use local::LocalStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Lifetime of every presigned read URL handed out by a remote store.
pub const PRESIGN_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),
}

/// A time-limited read URL for a remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl PresignedUrl {
    /// True once `now` is within `margin` of the expiry.
    pub fn is_expired(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin >= self.expires_at
    }
}

/// Durable byte storage addressed by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`. A failed put leaves nothing readable under `key`.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    /// Remove `key`. Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
}

/// An object store that can hand out time-limited read URLs.
#[async_trait]
pub trait RemoteStore: ObjectStore {
    async fn presign(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, ObjectStoreError>;
}
