use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::{ObjectStore, ObjectStoreError, PresignedUrl, RemoteStore};
use crate::clock::{Clock, SystemClock};

/// In-process remote store for development and tests.
///
/// `set_unreachable(true)` makes every call fail the way an unreachable
/// bucket would; `set_latency` makes every call slow.
pub struct MemoryStore {
    objects: RwLock<HashMap<String, (Bytes, String)>>,
    unreachable: AtomicBool,
    latency_ms: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presigned URL expiry is computed from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            clock,
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .ok()
            .and_then(|m| m.get(key).map(|(_, ct)| ct.clone()))
    }

    async fn check_reachable(&self) -> Result<(), ObjectStoreError> {
        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend(
                "remote store unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> ObjectStoreError {
    ObjectStoreError::Backend("memory store lock poisoned".to_string())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), ObjectStoreError> {
        self.check_reachable().await?;
        let mut objects = self.objects.write().map_err(poisoned)?;
        objects.insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.check_reachable().await?;
        let objects = self.objects.read().map_err(poisoned)?;
        objects
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.check_reachable().await?;
        let mut objects = self.objects.write().map_err(poisoned)?;
        objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.check_reachable().await?;
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.contains_key(key))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn presign(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, ObjectStoreError> {
        self.check_reachable().await?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ObjectStoreError::Backend(format!("invalid ttl: {e}")))?;
        let expires_at = self.clock.now() + ttl;
        Ok(PresignedUrl {
            url: format!(
                "memory://{}?expires={}",
                urlencoding::encode(key),
                expires_at.timestamp()
            ),
            expires_at,
        })
    }
}
