use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::TimeZone;
use file_sync::clock::{Clock, ManualClock};
use file_sync::object_store::{
    LocalStore, MemoryStore, ObjectStore, ObjectStoreError, RemoteStore, PRESIGN_TTL,
};

#[tokio::test]
async fn test_local_store_put_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    let data = Bytes::from("hello world");
    store.put("test-key", data.clone(), "text/plain").await.unwrap();

    let retrieved = store.get("test-key").await.unwrap();
    assert_eq!(retrieved, data);
}

#[tokio::test]
async fn test_local_store_exists() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    assert!(!store.exists("missing").await.unwrap());

    store
        .put("present", Bytes::from("data"), "text/plain")
        .await
        .unwrap();
    assert!(store.exists("present").await.unwrap());
}

#[tokio::test]
async fn test_local_store_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    store
        .put("to-delete", Bytes::from("data"), "text/plain")
        .await
        .unwrap();
    store.delete("to-delete").await.unwrap();
    assert!(!store.exists("to-delete").await.unwrap());

    // Deleting again is fine
    store.delete("to-delete").await.unwrap();
}

#[tokio::test]
async fn test_local_store_get_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    let result = store.get("missing").await;
    assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
}

#[tokio::test]
async fn test_local_store_leaves_no_partial_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    store
        .put("1700000000000-report.pdf", Bytes::from(vec![7u8; 4096]), "application/pdf")
        .await
        .unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["1700000000000-report.pdf".to_string()]);
}

#[tokio::test]
async fn test_local_store_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path().join("files")).unwrap();

    for key in ["../escape", "/etc/passwd", "a/../../b", "", "dir\\file"] {
        let result = store.put(key, Bytes::from("x"), "text/plain").await;
        assert!(
            matches!(result, Err(ObjectStoreError::InvalidKey(_))),
            "key {key:?} should be rejected"
        );
    }
    assert!(!dir.path().join("escape").exists());
}

#[tokio::test]
async fn test_memory_store_round_trip() {
    let store = MemoryStore::new();
    let data = Bytes::from(vec![1u8, 2, 3, 4]);

    store
        .put("owner-1/1700000000000-a.bin", data.clone(), "application/octet-stream")
        .await
        .unwrap();

    assert_eq!(store.get("owner-1/1700000000000-a.bin").await.unwrap(), data);
    assert_eq!(
        store.content_type("owner-1/1700000000000-a.bin").as_deref(),
        Some("application/octet-stream")
    );
    assert_eq!(store.len(), 1);

    store.delete("owner-1/1700000000000-a.bin").await.unwrap();
    assert!(store.is_empty());
    assert!(matches!(
        store.get("owner-1/1700000000000-a.bin").await,
        Err(ObjectStoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_memory_store_unreachable() {
    let store = MemoryStore::new();
    store.set_unreachable(true);

    let result = store.put("k", Bytes::from("data"), "text/plain").await;
    assert!(matches!(result, Err(ObjectStoreError::Backend(_))));
    assert!(store.presign("k", PRESIGN_TTL).await.is_err());

    store.set_unreachable(false);
    store.put("k", Bytes::from("data"), "text/plain").await.unwrap();
    assert!(store.exists("k").await.unwrap());
}

#[tokio::test]
async fn test_memory_store_presign_uses_clock() {
    let start = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let store = MemoryStore::with_clock(clock.clone() as Arc<dyn Clock>);

    let url = store
        .presign("owner/1-photo.png", Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(url.expires_at, start + chrono::Duration::hours(1));
    assert!(url.url.starts_with("memory://owner%2F1-photo.png"));

    assert!(!url.is_expired(clock.now(), chrono::Duration::minutes(5)));
    clock.advance(chrono::Duration::minutes(56));
    assert!(url.is_expired(clock.now(), chrono::Duration::minutes(5)));
}
