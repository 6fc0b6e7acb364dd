use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use file_sync::clock::{Clock, ManualClock};
use file_sync::ingest::Ingest;
use file_sync::object_store::{LocalStore, MemoryStore};
use file_sync::queue::{
    DrainOutcome, OfflineQueue, PendingUpload, QueueError, QueueMetadata, UploadError, UploadSink,
};
use file_sync::storage::models::SyncStatus;
use file_sync::storage::Database;
use tokio::sync::watch;

/// Records every upload; fails while `offline` is set.
#[derive(Default)]
struct RecordingSink {
    offline: std::sync::atomic::AtomicBool,
    uploads: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

#[async_trait]
impl UploadSink for RecordingSink {
    async fn upload(&self, upload: PendingUpload) -> Result<String, UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(UploadError::Transport("connection refused".to_string()));
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(upload.original_name.clone());
        Ok(format!("server-{}", uploads.len()))
    }
}

fn open_queue() -> (tempfile::TempDir, OfflineQueue) {
    let dir = tempfile::tempdir().unwrap();
    let queue = OfflineQueue::open_with_clock(
        dir.path().join("queue"),
        Arc::new(ManualClock::default()),
    )
    .unwrap();
    (dir, queue)
}

fn meta(name: &str) -> QueueMetadata {
    QueueMetadata {
        original_name: name.to_string(),
        mime_type: None,
    }
}

#[test]
fn test_enqueue_and_list() {
    let (_dir, queue) = open_queue();

    let id = queue
        .enqueue(Bytes::from("hello"), meta("notes.txt"), "owner-1")
        .unwrap();
    queue
        .enqueue(Bytes::from("other"), meta("other.txt"), "owner-2")
        .unwrap();

    let entry = queue.get(&id).unwrap().expect("entry exists");
    assert_eq!(entry.owner_id, "owner-1");
    assert_eq!(entry.mime_type, "text/plain");
    assert_eq!(entry.size, 5);
    assert_eq!(entry.sync_status, SyncStatus::Pending);
    assert!(entry.file_id.is_none());

    assert_eq!(queue.payload(&id).unwrap(), Some(Bytes::from("hello")));
    assert_eq!(queue.list("owner-1").unwrap().len(), 1);
    assert_eq!(queue.outstanding("owner-1").unwrap().len(), 1);
}

#[test]
fn test_enqueue_rejects_bad_input() {
    let (_dir, queue) = open_queue();

    assert!(matches!(
        queue.enqueue(Bytes::new(), meta("empty.txt"), "owner-1"),
        Err(QueueError::Validation(_))
    ));
    assert!(matches!(
        queue.enqueue(Bytes::from("x"), meta(" "), "owner-1"),
        Err(QueueError::Validation(_))
    ));
    assert!(matches!(
        queue.enqueue(Bytes::from("x"), meta("a.txt"), ""),
        Err(QueueError::Validation(_))
    ));
}

#[tokio::test]
async fn test_drain_marks_failures_and_retries_them() {
    let (_dir, queue) = open_queue();
    let sink = RecordingSink::default();

    let a = queue
        .enqueue(Bytes::from("a"), meta("a.txt"), "owner-1")
        .unwrap();
    let b = queue
        .enqueue(Bytes::from("b"), meta("b.txt"), "owner-1")
        .unwrap();

    sink.offline.store(true, Ordering::SeqCst);
    let report = queue.drain("owner-1", &sink).await.unwrap();
    assert_eq!(report.failed(), 2);

    let failed = queue.get(&a).unwrap().unwrap();
    assert_eq!(failed.sync_status, SyncStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("transport error: connection refused"));
    assert!(queue.payload(&a).unwrap().is_some());

    sink.offline.store(false, Ordering::SeqCst);
    let report = queue.drain("owner-1", &sink).await.unwrap();
    assert_eq!(report.synced(), 2);

    let synced = queue.get(&b).unwrap().unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert!(synced.file_id.is_some());
    assert!(synced.last_error.is_none());
    assert!(queue.payload(&b).unwrap().is_none());

    // Oldest first
    assert_eq!(*sink.uploads.lock().unwrap(), vec!["a.txt", "b.txt"]);

    // Synced entries are never uploaded again
    let report = queue.drain("owner-1", &sink).await.unwrap();
    assert!(report.entries.is_empty());
    assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
}

/// Uploads fine, but the entry disappears from the queue while in flight.
struct VanishingSink<'a> {
    queue: &'a OfflineQueue,
}

#[async_trait]
impl UploadSink for VanishingSink<'_> {
    async fn upload(&self, upload: PendingUpload) -> Result<String, UploadError> {
        for entry in self.queue.list(&upload.owner_id).unwrap() {
            self.queue.remove(&entry.id).unwrap();
        }
        Ok("server-1".to_string())
    }
}

#[tokio::test]
async fn test_upload_that_cannot_be_recorded_is_reported() {
    let (_dir, queue) = open_queue();
    queue
        .enqueue(Bytes::from("a"), meta("a.txt"), "owner-1")
        .unwrap();

    let sink = VanishingSink { queue: &queue };
    let report = queue.drain("owner-1", &sink).await.unwrap();

    assert_eq!(report.synced(), 0);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.unrecorded(), 1);
    let DrainOutcome::Unrecorded { file_id, error } = &report.entries[0].outcome else {
        panic!("expected an unrecorded entry, got {:?}", report.entries[0].outcome);
    };
    // The server-side id is kept so the caller can reconcile it
    assert_eq!(file_id, "server-1");
    assert!(error.contains("not found"));
}

#[tokio::test]
async fn test_drain_only_touches_one_owner() {
    let (_dir, queue) = open_queue();
    let sink = RecordingSink::default();

    queue
        .enqueue(Bytes::from("a"), meta("a.txt"), "owner-1")
        .unwrap();
    let other = queue
        .enqueue(Bytes::from("b"), meta("b.txt"), "owner-2")
        .unwrap();

    queue.drain("owner-1", &sink).await.unwrap();
    assert_eq!(
        queue.get(&other).unwrap().unwrap().sync_status,
        SyncStatus::Pending
    );
}

#[tokio::test]
async fn test_remove_and_purge_synced() {
    let (_dir, queue) = open_queue();
    let sink = RecordingSink::default();

    let a = queue
        .enqueue(Bytes::from("a"), meta("a.txt"), "owner-1")
        .unwrap();
    queue.drain("owner-1", &sink).await.unwrap();
    let b = queue
        .enqueue(Bytes::from("b"), meta("b.txt"), "owner-1")
        .unwrap();

    assert_eq!(queue.purge_synced("owner-1").unwrap(), 1);
    assert!(queue.get(&a).unwrap().is_none());
    assert!(queue.get(&b).unwrap().is_some());

    assert!(queue.remove(&b).unwrap());
    assert!(!queue.remove(&b).unwrap());
    assert!(queue.list("owner-1").unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue
            .enqueue(Bytes::from("kept"), meta("kept.txt"), "owner-1")
            .unwrap()
    };

    let queue = OfflineQueue::open(dir.path()).unwrap();
    assert_eq!(queue.payload(&id).unwrap(), Some(Bytes::from("kept")));
}

#[tokio::test]
async fn test_drain_into_ingest_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let db = Database::open(dir.path().join("data")).unwrap();
    let local = Arc::new(LocalStore::new(dir.path().join("files")).unwrap());
    let remote = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
    let ingest = Ingest::new(db.clone(), local, remote.clone(), clock, 1024 * 1024);

    let queue = OfflineQueue::open(dir.path().join("queue")).unwrap();
    let id = queue
        .enqueue(Bytes::from("%PDF"), meta("scan.pdf"), "owner-1")
        .unwrap();

    let report = queue.drain("owner-1", &ingest).await.unwrap();
    let DrainOutcome::Synced { file_id } = &report.entries[0].outcome else {
        panic!("expected a synced entry, got {:?}", report.entries[0].outcome);
    };

    let record = db.get_file(file_id).unwrap().expect("server record");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.mime_type, "application/pdf");
    assert_eq!(remote.len(), 1);
    assert_eq!(
        queue.get(&id).unwrap().unwrap().file_id.as_deref(),
        Some(file_id.as_str())
    );
}

#[tokio::test]
async fn test_drain_on_reconnect() {
    let (_dir, queue) = open_queue();
    let sink = RecordingSink::default();
    let id = queue
        .enqueue(Bytes::from("a"), meta("a.txt"), "owner-1")
        .unwrap();

    let (online_tx, online_rx) = watch::channel(false);

    let (queue_ref, sink_ref, id_ref) = (&queue, &sink, &id);
    let driver = async move {
        // Nothing happens while offline
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink_ref.calls.load(Ordering::SeqCst), 0);

        online_tx.send(true).unwrap();
        for _ in 0..100 {
            if queue_ref.get(id_ref).unwrap().unwrap().sync_status == SyncStatus::Synced {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(online_tx);
    };

    tokio::join!(queue.drain_on_reconnect("owner-1", &sink, online_rx), driver);

    assert_eq!(
        queue.get(&id).unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
}
