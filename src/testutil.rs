//! Shared test helpers for file-sync unit tests.

use std::sync::Arc;

use crate::clock::{Clock, ManualClock};
use crate::config::{Config, NodeConfig, StorageConfig, SyncConfig};
use crate::ingest::Ingest;
use crate::object_store::{LocalStore, MemoryStore};
use crate::reconcile::Reconciler;
use crate::service::FileService;
use crate::storage::Database;
use crate::AppState;

/// Handles a test needs to steer the app: the fake remote and the clock.
pub struct TestHarness {
    pub state: Arc<AppState>,
    pub remote: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

/// Create a test AppState with a temporary database, a local staging store
/// and an in-memory remote store.
pub fn test_state(temp_dir: &tempfile::TempDir) -> TestHarness {
    let data_dir = temp_dir.path().join("data");
    let files_dir = temp_dir.path().join("files");

    let config = Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
        },
        storage: StorageConfig {
            local_storage_path: files_dir.to_string_lossy().to_string(),
            ..StorageConfig::default()
        },
        sync: SyncConfig::default(),
        test_mode: true,
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
    };

    let clock = Arc::new(ManualClock::default());
    let dyn_clock: Arc<dyn Clock> = clock.clone();

    let db = Database::open(&data_dir).expect("Failed to open test database");
    let local = Arc::new(LocalStore::new(&files_dir).expect("Failed to create test local store"));
    let remote = Arc::new(MemoryStore::with_clock(Arc::clone(&dyn_clock)));

    let ingest = Arc::new(Ingest::new(
        db.clone(),
        local,
        remote.clone(),
        Arc::clone(&dyn_clock),
        config.max_upload_size,
    ));
    let files = FileService::new(db.clone(), Arc::clone(&ingest), Arc::clone(&dyn_clock));
    let reconciler = Arc::new(Reconciler::new(
        db.clone(),
        ingest,
        dyn_clock,
        config.sync.clone(),
    ));

    TestHarness {
        state: Arc::new(AppState {
            config,
            db,
            files,
            reconciler,
        }),
        remote,
        clock,
    }
}
