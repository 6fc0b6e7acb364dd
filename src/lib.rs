//! file-sync - an offline-first file sync engine
//!
//! Files are accepted online (straight to the remote store) or offline
//! (staged on the local disk), and a background reconciler promotes staged
//! files to the remote store. Provides:
//! - Local filesystem staging and a remote object store (GCS, or in-memory)
//! - redb embedded database for file records (ACID, MVCC, crash-safe)
//! - A single-flight reconciliation loop with per-file cooldown
//! - A device-side offline queue that drains into the server when back online
//! - REST API with multipart upload support

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod object_store;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod storage;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use reconcile::Reconciler;
use service::FileService;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub files: FileService,
    pub reconciler: Arc<Reconciler>,
}
