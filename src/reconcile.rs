//! Background reconciliation: promotes pending files from the local store to
//! the remote store.
//!
//! A pass selects every pending record that was never attempted or whose
//! last attempt is at least one cooldown old, and tries each one in
//! isolation. Successes become `synced`; failures become `failed` and stay
//! that way until someone requests a resync. Passes are single-flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::FileError;
use crate::ingest::Ingest;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::storage::models::FileRecord;
use crate::storage::{Database, DatabaseError};

/// Why a single reconciliation attempt failed. Recorded on the file, never
/// propagated past the pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("file {0} has no local copy")]
    MissingLocalCopy(String),
    #[error("storage error: {0}")]
    Storage(#[from] ObjectStoreError),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("{0}")]
    Rejected(String),
}

impl From<FileError> for SyncError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Storage(e) => SyncError::Storage(e),
            FileError::Database(e) => SyncError::Database(e),
            FileError::Validation(msg) | FileError::NotFound(msg) => SyncError::Rejected(msg),
        }
    }
}

/// Source of reconciliation triggers. Returns false when no more ticks will come.
#[async_trait]
pub trait Ticker: Send {
    async fn tick(&mut self) -> bool;
}

#[async_trait]
impl Ticker for tokio::time::Interval {
    async fn tick(&mut self) -> bool {
        tokio::time::Interval::tick(self).await;
        true
    }
}

/// Manual trigger: every message is one tick; closing the channel ends the loop.
#[async_trait]
impl Ticker for mpsc::Receiver<()> {
    async fn tick(&mut self) -> bool {
        self.recv().await.is_some()
    }
}

/// Wall-clock ticker that fires immediately, then every `period`.
pub fn interval_ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum AttemptOutcome {
    Synced,
    Failed { error: String },
    /// The record changed under the pass (deleted or resynced) and was left alone.
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub file_id: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: Vec<Attempt>,
}

impl PassReport {
    pub fn synced(&self) -> usize {
        self.count(|o| matches!(o, AttemptOutcome::Synced))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AttemptOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&AttemptOutcome) -> bool) -> usize {
        self.attempts.iter().filter(|a| pred(&a.outcome)).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerStatus {
    pub running: bool,
    pub passes: u64,
    pub last_pass: Option<PassReport>,
}

pub struct Reconciler {
    db: Database,
    ingest: Arc<Ingest>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    in_flight: Mutex<()>,
    last_pass: RwLock<Option<PassReport>>,
    passes: AtomicU64,
}

impl Reconciler {
    pub fn new(
        db: Database,
        ingest: Arc<Ingest>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            ingest,
            clock,
            config,
            in_flight: Mutex::new(()),
            last_pass: RwLock::new(None),
            passes: AtomicU64::new(0),
        }
    }

    /// A pass counts as running for exactly as long as it holds `in_flight`,
    /// so a dropped pass never leaves the flag set.
    pub async fn status(&self) -> ReconcilerStatus {
        ReconcilerStatus {
            running: self.in_flight.try_lock().is_err(),
            passes: self.passes.load(Ordering::SeqCst),
            last_pass: self.last_pass.read().await.clone(),
        }
    }

    /// Run passes on every tick until the ticker ends or shutdown is signalled.
    /// A pass that has started always runs to completion.
    pub async fn run<T: Ticker>(&self, mut ticker: T, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval = ?self.config.interval,
            cooldown = ?self.config.cooldown,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                more = ticker.tick() => {
                    if !more {
                        break;
                    }
                    self.run_pass().await;
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }

    /// Run a pass on its own task so the caller going away cannot cut it
    /// short. `Ok(None)` if another pass is still running.
    pub async fn run_pass_detached(
        self: &Arc<Self>,
    ) -> Result<Option<PassReport>, tokio::task::JoinError> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move { reconciler.run_pass().await }).await
    }

    /// One reconciliation pass. Returns `None` if another pass is still running.
    pub async fn run_pass(&self) -> Option<PassReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!("Reconciliation pass already running, skipping");
            return None;
        };

        let started_at = self.clock.now();
        let cooldown = chrono::Duration::from_std(self.config.cooldown)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let cutoff = started_at - cooldown;

        let due = match self.db.due_for_sync(cutoff) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to select files for reconciliation");
                Vec::new()
            }
        };

        if !due.is_empty() {
            tracing::info!(files = due.len(), "Starting reconciliation pass");
        }

        let mut attempts = Vec::with_capacity(due.len());
        for record in &due {
            let outcome = self.reconcile_one(record).await;
            attempts.push(Attempt {
                file_id: record.id.clone(),
                outcome,
            });
        }

        let report = PassReport {
            started_at,
            finished_at: self.clock.now(),
            attempts,
        };

        if !report.attempts.is_empty() {
            tracing::info!(
                selected = report.attempts.len(),
                synced = report.synced(),
                failed = report.failed(),
                "Reconciliation pass finished"
            );
        }

        self.passes.fetch_add(1, Ordering::SeqCst);
        *self.last_pass.write().await = Some(report.clone());
        Some(report)
    }

    async fn reconcile_one(&self, record: &FileRecord) -> AttemptOutcome {
        let attempted_at = self.clock.now();

        let synced = match self.promote(record).await {
            Ok(synced) => synced,
            Err(e) => return self.record_failure(record, attempted_at, &e),
        };
        let (Some(remote_key), Some(remote_ref)) =
            (synced.remote_key.as_deref(), synced.remote_ref.as_ref())
        else {
            let e = SyncError::Rejected("promotion returned no remote locator".to_string());
            return self.record_failure(record, attempted_at, &e);
        };

        match self
            .db
            .mark_synced(&record.id, remote_key, remote_ref, attempted_at)
        {
            Ok(Some(_)) => {
                tracing::debug!(file_id = %record.id, remote_key = %remote_key, "File synced");
                if self.config.reclaim_local {
                    self.reclaim_local(record).await;
                }
                AttemptOutcome::Synced
            }
            Ok(None) => {
                tracing::warn!(
                    file_id = %record.id,
                    "File changed during reconciliation, discarding remote copy"
                );
                self.discard_remote(remote_key).await;
                AttemptOutcome::Skipped {
                    reason: "file deleted or no longer pending".to_string(),
                }
            }
            Err(e) => {
                self.discard_remote(remote_key).await;
                self.record_failure(record, attempted_at, &SyncError::Database(e))
            }
        }
    }

    async fn promote(&self, record: &FileRecord) -> Result<FileRecord, SyncError> {
        if record.local_key.is_none() {
            return Err(SyncError::MissingLocalCopy(record.id.clone()));
        }

        let timeout = self.config.backend_timeout;
        match tokio::time::timeout(timeout, self.ingest.ingest_from_local_handle(record)).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(timeout)),
        }
    }

    fn record_failure(
        &self,
        record: &FileRecord,
        attempted_at: DateTime<Utc>,
        error: &SyncError,
    ) -> AttemptOutcome {
        tracing::error!(file_id = %record.id, error = %error, "Failed to sync file");

        let message = error.to_string();
        match self.db.mark_failed(&record.id, attempted_at, &message) {
            Ok(Some(_)) => AttemptOutcome::Failed { error: message },
            Ok(None) => AttemptOutcome::Skipped {
                reason: "file deleted or no longer pending".to_string(),
            },
            Err(e) => {
                tracing::error!(file_id = %record.id, error = %e, "Failed to record sync failure");
                AttemptOutcome::Failed { error: message }
            }
        }
    }

    /// Drop the staged copy of a synced file. The locator is cleared before
    /// the bytes go, so the record never points at missing bytes.
    async fn reclaim_local(&self, record: &FileRecord) {
        let Some(local_key) = record.local_key.as_deref() else {
            return;
        };
        match self.db.clear_local_key(&record.id, self.clock.now()) {
            Ok(Some(_)) => {
                if let Err(e) = self.ingest.local().delete(local_key).await {
                    tracing::warn!(file_id = %record.id, error = %e, "Failed to reclaim local copy");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(file_id = %record.id, error = %e, "Failed to clear local locator");
            }
        }
    }

    async fn discard_remote(&self, remote_key: &str) {
        if let Err(e) = self.ingest.remote().delete(remote_key).await {
            tracing::warn!(remote_key = %remote_key, error = %e, "Failed to discard remote copy");
        }
    }
}
