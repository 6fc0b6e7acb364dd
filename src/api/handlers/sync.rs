use axum::extract::{Path, State};
use axum::Json;
use std::sync::Arc;

use super::files::{file_to_response, FileResponse};
use crate::api::response::{ApiError, JSend, OwnerId};
use crate::reconcile::{PassReport, ReconcilerStatus};
use crate::AppState;

/// Put a file back in line for the next reconciliation pass.
pub async fn request_resync(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(file_id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.files.request_resync(&owner_id, &file_id).await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn sync_status(State(state): State<Arc<AppState>>) -> Json<JSend<ReconcilerStatus>> {
    JSend::success(state.reconciler.status().await)
}

/// Run a pass now instead of waiting for the next tick.
pub async fn run_sync(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<PassReport>>, ApiError> {
    match state.reconciler.run_pass_detached().await {
        Ok(Some(report)) => Ok(JSend::success(report)),
        Ok(None) => Err(ApiError::conflict("A reconciliation pass is already running")),
        Err(e) => {
            tracing::error!(error = %e, "Forced reconciliation pass failed");
            Err(ApiError::internal("Reconciliation pass failed"))
        }
    }
}
