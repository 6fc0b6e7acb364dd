use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::response::{ApiError, AppQuery, JSend, JSendPaginated, OwnerId, Pagination};
use crate::ingest::{IngestMode, IngestRequest};
use crate::storage::models::{FileCategory, FileRecord, SyncStatus};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub category: FileCategory,
    pub created_at: String,
    pub id: String,
    pub last_sync_attempt: Option<String>,
    pub last_sync_error: Option<String>,
    pub mime_type: String,
    pub original_name: String,
    pub owner_id: String,
    pub remote_url: Option<String>,
    pub remote_url_expires_at: Option<String>,
    pub size: u64,
    pub sync_attempts: u32,
    pub sync_status: SyncStatus,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub category: Option<FileCategory>,
    #[serde(default)]
    pub sync_status: Option<SyncStatus>,
}

fn default_limit() -> u32 {
    20
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    mut multipart: Multipart,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let mut file_data = None;
    let mut file_name: Option<String> = None;
    let mut file_content_type: Option<String> = None;
    let mut mode = IngestMode::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                file_content_type = field.content_type().map(|s| s.to_string());

                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;

                if data.len() as u64 > state.config.max_upload_size {
                    return Err(ApiError::payload_too_large(format!(
                        "File exceeds maximum upload size of {} bytes",
                        state.config.max_upload_size
                    )));
                }
                file_data = Some(data);
            }
            "mode" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid mode: {e}")))?;
                mode = text.parse()?;
            }
            _ => {
                // Ignore unknown fields
            }
        }
    }

    let data = file_data.ok_or_else(|| ApiError::bad_request("file field is required"))?;
    let original_name =
        file_name.ok_or_else(|| ApiError::bad_request("file field must carry a file name"))?;

    let record = state
        .files
        .upload(
            IngestRequest {
                data,
                original_name,
                mime_type: file_content_type,
                owner_id,
            },
            mode,
        )
        .await?;

    Ok(JSend::success(file_to_response(&record)))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.files.get_file(&owner_id, &id).await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn get_file_content(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (file, data) = state.files.read_content(&owner_id, &id).await?;

    let disposition = format!(
        "inline; filename*=UTF-8''{}",
        urlencoding::encode(&file.original_name)
    );
    Ok((
        [
            (header::CONTENT_TYPE, file.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.files.delete_file(&owner_id, &id).await?;
    Ok(JSend::success(()))
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let files: Vec<FileRecord> = state
        .files
        .list_files(&owner_id)
        .await?
        .into_iter()
        .filter(|f| params.category.map_or(true, |c| f.category == c))
        .filter(|f| params.sync_status.map_or(true, |s| f.sync_status == s))
        .collect();

    let total = files.len() as u64;
    let items: Vec<FileResponse> = files
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(file_to_response)
        .collect();

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn file_to_response(file: &FileRecord) -> FileResponse {
    FileResponse {
        category: file.category,
        created_at: file.created_at.to_rfc3339(),
        id: file.id.clone(),
        last_sync_attempt: file.last_sync_attempt.map(|t| t.to_rfc3339()),
        last_sync_error: file.last_sync_error.clone(),
        mime_type: file.mime_type.clone(),
        original_name: file.original_name.clone(),
        owner_id: file.owner_id.clone(),
        remote_url: file.remote_ref.as_ref().map(|r| r.url.clone()),
        remote_url_expires_at: file.remote_ref.as_ref().map(|r| r.expires_at.to_rfc3339()),
        size: file.size,
        sync_attempts: file.sync_attempts,
        sync_status: file.sync_status,
        updated_at: file.updated_at.to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;
    use axum::http::StatusCode;
    use bytes::Bytes;

    async fn upload(state: &AppState, owner: &str, mode: IngestMode) -> FileRecord {
        state
            .files
            .upload(
                IngestRequest {
                    data: Bytes::from("data"),
                    original_name: "a.txt".to_string(),
                    mime_type: None,
                    owner_id: owner.to_string(),
                },
                mode,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let h = test_state(&dir);

        let result = get_file(
            State(h.state.clone()),
            OwnerId("owner-1".to_string()),
            Path("missing".to_string()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Fail(code, _)) if code == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_502() {
        let dir = tempfile::tempdir().unwrap();
        let h = test_state(&dir);
        let file = upload(&h.state, "owner-1", IngestMode::Online).await;
        h.remote.set_unreachable(true);

        let result = get_file_content(
            State(h.state.clone()),
            OwnerId("owner-1".to_string()),
            Path(file.id),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Error(code, _)) if code == StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let h = test_state(&dir);
        for _ in 0..3 {
            upload(&h.state, "owner-1", IngestMode::Offline).await;
            h.clock.advance(chrono::Duration::seconds(1));
        }

        let Json(page) = list_files(
            State(h.state.clone()),
            OwnerId("owner-1".to_string()),
            AppQuery(ListFilesParams {
                limit: 2,
                offset: 2,
                category: None,
                sync_status: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(page.data.pagination.total, 3);
        assert_eq!(page.data.items.len(), 1);
    }
}
