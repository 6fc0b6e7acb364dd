use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::api::OWNER_HEADER;
use crate::error::FileError;
use crate::ingest::{Ingest, IngestMode, IngestRequest};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Response(String),
}

impl From<FileError> for UploadError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Validation(msg) => UploadError::Rejected(msg),
            other => UploadError::Transport(other.to_string()),
        }
    }
}

/// A buffered file on its way to the server.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub owner_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// Where drained entries go. Returns the server-side file id.
#[async_trait]
pub trait UploadSink: Send + Sync {
    async fn upload(&self, upload: PendingUpload) -> Result<String, UploadError>;
}

/// Hands entries straight to the ingest pipeline in online mode.
#[async_trait]
impl UploadSink for Ingest {
    async fn upload(&self, upload: PendingUpload) -> Result<String, UploadError> {
        let request = IngestRequest {
            data: upload.data,
            original_name: upload.original_name,
            mime_type: Some(upload.mime_type),
            owner_id: upload.owner_id,
        };
        let record = self.ingest(request, IngestMode::Online).await?;
        Ok(record.id)
    }
}

#[derive(Deserialize)]
struct UploadEnvelope {
    status: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Posts entries to a running server's `/files/upload` route.
pub struct HttpUploader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploader {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UploadSink for HttpUploader {
    async fn upload(&self, upload: PendingUpload) -> Result<String, UploadError> {
        let part = reqwest::multipart::Part::bytes(upload.data.to_vec())
            .file_name(upload.original_name)
            .mime_str(&upload.mime_type)
            .map_err(|e| UploadError::Rejected(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("mode", "online");

        let response = self
            .client
            .post(format!("{}/files/upload", self.base_url))
            .header(OWNER_HEADER, &upload.owner_id)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = response.status();
        let envelope: UploadEnvelope = response
            .json()
            .await
            .map_err(|e| UploadError::Response(format!("{status}: {e}")))?;

        match envelope.status.as_str() {
            "success" => envelope
                .data
                .as_ref()
                .and_then(|d| d.get("id"))
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .ok_or_else(|| UploadError::Response("missing file id".to_string())),
            "fail" => {
                let message = envelope
                    .data
                    .as_ref()
                    .and_then(|d| d.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("upload rejected")
                    .to_string();
                Err(UploadError::Rejected(format!("{status}: {message}")))
            }
            _ => Err(UploadError::Transport(format!(
                "{status}: {}",
                envelope.message.unwrap_or_else(|| "server error".to_string())
            ))),
        }
    }
}
