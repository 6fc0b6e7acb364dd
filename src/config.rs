use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    /// Enables dangerous operations like purge. Must never be true in production.
    pub test_mode: bool,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteBackend {
    Gcs,
    /// In-process store; nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub remote_backend: RemoteBackend,
    /// Directory where offline uploads are staged
    pub local_storage_path: String,
    /// GCS bucket name (required when the remote backend is gcs)
    pub gcs_bucket: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to ADC)
    pub gcs_credentials_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often a reconciliation pass runs
    pub interval: Duration,
    /// Minimum time between two attempts on the same file
    pub cooldown: Duration,
    /// Upper bound for a single backend call made by the reconciler
    pub backend_timeout: Duration,
    /// Delete the staged local copy once the remote copy is confirmed
    pub reclaim_local: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            remote_backend: RemoteBackend::Memory,
            local_storage_path: "./files".to_string(),
            gcs_bucket: None,
            gcs_credentials_file: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            cooldown: Duration::from_secs(300),
            backend_timeout: Duration::from_secs(30),
            reclaim_local: false,
        }
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let test_mode = env_flag("TEST_MODE");

        let max_upload_size = std::env::var("MAX_UPLOAD_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50 * 1024 * 1024); // 50MB

        let remote_backend = match std::env::var("REMOTE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "gcs" => RemoteBackend::Gcs,
            _ => RemoteBackend::Memory,
        };

        let local_storage_path =
            std::env::var("LOCAL_STORAGE_PATH").unwrap_or_else(|_| "./files".to_string());

        let gcs_bucket = std::env::var("GCS_BUCKET").ok();
        let gcs_credentials_file = std::env::var("GCS_CREDENTIALS_FILE").ok();

        let config = Config {
            node: NodeConfig {
                bind_address,
                data_dir,
            },
            storage: StorageConfig {
                remote_backend,
                local_storage_path,
                gcs_bucket,
                gcs_credentials_file,
            },
            sync: SyncConfig {
                interval: env_secs("SYNC_INTERVAL_SECONDS", 300),
                cooldown: env_secs("SYNC_COOLDOWN_SECONDS", 300),
                backend_timeout: env_secs("BACKEND_TIMEOUT_SECONDS", 30),
                reclaim_local: env_flag("RECLAIM_LOCAL_AFTER_SYNC"),
            },
            test_mode,
            max_upload_size,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.remote_backend == RemoteBackend::Gcs && self.storage.gcs_bucket.is_none() {
            return Err(ConfigError::ValidationError(
                "GCS_BUCKET is required when REMOTE_BACKEND=gcs".to_string(),
            ));
        }

        if self.sync.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "SYNC_INTERVAL_SECONDS must be greater than 0".to_string(),
            ));
        }

        if self.sync.backend_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "BACKEND_TIMEOUT_SECONDS must be greater than 0".to_string(),
            ));
        }

        if self.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_UPLOAD_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.storage.remote_backend == RemoteBackend::Memory {
            tracing::warn!(
                "REMOTE_BACKEND=memory: synced files live in process memory and are lost on restart"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            node: NodeConfig {
                bind_address: "127.0.0.1:0".to_string(),
                data_dir: "./data".to_string(),
            },
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            test_mode: false,
            max_upload_size: 1024,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_gcs_requires_bucket() {
        let mut config = config();
        config.storage.remote_backend = RemoteBackend::Gcs;
        assert!(config.validate().is_err());

        config.storage.gcs_bucket = Some("bucket".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = config();
        config.sync.interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
