use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_sync::{
    api,
    clock::{Clock, SystemClock},
    config::{Config, RemoteBackend},
    ingest::Ingest,
    object_store as obj,
    reconcile::{interval_ticker, Reconciler},
    service::FileService,
    storage::Database,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-sync starting");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Local staging store for offline uploads
    let local = Arc::new(obj::LocalStore::new(&config.storage.local_storage_path)?);
    info!(
        "Staging offline uploads at: {}",
        config.storage.local_storage_path
    );

    // Remote store
    let remote: Arc<dyn obj::RemoteStore> = match config.storage.remote_backend {
        RemoteBackend::Gcs => {
            let bucket = config
                .storage
                .gcs_bucket
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("GCS_BUCKET is required when REMOTE_BACKEND=gcs"))?;
            let store = obj::GcsStore::new(
                bucket,
                config.storage.gcs_credentials_file.as_deref(),
                config.sync.backend_timeout,
            )
            .await?;
            info!("Using GCS remote backend, bucket: {}", bucket);
            Arc::new(store)
        }
        RemoteBackend::Memory => {
            info!("Using in-memory remote backend");
            Arc::new(obj::MemoryStore::with_clock(Arc::clone(&clock)))
        }
    };

    let ingest = Arc::new(Ingest::new(
        db.clone(),
        local,
        remote,
        Arc::clone(&clock),
        config.max_upload_size,
    ));
    let files = FileService::new(db.clone(), Arc::clone(&ingest), Arc::clone(&clock));
    let reconciler = Arc::new(Reconciler::new(
        db.clone(),
        ingest,
        clock,
        config.sync.clone(),
    ));

    // Start the background reconciliation loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_handle = {
        let reconciler = Arc::clone(&reconciler);
        let ticker = interval_ticker(config.sync.interval);
        tokio::spawn(async move { reconciler.run(ticker, shutdown_rx).await })
    };

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        files,
        reconciler,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let an in-flight pass finish, then stop the loop
    info!("Stopping reconciler");
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconcile_handle.await {
        tracing::error!(error = %e, "Reconciler task failed during shutdown");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
