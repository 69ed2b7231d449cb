use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use handlers::AppState;
use services::{
    backend::{Backend, local::LocalChunkStore, remote::RemoteMultipartStore},
    coordinator::{UploadCoordinator, UploadLimits},
    metadata_store::MetadataStore,
    object_store_client::S3Client,
    session_store::{SessionStore, SqliteSessionCache},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx does not create the database file itself.
    if let Err(e) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path_obj)
    {
        tracing::warn!("Failed to open database file {}: {}", db_path, e);
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(cfg.io_timeout)
            .connect(db_url)
            .await?,
    );
    let metadata = MetadataStore::new(db.clone());

    // --- Handle migration mode ---
    if migrate {
        metadata.migrate().await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Select the storage backend ---
    let backend = match &cfg.s3 {
        None => Backend::Local(LocalChunkStore::new(&cfg.storage_dir, cfg.io_timeout)),
        Some(s3) => {
            let client = S3Client::new(&s3.settings, cfg.io_timeout)?;
            tracing::info!(
                endpoint = %s3.settings.endpoint,
                bucket = %s3.settings.bucket,
                "using remote multipart store"
            );
            Backend::Remote(RemoteMultipartStore::new(
                Arc::new(client),
                &s3.prefix,
                cfg.io_timeout,
            ))
        }
    };

    // --- Initialize core service ---
    let sessions = SessionStore::new(Arc::new(SqliteSessionCache::new(db.clone())), cfg.io_timeout);
    let uploads = UploadCoordinator::new(
        sessions,
        backend,
        metadata,
        UploadLimits {
            max_chunk_bytes: cfg.max_chunk_bytes,
            max_chunk_count: cfg.max_chunk_count,
            finalize_lease: cfg.io_timeout,
        },
    );
    let state = AppState {
        uploads,
        storage_dir: cfg.storage_dir.clone().into(),
    };

    // --- Build router ---
    let body_limit = usize::try_from(cfg.max_chunk_bytes).unwrap_or(usize::MAX);
    let app: Router = routes::routes::routes(body_limit).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
