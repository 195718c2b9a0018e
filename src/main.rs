use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod planner;
mod routes;
mod scheduler;
mod services;
mod storage;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag + client subcommand ---
    let (cfg, migrate, command) = config::AppConfig::from_env_and_args()?;

    if let Some(command) = command {
        return run_command(command).await;
    }

    tracing::info!("Starting upload-coordinator with config: {:?}", cfg);

    // --- Ensure the database directory exists ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if !db_path.contains(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // Schema statements are IF NOT EXISTS guarded; running them every
    // startup is safe and keeps --migrate usable as a standalone mode.
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Select storage backend ---
    let memory_backend = match cfg.backend {
        config::BackendKind::Memory => Some(Arc::new(storage::memory::MemoryBackend::new(
            cfg.public_base_url(),
        ))),
        config::BackendKind::S3 => None,
    };
    let backend: Arc<dyn storage::StorageBackend> = match &memory_backend {
        Some(memory) => memory.clone(),
        None => Arc::new(
            storage::s3::S3Backend::from_env(cfg.s3_bucket.clone(), cfg.s3_endpoint.as_deref())
                .await,
        ),
    };

    // --- Initialize core service ---
    let service = services::upload_service::UploadService::new(
        db.clone(),
        backend,
        Duration::from_secs(cfg.part_ttl_secs),
    );

    // --- Build router ---
    // The memory backend additionally terminates its own part-write and
    // read URLs; S3 serves presigned requests itself.
    let app: Router = match memory_backend {
        Some(memory) => routes::routes::routes()
            .with_state(service)
            .merge(routes::routes::backend_routes(memory)),
        None => routes::routes::routes().with_state(service),
    };

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

/// Dispatch a client subcommand instead of serving.
async fn run_command(command: config::Command) -> Result<()> {
    match command {
        config::Command::Upload { file, server, chunk_size } => {
            upload_command(file, server, chunk_size).await
        }
    }
}

/// Send one file through a running coordinator, printing progress and
/// cancelling (which aborts the session) on Ctrl-C.
async fn upload_command(file: PathBuf, server: String, chunk_size: u64) -> Result<()> {
    use crate::scheduler::{HttpCoordinatorClient, HttpPartTransport, UploadEvent, UploadManager};

    let api = Arc::new(HttpCoordinatorClient::new(&server)?);
    let transport = Arc::new(HttpPartTransport::new()?);
    let manager = UploadManager::new(api, transport).with_chunk_size(chunk_size);

    let mut handle = manager.start(file).await;
    let mut events = handle.take_events().context("event stream already taken")?;

    let signal_manager = manager.clone();
    let upload_id = handle.id;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; cancelling upload");
            signal_manager.cancel(upload_id).await;
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::Started { key, total_parts, resumed_parts } => {
                if resumed_parts > 0 {
                    tracing::info!(
                        "Resuming {} ({} of {} parts already recorded)",
                        key,
                        resumed_parts,
                        total_parts
                    );
                } else {
                    tracing::info!("Uploading {} in {} parts", key, total_parts);
                }
            }
            UploadEvent::Progress { part_number, transferred_bytes, total_bytes } => {
                tracing::info!(
                    "Part {} acknowledged ({}/{} bytes)",
                    part_number,
                    transferred_bytes,
                    total_bytes
                );
            }
            UploadEvent::Completed { location, .. } => {
                tracing::info!("Upload complete: {}", location);
            }
            UploadEvent::Aborted { key } => {
                tracing::warn!("Upload aborted: {}", key);
            }
            UploadEvent::Failed { key, error } => {
                tracing::error!("Upload failed for {}: {}", key, error);
            }
        }
    }

    let outcome = handle.join().await?;
    println!(
        "{} stored at {} ({} parts, {} resumed)",
        outcome.key, outcome.location, outcome.total_parts, outcome.resumed_parts
    );
    Ok(())
}
