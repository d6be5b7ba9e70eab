use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod test_support;

use services::{
    kv::{KvStore, MemoryKv},
    notification::{LogMailer, Mailer, NotificationQueue, NotificationWorker},
    object_storage::{LocalObjectStorage, ObjectStorage},
    redis_kv::RedisKv,
    s3_storage::S3ObjectStorage,
    secrets::SecretHasher,
};

const NOTIFICATION_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting ephemeral-transfer with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let db = db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    // --- Handle migration mode ---
    if migrate {
        let applied = db::run_migrations(&db).await?;
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(()); // exit after migration
    }
    db::run_migrations(&db).await?;

    // --- Backends ---
    let keyring = cfg.keyring()?;

    let kv: Arc<dyn KvStore> = match &cfg.redis_url {
        Some(url) => Arc::new(
            RedisKv::connect(url)
                .await
                .context("connecting to Redis")?,
        ),
        None => {
            tracing::warn!("No Redis URL configured, keeping upload sessions in memory");
            Arc::new(MemoryKv::new())
        }
    };

    let storage: Arc<dyn ObjectStorage> = match &cfg.s3 {
        Some(settings) => Arc::new(S3ObjectStorage::new(settings.clone()).await),
        None => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            Arc::new(LocalObjectStorage::new(&cfg.storage_dir))
        }
    };

    // --- Initialize core services ---
    let (notifications, outbox) = NotificationQueue::new();
    let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);
    let state = state::AppState::new(
        &cfg,
        db,
        kv,
        storage,
        keyring,
        SecretHasher::default(),
        notifications,
        mailer.clone(),
    );

    // --- Background tasks ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = NotificationWorker::new(
        outbox,
        mailer,
        cfg.notification_max_attempts,
        NOTIFICATION_RETRY_DELAY,
    );
    let worker_task = tokio::spawn(worker.run(shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(
        state
            .cleanup_scheduler(cfg.cleanup_interval)
            .run(shutdown_rx.clone()),
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

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
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // --- Stop background tasks ---
    tracing::info!("Shutting down background tasks");
    let _ = shutdown_tx.send(true);
    for task in [worker_task, scheduler_task] {
        if let Err(err) = task.await {
            tracing::warn!("background task ended abnormally: {}", err);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
