use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::{AppConfig, IndexBackend};
use services::{
    elasticsearch_index::ElasticsearchIndex,
    image_service::ImageService,
    index_gateway::SharedIndex,
    memory_index::MemoryIndex,
    object_store::{LocalObjectStore, ObjectStorage},
    product_service::ProductService,
    reconciler::{Reconciler, RepairQueue},
    record_store::RecordStore,
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        database_url = %cfg.database_url,
        index_backend = ?cfg.index_backend,
        "starting catalog-service"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        RecordStore::connect(&cfg.database_url, 5)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?,
    );
    let records = RecordStore::new(db);

    // --- Migrations: apply and exit with --migrate, otherwise apply at startup ---
    records.migrate().await.context("applying migrations")?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Collaborators ---
    let index: SharedIndex = match cfg.index_backend {
        IndexBackend::Memory => {
            tracing::warn!("using the in-process search index; documents are lost on restart");
            Arc::new(MemoryIndex::new())
        }
        IndexBackend::Elasticsearch => Arc::new(
            ElasticsearchIndex::new(
                &cfg.elasticsearch_url,
                &cfg.elasticsearch_index,
                cfg.request_timeout,
            )
            .context("building elasticsearch client")?,
        ),
    };
    index
        .ensure_index()
        .await
        .with_context(|| format!("preparing {} search index", index.backend()))?;
    let objects: Arc<dyn ObjectStorage> = Arc::new(LocalObjectStore::new(
        &cfg.storage_dir,
        cfg.public_base_url.clone(),
        cfg.presign_secret.clone(),
    ));

    // --- Core services ---
    let (repairs, repair_rx) = RepairQueue::channel();
    let products = ProductService::new(records.clone(), index.clone(), repairs);
    let images = ImageService::new(
        records.clone(),
        objects.clone(),
        cfg.product_bucket.clone(),
        cfg.presign_expiry,
    );
    let reconciler =
        Reconciler::new(records.clone(), index.clone()).with_batch_size(cfg.reconcile_batch_size);

    let shutdown = CancellationToken::new();
    let worker = reconciler
        .clone()
        .spawn(repair_rx, cfg.reconcile_interval, shutdown.clone());

    let state = AppState {
        products,
        images,
        reconciler,
        records,
        index,
        objects,
        admin_role: Arc::from(cfg.admin_role.as_str()),
        request_timeout: cfg.request_timeout,
        shutdown: shutdown.clone(),
    };

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(err) = worker.await {
        tracing::warn!(error = %err, "reconciler task ended abnormally");
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
