mod chain;
mod config;
mod entities;
mod http;
mod indexer;
mod models;
mod rpc;
mod state;
mod store;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ApiConfig, CacheBackend, DatabaseConfig};
use crate::indexer::GovernanceIndex;
use crate::rpc::RpcClient;
use crate::state::AppState;
use crate::store::{CacheStore, DatabaseCacheStore, MemoryCacheStore};
use anyhow::{Context, Result};
use axum::Router;
use migration::MigratorTrait;
use sea_orm::ConnectOptions;
use sea_orm::Database;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ApiConfig::load().context("Failed to load configuration")?;
    let store = build_store(&config).await?;

    let rpc_client = RpcClient::new(&config.chain.rpc_url, config.chain.request_timeout()?)
        .context("Failed to initialize RPC client")?;

    let index = Arc::new(
        GovernanceIndex::new(
            Arc::new(rpc_client),
            store,
            &config.contracts,
            &config.indexer,
        )
        .context("Failed to build governance index")?,
    );
    let app_state = AppState::new(Arc::clone(&index));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let warmer_handle = config.indexer.warm_interval().map(|interval| {
        let index = Arc::clone(&index);
        tokio::spawn(async move {
            if let Err(err) = index.run(interval, shutdown_rx).await {
                error!("Index warmer terminated with error: {err}");
            }
        })
    });

    let listener = TcpListener::bind(config.server.address())
        .await
        .context("Failed to bind HTTP listener")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to obtain listener address")?;
    info!("Lil Nouns governance indexer listening on {local_addr}");

    let router: Router = http::router(app_state);
    let server = axum::serve(listener, router.into_make_service());
    server
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .context("HTTP server exited with error")?;

    shutdown_tx.send(true).ok();
    if let Some(handle) = warmer_handle {
        if let Err(join_err) = handle.await {
            error!("Index warmer task join error: {join_err}");
        }
    }

    Ok(())
}

fn init_tracing() {
    let default_filter = "info";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

async fn build_store(config: &ApiConfig) -> Result<Arc<dyn CacheStore>> {
    match config.cache.backend {
        CacheBackend::Memory => {
            info!("Using in-process cache store");
            Ok(Arc::new(MemoryCacheStore::new()))
        }
        CacheBackend::Database => {
            let database_config = config
                .database
                .as_ref()
                .context("The database cache backend requires a [database] section")?;
            let database = connect_database(database_config).await?;
            run_migrations(&database).await?;
            info!("Using PostgreSQL cache store");
            Ok(Arc::new(DatabaseCacheStore::new(database)))
        }
    }
}

async fn connect_database(config: &DatabaseConfig) -> Result<sea_orm::DatabaseConnection> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .sqlx_logging(true)
        .sqlx_logging_level(tracing::log::LevelFilter::Debug)
        .acquire_timeout(Duration::from_secs(10));

    if let Some(min) = config.min_connections {
        options.min_connections(min);
    }

    Database::connect(options)
        .await
        .context("Failed to connect to PostgreSQL")
}

async fn run_migrations(database: &sea_orm::DatabaseConnection) -> Result<()> {
    migration::Migrator::up(database, None)
        .await
        .context("Database migrations failed")
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    shutdown_tx.send(true).ok();
    info!("Shutdown signal dispatched");
}
