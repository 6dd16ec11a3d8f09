use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod alerts;
mod api;
mod clv;
mod config;
mod consensus;
mod cross_market;
mod db;
mod error;
mod ingestion;
mod kv;
mod oddsmath;
mod orchestrator;
mod retention;
mod signals;
mod structural;

use api::AppState;
use config::Config;
use db::Database;
use kv::KvStore;
use orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    info!(env = %config.app_env, addr = %config.app_addr, "starting stratum-engine");

    let db = Database::open(&config.database_path)?;
    info!(path = %config.database_path, "database opened");

    let kv = Arc::new(KvStore::new());
    let config = Arc::new(config);

    let orchestrator = Orchestrator::new(db.clone(), kv.clone(), config.clone())?;
    let odds_client = orchestrator.odds_client();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let cycle_handle = tokio::spawn(orchestrator::run_forever(orchestrator, shutdown_rx.clone()));
    let retention_handle = tokio::spawn(retention::run_forever(
        db.clone(),
        (*config).clone(),
        shutdown_rx.clone(),
    ));
    let clv_handle = tokio::spawn(clv::run_forever(
        db.clone(),
        (*config).clone(),
        odds_client,
        shutdown_rx.clone(),
    ));

    let app_state = AppState {
        db: db.clone(),
        config: config.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&config.app_addr).await?;
    info!(addr = %config.app_addr, "read API listening");
    let server = axum::serve(listener, api::router(app_state));

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "read API server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(config.webhook_drain_timeout_seconds),
        async {
            let _ = cycle_handle.await;
            let _ = retention_handle.await;
            let _ = clv_handle.await;
        },
    )
    .await;

    info!("stratum-engine stopped");
    Ok(())
}
