mod campaign;
mod config;
mod db;
mod errors;
mod models;
mod routes;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::campaign::acquisition::{ChannelRouter, OutreachQueue};
use crate::campaign::ledger::{CampaignLedger, InMemoryLedger};
use crate::campaign::orchestrator::CampaignOrchestrator;
use crate::campaign::pg_ledger::PgCampaignLedger;
use crate::campaign::scheduler::spawn_sweeper;
use crate::config::Config;
use crate::db::create_pool;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on malformed values)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Outreach API v{}", env!("CARGO_PKG_VERSION"));

    // Campaign ledger: PostgreSQL when configured, in-process otherwise
    let ledger: Arc<dyn CampaignLedger> = match &config.database_url {
        Some(url) => Arc::new(PgCampaignLedger::new(create_pool(url).await?)),
        None => {
            info!("DATABASE_URL not set; campaigns are kept in memory");
            Arc::new(InMemoryLedger::new())
        }
    };

    // Outreach dispatch queue
    let router = ChannelRouter::from_endpoint(config.acquisition_endpoint.as_deref());
    let (queue, _dispatch_worker) = OutreachQueue::spawn(
        config.outreach_queue_capacity,
        Arc::new(router),
        config.engine.ledger_retry,
    );
    info!(
        capacity = config.outreach_queue_capacity,
        endpoint = config.acquisition_endpoint.as_deref().unwrap_or("log-only"),
        "Outreach queue started"
    );

    let orchestrator = Arc::new(CampaignOrchestrator::new(
        ledger,
        queue,
        config.engine.clone(),
    ));

    if config.check_in_sweep_interval_secs > 0 {
        spawn_sweeper(
            Arc::clone(&orchestrator),
            Duration::from_secs(config.check_in_sweep_interval_secs),
        );
    }

    // Build app state
    let state = AppState { orchestrator };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
