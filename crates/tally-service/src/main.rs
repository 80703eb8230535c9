//! Tally Service Binary
//!
//! Usage-event ingestion, rollup aggregation, freshness, and exports

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tally_common::{SystemClock, VERSION};
use tally_service::{api, Tally, TallyConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Tally v{}", VERSION);

    let config = TallyConfig::load()?;
    info!(?config, "Loaded configuration");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let tally = Arc::new(Tally::new(config, Arc::new(SystemClock))?);

    let shutdown = CancellationToken::new();
    let workers = tally.spawn_workers(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP server listening");

    let signal = shutdown.clone();
    axum::serve(listener, api::router(tally))
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "Background worker panicked");
        }
    }

    info!("Shutting down Tally");
    Ok(())
}

async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
