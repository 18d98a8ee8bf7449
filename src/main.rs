mod assignment;
mod bootstrap;
mod chain;
mod compliance;
mod config;
mod error;
mod indexer;
mod ledger;
mod lifecycle;
mod notifications;
mod recipient;
mod reconciliation;
mod retry;
mod server;

#[cfg(test)]
mod testing;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,aggregator=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting off-ramp settlement aggregator");

    let config = config::Config::from_env()?;
    let app = bootstrap::initialize_app(&config).await?;

    // Reservation expiry drives reassignment
    let _sweeper = app
        .cache
        .start_sweeper(Duration::from_millis(config.order.cache_sweep_interval_ms));
    let _reassignment = app.queue.start_reassignment_worker();
    let _jobs = app.scheduler.start();

    let router = server::create_app(app.state);
    server::run_server(router, &config.bind_address).await?;

    Ok(())
}
