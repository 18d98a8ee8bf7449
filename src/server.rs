use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::chain::ChainRegistry;
use crate::error::AppResult;
use crate::ledger::OrderStore;
use crate::reconciliation::scheduler::{JobStats, JobStatus};

/// Shared state behind the operational endpoints
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    pub registry: Arc<ChainRegistry>,
    pub stats: Arc<JobStats>,
    pub environment: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub environment: String,
    pub networks: Vec<String>,
    pub store_reachable: bool,
    pub uptime_secs: i64,
    pub timestamp: DateTime<Utc>,
}

pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let store_reachable = match state.store.networks().await {
        Ok(_) => true,
        Err(e) => {
            warn!("⚠️  Health check could not reach the order store: {}", e);
            false
        }
    };
    let now = Utc::now();

    Ok(Json(HealthResponse {
        status: if store_reachable { "healthy" } else { "degraded" }.to_string(),
        environment: state.environment.clone(),
        networks: state.registry.registered_networks(),
        store_reachable,
        uptime_secs: (now - state.started_at).num_seconds(),
        timestamp: now,
    }))
}

pub async fn job_status(State(state): State<AppState>) -> Json<BTreeMap<&'static str, JobStatus>> {
    Json(state.stats.snapshot())
}

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/jobs", get(job_status))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
