use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    assignment::{MemoryAssignmentCache, PriorityQueueService},
    chain::{registry::ClientSettings, ChainRegistry},
    compliance::Shield3Oracle,
    config::Config,
    error::AppResult,
    indexer::Indexer,
    ledger::{MemoryOrderStore, OrderStore, PgOrderStore},
    notifications::WebhookNotifier,
    recipient::{KeyServiceDecryptor, RecipientCodec},
    reconciliation::{JobStats, QuidaxPriceFeed, ReconciliationJobs, ReconciliationScheduler},
    server::AppState,
};

/// Everything `main` needs to start the service
pub struct App {
    pub state: AppState,
    pub cache: MemoryAssignmentCache,
    pub queue: Arc<PriorityQueueService>,
    pub scheduler: ReconciliationScheduler,
}

pub async fn initialize_app(config: &Config) -> AppResult<App> {
    info!("Initializing application components ...");

    let store: Arc<dyn OrderStore> = match &config.database_url {
        Some(url) => Arc::new(PgOrderStore::new(initialize_database(url).await?)),
        None => {
            warn!("⚠️  DATABASE_URL not set - running on the in-memory order store");
            Arc::new(MemoryOrderStore::new())
        }
    };

    // Chain clients, one pair per configured network
    let settings = ClientSettings {
        relayer_url: config.relayer_url.clone(),
        relayer_api_key: config.relayer_api_key.clone(),
        tron_api_key: config.tron_api_key.clone(),
        retry: config.order.rpc_retry(),
    };
    let registry = Arc::new(ChainRegistry::from_networks(store.networks().await?, &settings));
    info!("✅ Chain registry ready: {:?}", registry.registered_networks());

    let cache = MemoryAssignmentCache::new();
    let queue = Arc::new(PriorityQueueService::new(
        store.clone(),
        Arc::new(cache.clone()),
        config.order.clone(),
    ));
    info!("✅ Priority queue service initialized");

    let webhooks = Arc::new(WebhookNotifier::new(store.clone(), &config.order));

    let aml_enabled = config.is_production();
    let indexer = Arc::new(Indexer::new(
        store.clone(),
        registry.clone(),
        queue.clone(),
        Arc::new(Shield3Oracle::new(
            &config.compliance_url,
            config.compliance_api_key.clone(),
        )),
        RecipientCodec::new(Arc::new(KeyServiceDecryptor::new(&config.key_service_url))),
        webhooks.clone(),
        config.order.clone(),
        aml_enabled,
    ));
    info!("✅ Indexer initialized (AML screening: {})", aml_enabled);

    let jobs = Arc::new(ReconciliationJobs::new(
        store.clone(),
        indexer,
        queue.clone(),
        webhooks,
        Arc::new(QuidaxPriceFeed::new(&config.price_feed_url, config.order.rpc_retry())),
        config.order.clone(),
    ));

    let stats = Arc::new(JobStats::default());
    let scheduler = ReconciliationScheduler::new(jobs, config.jobs.clone(), stats.clone());

    let state = AppState {
        store,
        registry,
        stats,
        environment: config.environment.clone(),
        started_at: Utc::now(),
    };

    Ok(App {
        state,
        cache,
        queue,
        scheduler,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
