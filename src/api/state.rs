//! Application state: the composition root wiring every component together.

use std::sync::Arc;

use reqwest::Client;
use tokio::sync::mpsc;

use crate::auth::AuthService;
use crate::balancer::LoadBalancer;
use crate::billing::{Ledger, PricingEngine};
use crate::cache::Cache;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::db::{self, DbPool};
use crate::gateway::Gateway;
use crate::metrics::Metrics;
use crate::quota::{QuotaConsumer, QuotaEngine};
use crate::ratelimit::RateLimiter;
use crate::router::Router;

/// Shared application state handed to every axum handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<Gateway>,
    pub auth: Arc<AuthService>,
    pub catalog: Arc<Catalog>,
    pub metrics: Arc<Metrics>,
    pub cache: Arc<Cache>,
    pub db_pool: DbPool,
    pub start_time: std::time::Instant,
    pub quota_consumer: Arc<QuotaConsumer>,
    pub users: Arc<db::UserRepository>,
    pub api_keys: Arc<db::ApiKeyRepository>,
    pub quotas: Arc<db::QuotaRepository>,
    pub usage_logs: Arc<db::UsageLogRepository>,
    pub ledger: Arc<crate::billing::Ledger>,
    quota_workers: std::sync::Mutex<Option<Vec<tokio::task::JoinHandle<()>>>>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let config = Arc::new(config);
        let db_pool = db::init_pool(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;
        tracing::info!("database connection pool established");

        let cache = Arc::new(Cache::connect(&config.redis.url).await);
        let metrics = Arc::new(Metrics::new());

        let users = Arc::new(db::UserRepository::new(db_pool.clone()));
        let api_keys = Arc::new(db::ApiKeyRepository::new(db_pool.clone()));
        let providers_repo = Arc::new(db::ProviderRepository::new(db_pool.clone()));
        let models_repo = Arc::new(db::ModelRepository::new(db_pool.clone()));
        let support_repo = Arc::new(db::ModelSupportRepository::new(db_pool.clone()));
        let pricing_repo = Arc::new(db::PricingRepository::new(db_pool.clone()));
        let quotas_repo = Arc::new(db::QuotaRepository::new(db_pool.clone()));
        let quota_usage_repo = Arc::new(db::QuotaUsageRepository::new(db_pool.clone()));
        let usage_logs = Arc::new(db::UsageLogRepository::new(db_pool.clone()));
        let billing_repo = Arc::new(db::BillingRepository::new(db_pool.clone()));

        let auth = Arc::new(AuthService::new(
            users.clone(),
            api_keys.clone(),
            cache.clone(),
            config.server.jwt_secret.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(120));
        let ip_rate_limiter = Arc::new(RateLimiter::new(100));
        let catalog = Arc::new(Catalog::new(providers_repo, models_repo, support_repo, cache.clone()));
        let balancer = Arc::new(LoadBalancer::new());
        let http_client = Client::builder().build()?;
        let router = Arc::new(Router::new(
            catalog.clone(),
            balancer,
            http_client,
            config.routing.max_retries,
            config.quota.token_estimation_fudge_factor,
        ));
        let ledger = Arc::new(Ledger::new(users.clone(), billing_repo));
        let pricing = Arc::new(PricingEngine::new(pricing_repo));

        let (sender, receiver) = mpsc::channel(config.quota.channel_capacity);
        let quota_engine = Arc::new(QuotaEngine::new(
            quotas_repo.clone(),
            quota_usage_repo.clone(),
            cache.clone(),
            sender.clone(),
            metrics.clone(),
        ));
        let consumer = Arc::new(QuotaConsumer::new(
            quotas_repo.clone(),
            quota_usage_repo,
            cache.clone(),
            config.quota.batch_size,
            config.quota.flush_interval_ms,
            config.quota.retry_attempts,
            config.quota.retry_delay_ms,
        ));
        let quota_workers = consumer.clone().start(receiver, config.quota.workers);

        let gateway = Arc::new(Gateway::new(
            auth.clone(),
            rate_limiter,
            ip_rate_limiter,
            quota_engine,
            catalog.clone(),
            router,
            ledger.clone(),
            pricing,
            usage_logs.clone(),
        ));

        Ok(AppState {
            config,
            gateway,
            auth,
            catalog,
            metrics,
            cache,
            db_pool,
            start_time: std::time::Instant::now(),
            quota_consumer: consumer,
            users,
            api_keys,
            quotas: quotas_repo,
            usage_logs,
            ledger,
            quota_workers: std::sync::Mutex::new(Some(quota_workers)),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn is_database_connected(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.db_pool).await.is_ok()
    }

    pub fn is_cache_connected(&self) -> bool {
        self.cache.is_connected()
    }

    /// Graceful-shutdown step 3 (spec.md §5): stop accepting new quota
    /// events and drain whatever workers have already batched. Closing the
    /// channel unblocks every worker's `recv()` with `None` and triggers its
    /// final flush. Safe to call more than once; the second call finds the
    /// handles already taken and returns immediately.
    pub async fn shutdown_quota_consumer(&self) {
        self.gateway.shutdown_quota();
        let handles = self.quota_workers.lock().expect("quota worker lock poisoned").take();
        if let Some(handles) = handles {
            crate::quota::QuotaConsumer::stop(handles).await;
        }
    }
}
