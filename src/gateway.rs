//! Request pipeline orchestration: auth -> rate limit -> quota admission ->
//! routing -> dispatch -> usage capture -> async billing (spec.md §2, C9).

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::auth::{AuthService, Credential};
use crate::billing::{Ledger, PricingEngine};
use crate::catalog::Catalog;
use crate::db::{NewUsageLog, UsageLogRepository};
use crate::error::{GatewayError, Result};
use crate::quota::QuotaEngine;
use crate::ratelimit::RateLimiter;
use crate::router::{generate_request_id, Router};
use crate::types::{ChatCompletionRequest, Principal, QuotaType, QuotaUsageEvent, StreamChunk};

pub struct GatewayResult {
    pub request_id: String,
    pub response: crate::types::AiResponse,
    pub provider_slug: String,
    pub duration_ms: u64,
}

pub struct Gateway {
    auth: Arc<AuthService>,
    rate_limiter: Arc<RateLimiter>,
    /// Per-IP bucket applied as an outer guard ahead of authentication
    /// (spec.md §4.2: "always applied ... e.g., 100/min by default"), so an
    /// unauthenticated flood can't exhaust the auth/db path before a
    /// principal is even resolved.
    ip_rate_limiter: Arc<RateLimiter>,
    quota: Arc<QuotaEngine>,
    catalog: Arc<Catalog>,
    router: Arc<Router>,
    ledger: Arc<Ledger>,
    pricing: Arc<PricingEngine>,
    usage_logs: Arc<UsageLogRepository>,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: Arc<AuthService>,
        rate_limiter: Arc<RateLimiter>,
        ip_rate_limiter: Arc<RateLimiter>,
        quota: Arc<QuotaEngine>,
        catalog: Arc<Catalog>,
        router: Arc<Router>,
        ledger: Arc<Ledger>,
        pricing: Arc<PricingEngine>,
        usage_logs: Arc<UsageLogRepository>,
    ) -> Self {
        Gateway {
            auth,
            rate_limiter,
            ip_rate_limiter,
            quota,
            catalog,
            router,
            ledger,
            pricing,
            usage_logs,
        }
    }

    /// `Authenticate`, admitted once here; callers pass the already-resolved
    /// [`Principal`] into [`Gateway::process_request`] so HTTP middleware and
    /// the orchestrator share one auth pass per request.
    pub async fn authenticate(&self, credential: Credential) -> Result<Principal> {
        self.auth.authenticate(credential).await
    }

    pub fn check_rate_limit(&self, principal: &Principal) -> Result<crate::ratelimit::RateLimitHeaders> {
        self.rate_limiter
            .check(&principal.rate_limit_key())
            .map_err(|outcome| GatewayError::RateLimited {
                retry_after_secs: outcome.retry_after_secs,
                limit: outcome.limit,
                reset_secs: outcome.reset_secs,
            })
    }

    /// Outer guard checked before authentication. Keyed on the caller's
    /// socket address regardless of who (if anyone) they turn out to be.
    pub fn check_ip_rate_limit(&self, ip: &str) -> Result<()> {
        self.ip_rate_limiter
            .check(&format!("ip:{ip}"))
            .map(|_| ())
            .map_err(|outcome| GatewayError::RateLimited {
                retry_after_secs: outcome.retry_after_secs,
                limit: outcome.limit,
                reset_secs: outcome.reset_secs,
            })
    }

    /// Graceful-shutdown step 3 (spec.md §5): close the quota event channel
    /// so background consumer workers drain and flush their final batch.
    pub fn shutdown_quota(&self) {
        self.quota.shutdown();
    }

    pub async fn process_request(
        &self,
        principal: &Principal,
        request: ChatCompletionRequest,
        endpoint: &str,
    ) -> Result<GatewayResult> {
        let request_id = generate_request_id();
        let start = Instant::now();

        if !principal.api_key_permits(&request.model) {
            return Err(GatewayError::InvalidRequest(format!(
                "api key not permitted for model {}",
                request.model
            )));
        }

        self.quota.check_quota(principal.user.id, QuotaType::Requests).await?;
        self.quota.check_quota(principal.user.id, QuotaType::Tokens).await?;
        self.quota.check_quota(principal.user.id, QuotaType::Cost).await?;

        let model = self.catalog.find_model(&request.model).await?;
        let outcome = self.router.route_request(&request).await;

        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(route_outcome) => {
                let cost = self
                    .pricing
                    .calculate_cost(model.id, &route_outcome.response.usage, chrono::Utc::now())
                    .await
                    .unwrap_or(0.0);

                self.record_and_bill(
                    principal,
                    &request_id,
                    route_outcome.provider_id,
                    model.id,
                    endpoint,
                    &route_outcome.response.usage,
                    duration_ms,
                    200,
                    None,
                    cost,
                )
                .await;

                Ok(GatewayResult {
                    request_id,
                    response: route_outcome.response,
                    provider_slug: route_outcome.provider_slug,
                    duration_ms,
                })
            }
            Err(e) => {
                self.record_and_bill(
                    principal,
                    &request_id,
                    0,
                    model.id,
                    endpoint,
                    &Default::default(),
                    duration_ms,
                    502,
                    Some(e.to_string()),
                    0.0,
                )
                .await;
                Err(e)
            }
        }
    }

    pub async fn process_stream_request(
        &self,
        principal: &Principal,
        request: ChatCompletionRequest,
        endpoint: &str,
        out: mpsc::Sender<Result<StreamChunk>>,
    ) -> Result<String> {
        let request_id = generate_request_id();
        let start = Instant::now();

        if !principal.api_key_permits(&request.model) {
            return Err(GatewayError::InvalidRequest(format!(
                "api key not permitted for model {}",
                request.model
            )));
        }

        self.quota.check_quota(principal.user.id, QuotaType::Requests).await?;
        self.quota.check_quota(principal.user.id, QuotaType::Tokens).await?;

        let model = self.catalog.find_model(&request.model).await?;
        let result = self.router.route_stream_request(&request, out).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(route_outcome) => {
                // Terminal usage comes from the last SSE frame the upstream
                // sent (router.rs forwards it alongside the chunk); when a
                // provider omits it, router.rs substitutes a word-count
                // estimate before returning here.
                let cost = self
                    .pricing
                    .calculate_cost(model.id, &route_outcome.usage, chrono::Utc::now())
                    .await
                    .unwrap_or(0.0);

                self.record_and_bill(
                    principal,
                    &request_id,
                    route_outcome.provider_id,
                    model.id,
                    endpoint,
                    &route_outcome.usage,
                    duration_ms,
                    200,
                    None,
                    cost,
                )
                .await;
                Ok(request_id)
            }
            Err(e) => {
                self.record_and_bill(
                    principal,
                    &request_id,
                    0,
                    model.id,
                    endpoint,
                    &Default::default(),
                    duration_ms,
                    502,
                    Some(e.to_string()),
                    0.0,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Post-response bookkeeping: append the usage log, trigger the
    /// balance debit, and publish the async quota-consumption event. All
    /// best-effort — a failure here does not change the response already
    /// sent to the client.
    #[allow(clippy::too_many_arguments)]
    async fn record_and_bill(
        &self,
        principal: &Principal,
        request_id: &str,
        provider_id: i64,
        model_id: i64,
        endpoint: &str,
        usage: &crate::types::TokenUsage,
        duration_ms: u64,
        status_code: u16,
        error_message: Option<String>,
        cost: f64,
    ) {
        let entry = NewUsageLog {
            user_id: principal.user.id,
            api_key_id: principal.api_key.as_ref().map(|k| k.id),
            provider_id,
            model_id,
            request_id,
            method: "POST",
            endpoint,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_or_sum(),
            request_size: 0,
            response_size: 0,
            duration_ms,
            status_code,
            error_message,
            cost,
        };

        let log = match self.usage_logs.create(entry).await {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(request_id, "failed to persist usage log: {e}");
                return;
            }
        };

        if cost > 0.0 {
            if let Err(e) = self.ledger.debit(principal.user.id, log.id, cost).await {
                tracing::error!(request_id, "failed to debit balance: {e}");
            }
        }

        let now = chrono::Utc::now();
        self.quota
            .consume_quota(QuotaUsageEvent {
                user_id: principal.user.id,
                quota_type: QuotaType::Requests,
                value: 1.0,
                timestamp: now,
                request_id: Some(request_id.to_string()),
            })
            .await;
        if usage.total_or_sum() > 0 {
            self.quota
                .consume_quota(QuotaUsageEvent {
                    user_id: principal.user.id,
                    quota_type: QuotaType::Tokens,
                    value: usage.total_or_sum() as f64,
                    timestamp: now,
                    request_id: Some(request_id.to_string()),
                })
                .await;
        }
        if cost > 0.0 {
            self.quota
                .consume_quota(QuotaUsageEvent {
                    user_id: principal.user.id,
                    quota_type: QuotaType::Cost,
                    value: cost,
                    timestamp: now,
                    request_id: Some(request_id.to_string()),
                })
                .await;
        }
    }

    pub fn dropped_quota_events(&self) -> u64 {
        self.quota.dropped_events()
    }
}
