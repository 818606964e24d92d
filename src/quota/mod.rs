//! Quota admission and the async usage-consumption pipeline (spec.md §4.3, C3).

pub mod consumer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::cache::{keys, period_key, ttl, Cache};
use crate::db::{QuotaRepository, QuotaUsageRepository};
use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::types::{Quota, QuotaPeriod, QuotaType, QuotaUsageEvent};

pub use consumer::QuotaConsumer;

/// Entry point the request pipeline calls before and after dispatch.
pub struct QuotaEngine {
    quotas: Arc<QuotaRepository>,
    usage: Arc<QuotaUsageRepository>,
    cache: Arc<Cache>,
    /// Wrapped so `shutdown()` can drop the sender on demand: closing every
    /// clone of the channel's sender half is what lets consumer workers
    /// observe `None` and run their final flush (spec.md §5 step 3).
    sender: Mutex<Option<tokio::sync::mpsc::Sender<QuotaUsageEvent>>>,
    dropped_events: AtomicU64,
    metrics: Arc<Metrics>,
}

impl QuotaEngine {
    pub fn new(
        quotas: Arc<QuotaRepository>,
        usage: Arc<QuotaUsageRepository>,
        cache: Arc<Cache>,
        sender: tokio::sync::mpsc::Sender<QuotaUsageEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        QuotaEngine {
            quotas,
            usage,
            cache,
            sender: Mutex::new(Some(sender)),
            dropped_events: AtomicU64::new(0),
            metrics,
        }
    }

    /// Admission check: for every active quota on the user, the current
    /// period's usage must be below `limit_value`. Reads go through the
    /// cache first (spec.md §4.4 `user_quotas` / `quota_usage` keys).
    pub async fn check_quota(&self, user_id: i64, quota_type: QuotaType) -> Result<()> {
        let active_quotas = self.active_quotas(user_id).await?;
        let now = Utc::now();

        for quota in active_quotas.into_iter().filter(|q| q.quota_type == quota_type) {
            let used = self.current_usage(&quota, now).await?;
            if used >= quota.limit_value {
                self.metrics
                    .quota_exceeded_total
                    .with_label_values(&[quota_type_label(quota_type)])
                    .inc();
                return Err(GatewayError::QuotaExceeded {
                    quota_type: quota_type_label(quota_type).to_string(),
                    reset_at: reset_at_label(quota.period, now),
                });
            }
        }
        Ok(())
    }

    async fn active_quotas(&self, user_id: i64) -> Result<Vec<Quota>> {
        let cache_key = keys::user_quotas(user_id);
        if let Some(quotas) = self.cache.get(&cache_key).await {
            return Ok(quotas);
        }
        let quotas = self.quotas.list_active_for_user(user_id).await?;
        self.cache.set(&cache_key, &quotas, ttl::USER_QUOTAS).await;
        Ok(quotas)
    }

    async fn current_usage(&self, quota: &Quota, now: chrono::DateTime<chrono::Utc>) -> Result<f64> {
        let pkey = period_key(quota.period, now);
        let cache_key = keys::quota_usage(quota.user_id, quota_type_label(quota.quota_type), &pkey);
        if let Some(used) = self.cache.get::<f64>(&cache_key).await {
            return Ok(used);
        }
        let usage = self.usage.find_current(quota.id, quota.period, now).await?;
        let used = usage.map(|u| u.used_value).unwrap_or(0.0);
        self.cache.set(&cache_key, &used, ttl::QUOTA_USAGE).await;
        Ok(used)
    }

    /// Publish one usage event for async batching. On a full channel this
    /// degrades to a synchronous direct increment rather than dropping the
    /// event (documented choice, spec.md §4.3).
    pub async fn consume_quota(&self, event: QuotaUsageEvent) {
        let request_id = event.request_id.clone();
        let send_result = {
            let guard = self.sender.lock().expect("quota sender lock poisoned");
            guard.as_ref().map(|s| {
                let result = s.try_send(event.clone());
                self.metrics.quota_channel_depth.set((s.max_capacity() - s.capacity()) as i64);
                result
            })
        };
        match send_result {
            Some(Ok(())) => {}
            Some(Err(_)) | None => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                self.metrics.quota_dropped_events_total.inc();
                tracing::warn!(
                    request_id = request_id.as_deref().unwrap_or(""),
                    "quota channel full or closed, falling back to synchronous increment"
                );
                if let Err(e) = self.increment_synchronously(&event).await {
                    tracing::error!("synchronous quota fallback failed: {e}");
                }
            }
        }
    }

    /// Drop the channel sender so background consumer workers see the
    /// channel close, flush their residual batches, and exit. Idempotent.
    pub fn shutdown(&self) {
        self.sender.lock().expect("quota sender lock poisoned").take();
    }

    async fn increment_synchronously(&self, event: &QuotaUsageEvent) -> Result<()> {
        let quotas = self.active_quotas(event.user_id).await?;
        for quota in quotas.into_iter().filter(|q| q.quota_type == event.quota_type) {
            self.usage
                .increment(quota.id, event.user_id, quota.period, event.timestamp, event.value)
                .await?;
            self.invalidate_usage_cache(event.user_id, quota.quota_type, quota.period, event.timestamp)
                .await;
        }
        Ok(())
    }

    pub async fn invalidate_usage_cache(
        &self,
        user_id: i64,
        quota_type: QuotaType,
        period: QuotaPeriod,
        at: chrono::DateTime<chrono::Utc>,
    ) {
        let pkey = period_key(period, at);
        let key = keys::quota_usage(user_id, quota_type_label(quota_type), &pkey);
        self.cache.delete(&[key]).await;
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

pub fn quota_type_label(t: QuotaType) -> &'static str {
    match t {
        QuotaType::Requests => "requests",
        QuotaType::Tokens => "tokens",
        QuotaType::Cost => "cost",
    }
}

fn reset_at_label(period: QuotaPeriod, now: chrono::DateTime<chrono::Utc>) -> String {
    use chrono::Duration as ChronoDuration;
    let next = match period {
        QuotaPeriod::Minute => now + ChronoDuration::minutes(1),
        QuotaPeriod::Hour => now + ChronoDuration::hours(1),
        QuotaPeriod::Day => now + ChronoDuration::days(1),
        QuotaPeriod::Month => now + ChronoDuration::days(30),
        QuotaPeriod::Total => now,
    };
    next.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_type_label() {
        assert_eq!(quota_type_label(QuotaType::Tokens), "tokens");
        assert_eq!(quota_type_label(QuotaType::Cost), "cost");
    }
}
