//! Batching background workers that drain the quota-usage channel and flush
//! aggregated increments to Postgres (spec.md §4.3, C3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::cache::Cache;
use crate::db::{QuotaRepository, QuotaUsageRepository};
use crate::quota::quota_type_label;
use crate::types::{QuotaPeriod, QuotaType, QuotaUsageEvent};

/// Events for one user+type accumulate here until a flush boundary.
#[derive(Default)]
struct PendingGroup {
    total: f64,
    count: usize,
    last_event_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Atomically-exposed counters for the consumer's lifetime (spec.md §4.3:
/// "statistics counters ... are exposed atomically").
#[derive(Default)]
pub struct ConsumerStats {
    pub total: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
    pub batch_count: AtomicU64,
}

pub struct QuotaConsumer {
    quotas: Arc<QuotaRepository>,
    usage: Arc<QuotaUsageRepository>,
    cache: Arc<Cache>,
    batch_size: usize,
    flush_interval: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
    stats: ConsumerStats,
}

impl QuotaConsumer {
    pub fn new(
        quotas: Arc<QuotaRepository>,
        usage: Arc<QuotaUsageRepository>,
        cache: Arc<Cache>,
        batch_size: usize,
        flush_interval_ms: u64,
        retry_attempts: u32,
        retry_delay_ms: u64,
    ) -> Self {
        QuotaConsumer {
            quotas,
            usage,
            cache,
            batch_size,
            flush_interval: Duration::from_millis(flush_interval_ms),
            retry_attempts,
            retry_delay: Duration::from_millis(retry_delay_ms),
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Spawn `workers` tasks, all draining from the same receiver via a
    /// shared `Mutex`. Each worker batches by `(user_id, quota_type)`,
    /// flushing when a group reaches `batch_size` events or on every
    /// `flush_interval` tick, whichever comes first. Returns the join
    /// handles `Stop()` awaits to drain residual batches before exit.
    pub fn start(self: Arc<Self>, receiver: mpsc::Receiver<QuotaUsageEvent>, workers: usize) -> Vec<tokio::task::JoinHandle<()>> {
        let shared_rx = Arc::new(Mutex::new(receiver));
        (0..workers.max(1))
            .map(|worker_id| {
                let consumer = self.clone();
                let rx = shared_rx.clone();
                tokio::spawn(async move { consumer.run(worker_id, rx).await })
            })
            .collect()
    }

    /// Idempotent and concurrency-safe: closing an already-closed sender
    /// (the caller's half of the channel) just makes every worker's next
    /// `recv()` return `None`, so calling `Stop()` more than once is a
    /// harmless no-op on the worker side. Blocks until every worker has
    /// drained and flushed its residual batch.
    pub async fn stop(handles: Vec<tokio::task::JoinHandle<()>>) {
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("quota consumer worker panicked: {e}");
            }
        }
    }

    async fn run(&self, worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<QuotaUsageEvent>>>) {
        let mut groups: HashMap<(i64, QuotaType), PendingGroup> = HashMap::new();
        let mut deadline = Instant::now() + self.flush_interval;

        loop {
            let event = {
                let mut guard = rx.lock().await;
                tokio::time::timeout_at(deadline, guard.recv()).await
            };

            match event {
                Ok(Some(event)) => {
                    self.stats.total.fetch_add(1, Ordering::Relaxed);
                    let group = groups.entry((event.user_id, event.quota_type)).or_default();
                    group.total += event.value;
                    group.count += 1;
                    group.last_event_at = Some(event.timestamp);

                    if group.count >= self.batch_size.max(1) {
                        self.flush_one(&(event.user_id, event.quota_type), &mut groups).await;
                    }
                }
                Ok(None) => {
                    // Sender side dropped: flush what remains and exit.
                    self.flush_all(worker_id, &mut groups).await;
                    return;
                }
                Err(_) => {
                    // Flush-interval elapsed with no new event; flush and reset deadline.
                    self.flush_all(worker_id, &mut groups).await;
                    deadline = Instant::now() + self.flush_interval;
                }
            }
        }
    }

    async fn flush_all(&self, worker_id: usize, groups: &mut HashMap<(i64, QuotaType), PendingGroup>) {
        let keys: Vec<(i64, QuotaType)> = groups.keys().cloned().collect();
        for key in keys {
            self.flush_one(&key, groups).await;
        }
        if !groups.is_empty() {
            tracing::debug!(worker_id, "quota consumer: flush pass complete");
        }
    }

    async fn flush_one(&self, key: &(i64, QuotaType), groups: &mut HashMap<(i64, QuotaType), PendingGroup>) {
        let Some(group) = groups.remove(key) else { return };
        let (user_id, quota_type) = *key;
        let at = group.last_event_at.unwrap_or_else(chrono::Utc::now);
        self.stats.batch_count.fetch_add(1, Ordering::Relaxed);

        let quotas = match self.quotas.list_active_for_user(user_id).await {
            Ok(q) => q,
            Err(e) => {
                self.stats.failed.fetch_add(group.count as u64, Ordering::Relaxed);
                tracing::error!(user_id, "quota flush: could not resolve active quotas: {e}");
                return;
            }
        };

        let mut any_applied = false;
        let mut invalidate_keys = vec![crate::cache::keys::user_quotas(user_id)];
        for quota in quotas.into_iter().filter(|q| q.quota_type == quota_type) {
            if self
                .increment_with_retry(quota.id, user_id, quota.period, at, group.total, quota_type)
                .await
            {
                any_applied = true;
                invalidate_keys.push(crate::cache::keys::quota_usage(
                    user_id,
                    quota_type_label(quota_type),
                    &crate::cache::period_key(quota.period, at),
                ));
            }
        }

        // Step 4 of spec.md §4.3: once a user's events are flushed,
        // invalidate that user's quota cache entries so the next
        // `CheckQuota` read observes the new usage instead of a stale
        // cached value.
        if any_applied {
            self.cache.delete(&invalidate_keys).await;
            self.stats.processed.fetch_add(group.count as u64, Ordering::Relaxed);
        }
    }

    async fn increment_with_retry(
        &self,
        quota_id: i64,
        user_id: i64,
        period: QuotaPeriod,
        at: chrono::DateTime<chrono::Utc>,
        delta: f64,
        quota_type: QuotaType,
    ) -> bool {
        let mut attempt = 0;
        loop {
            match self.usage.increment(quota_id, user_id, period, at, delta).await {
                Ok(_) => return true,
                Err(e) if attempt < self.retry_attempts => {
                    attempt += 1;
                    tracing::warn!(
                        user_id,
                        quota_type = quota_type_label(quota_type),
                        attempt,
                        "quota flush failed, retrying: {e}"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        user_id,
                        quota_type = quota_type_label(quota_type),
                        "quota flush failed after {attempt} retries, event lost: {e}"
                    );
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_stats_start_at_zero() {
        let stats = ConsumerStats::default();
        assert_eq!(stats.total.load(Ordering::Relaxed), 0);
        assert_eq!(stats.processed.load(Ordering::Relaxed), 0);
    }
}
