//! Token-bucket rate limiter, keyed per principal (spec.md §4.2, C2).
//!
//! Generalizes the teacher's sliding-window `DashMap<String, IpTracker>`
//! pattern into a token bucket: each key owns a float balance that refills
//! continuously from elapsed wall-clock time at admit-time, rather than a
//! background ticker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Evict buckets idle for longer than this once the map grows past
/// `PRUNE_THRESHOLD` entries.
const IDLE_EVICTION: Duration = Duration::from_secs(600);
const PRUNE_THRESHOLD: usize = 1000;
const PRUNE_EVERY: u64 = 1000;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_minute: u32) -> Self {
        let refill_per_sec = rate_per_minute as f64 / 60.0;
        Bucket {
            tokens: rate_per_minute as f64 * 2.0,
            capacity: rate_per_minute as f64 * 2.0,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_admit(&mut self, now: Instant) -> Option<u64> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_secs = (deficit / self.refill_per_sec).ceil().max(1.0);
            Some(wait_secs as u64)
        }
    }

    /// Seconds until the bucket is back at full capacity, the value reported
    /// as `X-RateLimit-Reset` (spec.md §6).
    fn reset_secs(&self, now: Instant) -> u64 {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let projected = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        let deficit = self.capacity - projected;
        if deficit <= 0.0 {
            0
        } else {
            (deficit / self.refill_per_sec).ceil() as u64
        }
    }
}

pub struct RateLimitOutcome {
    pub retry_after_secs: u64,
    pub limit: u32,
    pub reset_secs: u64,
}

pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
}

pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    rate_per_minute: u32,
    admissions: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate_per_minute: u32) -> Self {
        RateLimiter {
            buckets: DashMap::new(),
            rate_per_minute,
            admissions: AtomicU64::new(0),
        }
    }

    /// Admit one request under `key`. Returns `Err` with retry-after
    /// guidance when the bucket is empty.
    pub fn check(&self, key: &str) -> Result<RateLimitHeaders, RateLimitOutcome> {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(self.rate_per_minute));

        let result = entry.try_admit(now);
        let reset_secs = entry.reset_secs(now);
        let remaining = entry.tokens as u32;
        drop(entry);

        let count = self.admissions.fetch_add(1, Ordering::Relaxed) + 1;
        if count % PRUNE_EVERY == 0 {
            self.prune(now);
        }

        match result {
            Some(retry_after_secs) => Err(RateLimitOutcome {
                retry_after_secs,
                limit: self.rate_per_minute,
                reset_secs,
            }),
            None => Ok(RateLimitHeaders {
                limit: self.rate_per_minute,
                remaining,
                reset_secs,
            }),
        }
    }

    /// Drop buckets untouched for `IDLE_EVICTION`, but only once the map has
    /// grown large enough to be worth the sweep (spec.md §4.2).
    fn prune(&self, now: Instant) {
        if self.buckets.len() <= PRUNE_THRESHOLD {
            return;
        }
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < IDLE_EVICTION);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(60);
        for _ in 0..120 {
            assert!(limiter.check("user:1").is_ok());
        }
        let result = limiter.check("user:1");
        assert!(result.is_err());
    }

    #[test]
    fn test_distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(1);
        for _ in 0..2 {
            assert!(limiter.check("user:1").is_ok());
        }
        assert!(limiter.check("user:2").is_ok());
    }

    #[test]
    fn test_retry_after_is_positive_when_exhausted() {
        let limiter = RateLimiter::new(60);
        for _ in 0..120 {
            let _ = limiter.check("apikey:9");
        }
        match limiter.check("apikey:9") {
            Err(outcome) => assert!(outcome.retry_after_secs >= 1),
            Ok(_) => panic!("expected exhaustion"),
        }
    }
}
