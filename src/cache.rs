//! Cache & invalidation layer (spec.md §4.4, C4).
//!
//! Read-through key/value store with TTLs and pattern-based invalidation.
//! Every operation degrades to "miss" on a backing-store error rather than
//! propagating — callers always have a direct-repository fallback.

use std::time::Duration;

use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};

/// Key scheme from spec.md §4.4, kept in one place so every caller builds
/// keys the same way.
pub mod keys {
    pub fn user(id: i64) -> String {
        format!("user:{id}")
    }
    pub fn user_by_username(username: &str) -> String {
        format!("user:username:{username}")
    }
    pub fn apikey(hash: &str) -> String {
        format!("apikey:{hash}")
    }
    pub fn models_available() -> String {
        "models:available".to_string()
    }
    pub fn providers_active() -> String {
        "providers:active".to_string()
    }
    pub fn user_quotas(user_id: i64) -> String {
        format!("user_quotas:{user_id}")
    }
    pub fn quota_usage(user_id: i64, quota_type: &str, period_key: &str) -> String {
        format!("quota_usage:{user_id}:{quota_type}:{period_key}")
    }
}

/// TTLs in seconds, named after the keys they apply to (spec.md §4.4).
pub mod ttl {
    pub const USER: u64 = 600;
    pub const USER_BY_USERNAME: u64 = 300;
    pub const APIKEY: u64 = 900;
    pub const MODELS_AVAILABLE: u64 = 1800;
    pub const PROVIDERS_ACTIVE: u64 = 1800;
    pub const USER_QUOTAS: u64 = 300;
    pub const QUOTA_USAGE: u64 = 120;
}

/// Render a wall-clock period window as the deterministic `period_key`
/// string from spec.md §4.4 (e.g. minute -> `YYYYMMDDHHMM`).
pub fn period_key(period: crate::types::QuotaPeriod, at: chrono::DateTime<chrono::Utc>) -> String {
    use crate::types::QuotaPeriod::*;
    match period {
        Minute => at.format("%Y%m%d%H%M").to_string(),
        Hour => at.format("%Y%m%d%H").to_string(),
        Day => at.format("%Y%m%d").to_string(),
        Month => at.format("%Y%m").to_string(),
        Total => "total".to_string(),
    }
}

#[derive(Clone)]
pub struct Cache {
    manager: Option<redis::aio::ConnectionManager>,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> Self {
        match redis::Client::open(redis_url) {
            Ok(client) => match client.get_tokio_connection_manager().await {
                Ok(manager) => {
                    tracing::info!("cache: connected to redis");
                    Cache { manager: Some(manager) }
                }
                Err(e) => {
                    tracing::warn!("cache: redis connection failed, caching disabled: {e}");
                    Cache { manager: None }
                }
            },
            Err(e) => {
                tracing::warn!("cache: invalid redis url, caching disabled: {e}");
                Cache { manager: None }
            }
        }
    }

    /// For tests / in-memory-only deployments: a cache with no backing
    /// connection. All reads miss, all writes/deletes are no-ops.
    pub fn disabled() -> Self {
        Cache { manager: None }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut manager = self.manager.clone()?;
        match manager.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("cache get({key}) failed, falling back to store: {e}");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let Some(mut manager) = self.manager.clone() else { return };
        let Ok(raw) = serde_json::to_string(value) else { return };
        if let Err(e) = manager
            .set_ex::<_, _, ()>(key, raw, ttl_secs)
            .await
        {
            tracing::warn!("cache set({key}) failed: {e}");
        }
    }

    pub async fn delete(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let Some(mut manager) = self.manager.clone() else { return };
        if let Err(e) = manager.del::<_, ()>(keys).await {
            tracing::warn!("cache delete({keys:?}) failed: {e}");
        }
    }

    /// Delete every key matching a glob-style pattern, via non-blocking
    /// `SCAN` rather than `KEYS` (spec.md §4.4: "must never fail the
    /// request" and must not stall the server).
    pub async fn delete_pattern(&self, pattern: &str) {
        let Some(mut manager) = self.manager.clone() else { return };
        let mut cursor: u64 = 0;
        let mut matched = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut manager)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("cache scan({pattern}) failed: {e}");
                    return;
                }
            };
            matched.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        self.delete(&matched).await;
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_some()
    }
}

/// Sleep helper retained for callers that want to honor a TTL expressed as
/// a `Duration` rather than raw seconds (kept tiny and local; no need for a
/// crate dependency for this).
pub fn ttl_duration(seconds: u64) -> Duration {
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuotaPeriod;
    use chrono::TimeZone;

    #[test]
    fn test_period_key_minute() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 3, 5, 14, 37, 0).unwrap();
        assert_eq!(period_key(QuotaPeriod::Minute, at), "202603051437");
    }

    #[test]
    fn test_period_key_day() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 3, 5, 14, 37, 0).unwrap();
        assert_eq!(period_key(QuotaPeriod::Day, at), "20260305");
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let cache = Cache::disabled();
        cache.set("user:1", &"value", 60).await;
        let got: Option<String> = cache.get("user:1").await;
        assert!(got.is_none());
    }

    #[test]
    fn test_key_scheme() {
        assert_eq!(keys::user(42), "user:42");
        assert_eq!(keys::quota_usage(1, "tokens", "202603051400"), "quota_usage:1:tokens:202603051400");
    }
}
