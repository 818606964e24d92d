//! Load balancing across route candidates for one model (spec.md §4.6, C6).
//!
//! Generalizes the teacher's `SmartRouter` (round-robin counter + EWMA
//! health-score map) into the four strategies the gateway's routing layer
//! supports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use rand::Rng;

use crate::catalog::RouteCandidate;

/// Per-provider counters from spec.md §4.6: "RecordResponse ... updates
/// total_requests, successful_requests, failed_requests, success_rate ...
/// avg_response_time via EWMA (alpha=0.1 after the first sample, which
/// seeds the average)".
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: f64,
}

impl ProviderStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Weighted,
    LeastConnections,
    Random,
}

impl Strategy {
    /// Parses `ChatCompletionRequest.metadata["lb_strategy"]`, defaulting to
    /// round-robin when absent or unrecognized.
    pub fn from_metadata(value: Option<&str>) -> Strategy {
        match value {
            Some("weighted") => Strategy::Weighted,
            Some("least_connections") => Strategy::LeastConnections,
            Some("random") => Strategy::Random,
            _ => Strategy::RoundRobin,
        }
    }
}

/// Below this EWMA health score a provider is treated as unavailable for
/// selection purposes, same as an explicit `Unhealthy` status (spec.md
/// §4.6 `IsAvailable()`), unless every candidate is this sickly — in which
/// case the whole set is offered rather than routing nowhere.
const HEALTH_SCORE_FLOOR: f64 = 0.2;

pub struct LoadBalancer {
    round_robin_counter: AtomicUsize,
    health_scores: RwLock<HashMap<i64, f64>>,
    active_connections: RwLock<HashMap<i64, u32>>,
    /// One mutex-free `RwLock` guarding all provider counters (spec.md §5:
    /// "one mutex per balancer; short critical sections only").
    stats: RwLock<HashMap<i64, ProviderStats>>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        LoadBalancer {
            round_robin_counter: AtomicUsize::new(0),
            health_scores: RwLock::new(HashMap::new()),
            active_connections: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Picks one candidate from an already-filtered, non-empty list. First
    /// narrows to `IsAvailable()` candidates (spec.md §4.6: not below the
    /// health-score floor), falling back to the full set if that would
    /// otherwise leave nothing to route to.
    pub fn select<'a>(&self, strategy: Strategy, candidates: &'a [RouteCandidate]) -> &'a RouteCandidate {
        debug_assert!(!candidates.is_empty());
        let healthy: Vec<&'a RouteCandidate> = candidates
            .iter()
            .filter(|c| self.health_score(c.provider.id) >= HEALTH_SCORE_FLOOR)
            .collect();
        let pool: Vec<&'a RouteCandidate> = if healthy.is_empty() { candidates.iter().collect() } else { healthy };

        match strategy {
            Strategy::RoundRobin => self.select_round_robin(&pool),
            Strategy::Weighted => self.select_weighted(&pool),
            Strategy::LeastConnections => self.select_least_connections(&pool),
            Strategy::Random => self.select_random(&pool),
        }
    }

    fn select_round_robin<'a>(&self, candidates: &[&'a RouteCandidate]) -> &'a RouteCandidate {
        let index = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index]
    }

    /// Weighted by `provider.priority`, falling back to uniform selection
    /// when every candidate has non-positive priority.
    fn select_weighted<'a>(&self, candidates: &[&'a RouteCandidate]) -> &'a RouteCandidate {
        let total_weight: i64 = candidates.iter().map(|c| c.provider.priority.max(0) as i64).sum();
        if total_weight <= 0 {
            return self.select_round_robin(candidates);
        }
        let mut pick = rand::thread_rng().gen_range(0..total_weight);
        for candidate in candidates {
            let weight = candidate.provider.priority.max(0) as i64;
            if pick < weight {
                return candidate;
            }
            pick -= weight;
        }
        candidates[candidates.len() - 1]
    }

    fn select_least_connections<'a>(&self, candidates: &[&'a RouteCandidate]) -> &'a RouteCandidate {
        let connections = self.active_connections.read().unwrap();
        candidates
            .iter()
            .min_by_key(|c| connections.get(&c.provider.id).copied().unwrap_or(0))
            .copied()
            .expect("candidates is non-empty")
    }

    fn select_random<'a>(&self, candidates: &[&'a RouteCandidate]) -> &'a RouteCandidate {
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates[index]
    }

    pub fn track_request_start(&self, provider_id: i64) {
        let mut connections = self.active_connections.write().unwrap();
        *connections.entry(provider_id).or_insert(0) += 1;
    }

    pub fn track_request_end(&self, provider_id: i64) {
        let mut connections = self.active_connections.write().unwrap();
        if let Some(count) = connections.get_mut(&provider_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// EWMA health update: `current*0.9 + 0.1*outcome`, `outcome` is `1.0`
    /// on success, `0.0` on failure.
    fn update_health_score(&self, provider_id: i64, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        let mut scores = self.health_scores.write().unwrap();
        let current = scores.entry(provider_id).or_insert(1.0);
        *current = *current * 0.9 + 0.1 * outcome;
    }

    pub fn health_score(&self, provider_id: i64) -> f64 {
        self.health_scores.read().unwrap().get(&provider_id).copied().unwrap_or(1.0)
    }

    /// `RecordResponse(provider_id, success, duration)` (spec.md §4.6):
    /// updates total/successful/failed counters and the EWMA
    /// `avg_response_time` (the first sample seeds the average rather than
    /// blending against zero), alongside the health-score EWMA `select`
    /// consults directly against `HEALTH_SCORE_FLOOR`.
    pub fn record_outcome(&self, provider_id: i64, success: bool, duration: Duration) {
        self.update_health_score(provider_id, success);

        let mut stats = self.stats.write().unwrap();
        let entry = stats.entry(provider_id).or_default();
        entry.total_requests += 1;
        if success {
            entry.successful_requests += 1;
        } else {
            entry.failed_requests += 1;
        }

        let sample_ms = duration.as_secs_f64() * 1000.0;
        entry.avg_response_time_ms = if entry.total_requests == 1 {
            sample_ms
        } else {
            entry.avg_response_time_ms * 0.9 + sample_ms * 0.1
        };
    }

    pub fn stats_for(&self, provider_id: i64) -> ProviderStats {
        self.stats.read().unwrap().get(&provider_id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthStatusKind, Provider, ProviderShape, ProviderStatus};

    fn candidate(id: i64, priority: i32) -> RouteCandidate {
        RouteCandidate {
            provider: Provider {
                id,
                slug: format!("p{id}"),
                name: format!("Provider {id}"),
                shape: ProviderShape::OpenAi,
                base_url: "https://example.com".to_string(),
                api_key: None,
                status: ProviderStatus::Active,
                health_status: HealthStatusKind::Healthy,
                priority,
                timeout_seconds: 30,
                retry_attempts: 2,
                headers: Default::default(),
            },
            upstream_model_name: "gpt-4".to_string(),
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = LoadBalancer::new();
        let candidates = vec![candidate(1, 1), candidate(2, 1), candidate(3, 1)];
        let picks: Vec<i64> = (0..3).map(|_| lb.select(Strategy::RoundRobin, &candidates).provider.id).collect();
        assert_eq!(picks, vec![1, 2, 3]);
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let lb = LoadBalancer::new();
        let candidates = vec![candidate(1, 1), candidate(2, 1)];
        lb.track_request_start(1);
        lb.track_request_start(1);
        lb.track_request_start(2);
        let picked = lb.select(Strategy::LeastConnections, &candidates);
        assert_eq!(picked.provider.id, 2);
    }

    #[test]
    fn test_record_outcome_decays_toward_failure() {
        let lb = LoadBalancer::new();
        assert_eq!(lb.health_score(1), 1.0);
        for _ in 0..20 {
            lb.record_outcome(1, false, Duration::from_millis(10));
        }
        assert!(lb.health_score(1) < 0.2);
    }

    #[test]
    fn test_select_skips_unhealthy_provider_when_alternative_exists() {
        let lb = LoadBalancer::new();
        for _ in 0..20 {
            lb.record_outcome(1, false, Duration::from_millis(10));
        }
        assert!(lb.health_score(1) < HEALTH_SCORE_FLOOR);

        let candidates = vec![candidate(1, 1), candidate(2, 1)];
        for _ in 0..5 {
            assert_eq!(lb.select(Strategy::RoundRobin, &candidates).provider.id, 2);
        }
    }

    #[test]
    fn test_select_falls_back_to_full_set_if_all_unhealthy() {
        let lb = LoadBalancer::new();
        for id in [1, 2] {
            for _ in 0..20 {
                lb.record_outcome(id, false, Duration::from_millis(10));
            }
        }
        let candidates = vec![candidate(1, 1), candidate(2, 1)];
        let picked = lb.select(Strategy::RoundRobin, &candidates);
        assert!(picked.provider.id == 1 || picked.provider.id == 2);
    }

    #[test]
    fn test_stats_start_at_zero() {
        let lb = LoadBalancer::new();
        let stats = lb.stats_for(1);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.success_rate(), 1.0);
    }

    #[test]
    fn test_stats_count_successes_and_failures() {
        let lb = LoadBalancer::new();
        lb.record_outcome(1, true, Duration::from_millis(100));
        lb.record_outcome(1, true, Duration::from_millis(100));
        lb.record_outcome(1, false, Duration::from_millis(100));

        let stats = lb.stats_for(1);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert!((stats.success_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_avg_response_time_seeded_by_first_sample() {
        let lb = LoadBalancer::new();
        lb.record_outcome(1, true, Duration::from_millis(200));
        assert!((lb.stats_for(1).avg_response_time_ms - 200.0).abs() < 1e-9);

        lb.record_outcome(1, true, Duration::from_millis(100));
        let expected = 200.0 * 0.9 + 100.0 * 0.1;
        assert!((lb.stats_for(1).avg_response_time_ms - expected).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_from_metadata_defaults() {
        assert_eq!(Strategy::from_metadata(None), Strategy::RoundRobin);
        assert_eq!(Strategy::from_metadata(Some("weighted")), Strategy::Weighted);
        assert_eq!(Strategy::from_metadata(Some("bogus")), Strategy::RoundRobin);
    }
}
