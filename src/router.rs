//! Retry-and-failover routing over a resolved candidate set (spec.md §4.8, C8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use reqwest::Client;
use tokio::sync::mpsc;

use crate::balancer::{LoadBalancer, Strategy};
use crate::catalog::Catalog;
use crate::error::{GatewayError, Result};
use crate::providers::{self, ProviderAdapter};
use crate::types::{AiResponse, ChatCompletionRequest, StreamChunk, TokenUsage};

/// `req_{epoch_ms}_{8 hex chars}`, the format spec.md §6 names.
pub fn generate_request_id() -> String {
    let ms = chrono::Utc::now().timestamp_millis();
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("req_{ms}_{}", hex::encode(suffix))
}

pub struct RouteOutcome {
    pub response: AiResponse,
    pub provider_id: i64,
    pub provider_slug: String,
    pub model_used: String,
    pub duration_ms: u64,
    pub attempts: u32,
}

/// Terminal state of a streamed request, once the bridge loop below has
/// finished forwarding chunks to the caller.
pub struct StreamRouteOutcome {
    pub provider_id: i64,
    pub provider_slug: String,
    pub model_used: String,
    /// Upstream-reported terminal usage if the provider sent one, else an
    /// estimate derived from the forwarded content (spec.md §4.9/§9).
    pub usage: TokenUsage,
}

pub struct Router {
    catalog: Arc<Catalog>,
    balancer: Arc<LoadBalancer>,
    http_client: Client,
    max_retries: u32,
    token_estimation_fudge_factor: f64,
}

impl Router {
    pub fn new(
        catalog: Arc<Catalog>,
        balancer: Arc<LoadBalancer>,
        http_client: Client,
        max_retries: u32,
        token_estimation_fudge_factor: f64,
    ) -> Self {
        Router {
            catalog,
            balancer,
            http_client,
            max_retries,
            token_estimation_fudge_factor,
        }
    }

    /// Tries candidates in balancer-selected order until one succeeds or
    /// the candidate set is exhausted, bounded by `max_retries` attempts
    /// (spec.md §4.8 step 3: "Loop, bounded by max_retries (default 3)").
    pub async fn route_request(&self, request: &ChatCompletionRequest) -> Result<RouteOutcome> {
        let mut candidates = self.catalog.resolve(&request.model).await?;
        let strategy = Strategy::from_metadata(request.metadata.get("lb_strategy").map(String::as_str));

        let mut attempts = 0;
        let mut last_error = None;
        let start = Instant::now();

        while !candidates.is_empty() && attempts < self.max_retries {
            let picked_index = {
                let picked = self.balancer.select(strategy, &candidates);
                candidates.iter().position(|c| c.provider.id == picked.provider.id).unwrap()
            };
            let candidate = candidates.remove(picked_index);
            attempts += 1;

            let adapter = providers::create_adapter(candidate.provider.clone(), self.http_client.clone());
            self.balancer.track_request_start(candidate.provider.id);
            let attempt_start = Instant::now();
            let result = adapter.chat(request, &candidate.upstream_model_name).await;
            let attempt_duration = attempt_start.elapsed();
            self.balancer.track_request_end(candidate.provider.id);

            match result {
                Ok(response) => {
                    self.balancer.record_outcome(candidate.provider.id, true, attempt_duration);
                    return Ok(RouteOutcome {
                        response,
                        provider_id: candidate.provider.id,
                        provider_slug: candidate.provider.slug,
                        model_used: candidate.upstream_model_name,
                        duration_ms: start.elapsed().as_millis() as u64,
                        attempts,
                    });
                }
                Err(e) => {
                    self.balancer.record_outcome(candidate.provider.id, false, attempt_duration);
                    tracing::warn!(
                        provider = %candidate.provider.slug,
                        attempt = attempts,
                        "upstream call failed, trying next candidate: {e}"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::NoProviderForModel(request.model.clone())))
    }

    /// Streaming variant. Failover across candidates is only legal before
    /// the first chunk reaches the client (spec.md §4.8): once
    /// `first_chunk_sent` flips, an upstream failure ends the stream rather
    /// than silently restarting it on a different provider.
    pub async fn route_stream_request(
        &self,
        request: &ChatCompletionRequest,
        out: mpsc::Sender<Result<StreamChunk>>,
    ) -> Result<StreamRouteOutcome> {
        let mut candidates = self.catalog.resolve(&request.model).await?;
        let strategy = Strategy::from_metadata(request.metadata.get("lb_strategy").map(String::as_str));
        let first_chunk_sent = Arc::new(AtomicBool::new(false));

        let mut last_error = None;
        let mut attempts = 0;

        while !candidates.is_empty() && attempts < self.max_retries {
            let picked_index = {
                let picked = self.balancer.select(strategy, &candidates);
                candidates.iter().position(|c| c.provider.id == picked.provider.id).unwrap()
            };
            let candidate = candidates.remove(picked_index);
            attempts += 1;

            let adapter = providers::create_adapter(candidate.provider.clone(), self.http_client.clone());
            let (tx, mut rx) = mpsc::channel::<Result<StreamChunk>>(64);

            self.balancer.track_request_start(candidate.provider.id);
            let attempt_start = Instant::now();
            let upstream_model = candidate.upstream_model_name.clone();
            let stream_task = {
                let request = request.clone();
                let adapter = adapter.clone();
                tokio::spawn(async move { adapter.stream(&request, &upstream_model, tx).await })
            };

            let mut forwarded_any = false;
            let mut stream_error = None;
            let mut terminal_usage = None;
            let mut accumulated_content = String::new();
            while let Some(item) = rx.recv().await {
                match item {
                    Ok(chunk) => {
                        forwarded_any = true;
                        first_chunk_sent.store(true, Ordering::SeqCst);
                        accumulated_content.push_str(&chunk.content);
                        if let Some(usage) = &chunk.usage {
                            terminal_usage = Some(usage.clone());
                        }
                        if out.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }
            let _ = stream_task.await;
            self.balancer.track_request_end(candidate.provider.id);
            let attempt_duration = attempt_start.elapsed();

            match stream_error {
                None => {
                    self.balancer.record_outcome(candidate.provider.id, true, attempt_duration);
                    let usage = terminal_usage.unwrap_or_else(|| {
                        let estimated = adapter.estimate_tokens(&accumulated_content, self.token_estimation_fudge_factor);
                        TokenUsage {
                            prompt_tokens: 0,
                            completion_tokens: estimated,
                            total_tokens: estimated,
                        }
                    });
                    return Ok(StreamRouteOutcome {
                        provider_id: candidate.provider.id,
                        provider_slug: candidate.provider.slug,
                        model_used: candidate.upstream_model_name,
                        usage,
                    });
                }
                Some(e) if !first_chunk_sent.load(Ordering::SeqCst) && !forwarded_any => {
                    self.balancer.record_outcome(candidate.provider.id, false, attempt_duration);
                    tracing::warn!(provider = %candidate.provider.slug, "stream failed before first chunk, trying next candidate: {e}");
                    last_error = Some(e);
                }
                Some(e) => {
                    self.balancer.record_outcome(candidate.provider.id, false, attempt_duration);
                    let _ = out.send(Err(GatewayError::UpstreamFailure(e.to_string()))).await;
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::NoProviderForModel(request.model.clone())))
    }
}

/// Wall-clock deadline check used before each upstream call/forward step so
/// a disconnected or overlong request is abandoned promptly without a
/// cancellation-token abstraction (spec.md §5).
pub fn past_deadline(started_at: Instant, timeout: Duration) -> bool {
    started_at.elapsed() >= timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_id_format() {
        let id = generate_request_id();
        assert!(id.starts_with("req_"));
        let parts: Vec<&str> = id.trim_start_matches("req_").split('_').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].len(), 8);
    }

    #[test]
    fn test_past_deadline() {
        let start = Instant::now();
        assert!(!past_deadline(start, Duration::from_secs(10)));
        assert!(past_deadline(start, Duration::from_millis(0)));
    }
}
