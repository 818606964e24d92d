//! End-to-end scenarios that exercise the load balancer and provider
//! adapters together against real HTTP servers (spec.md §8, scenarios S4
//! and S5 plus rate-limit isolation). The request pipeline's quota/billing
//! steps sit behind `sqlx` repositories backed by Postgres, so this suite
//! targets the DB-independent slice of the pipeline: candidate selection,
//! adapter dispatch, and the retry/failover algorithm router.rs implements,
//! driven here directly rather than through the full `Gateway` so no
//! database is required to run it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tollgate::balancer::{LoadBalancer, Strategy};
use tollgate::catalog::RouteCandidate;
use tollgate::providers::{self};
use tollgate::ratelimit::RateLimiter;
use tollgate::types::{
    ChatCompletionRequest, HealthStatusKind, Message, Provider, ProviderShape, ProviderStatus,
};

fn openai_provider(id: i64, base_url: String, priority: i32) -> Provider {
    Provider {
        id,
        slug: format!("provider-{id}"),
        name: format!("Provider {id}"),
        shape: ProviderShape::OpenAi,
        base_url,
        api_key: Some("test-key".to_string()),
        status: ProviderStatus::Active,
        health_status: HealthStatusKind::Healthy,
        priority,
        timeout_seconds: 5,
        retry_attempts: 1,
        headers: HashMap::new(),
    }
}

fn chat_request(model: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![Message {
            role: "user".to_string(),
            content: "hi".to_string(),
        }],
        max_tokens: Some(5),
        temperature: 1.0,
        stream: false,
        tools: None,
        tool_choice: None,
        metadata: HashMap::new(),
    }
}

/// Mirrors `router.rs::route_request`'s retry loop closely enough to
/// exercise the same balancer/adapter seam without a Postgres-backed
/// `Catalog` in the loop, including the `max_retries` attempt cap.
async fn route_with_failover(
    balancer: &LoadBalancer,
    client: &Client,
    mut candidates: Vec<RouteCandidate>,
    request: &ChatCompletionRequest,
    max_retries: u32,
) -> Result<(i64, tollgate::types::AiResponse), tollgate::error::GatewayError> {
    let mut last_error = None;
    let mut attempts = 0;
    while !candidates.is_empty() && attempts < max_retries {
        attempts += 1;
        let picked_index = {
            let picked = balancer.select(Strategy::RoundRobin, &candidates);
            candidates.iter().position(|c| c.provider.id == picked.provider.id).unwrap()
        };
        let candidate = candidates.remove(picked_index);
        let adapter = providers::create_adapter(candidate.provider.clone(), client.clone());

        let start = Instant::now();
        let result = adapter.chat(request, &candidate.upstream_model_name).await;
        let elapsed = start.elapsed();

        match result {
            Ok(response) => {
                balancer.record_outcome(candidate.provider.id, true, elapsed);
                return Ok((candidate.provider.id, response));
            }
            Err(e) => {
                balancer.record_outcome(candidate.provider.id, false, elapsed);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(tollgate::error::GatewayError::NoProviderForModel("none".to_string())))
}

fn openai_success_body(total_tokens: u64) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello there"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": total_tokens},
    })
}

/// S4: P1 returns a transport-level failure, P2 supports the same model
/// and succeeds. The caller sees P2's response, and the balancer records
/// exactly one failure for P1 and one success for P2.
#[tokio::test]
async fn test_failover_to_second_provider_on_upstream_error() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body(5)))
        .mount(&healthy)
        .await;

    let p1 = openai_provider(1, failing.uri(), 1);
    let p2 = openai_provider(2, healthy.uri(), 2);
    let candidates = vec![
        RouteCandidate {
            provider: p1.clone(),
            upstream_model_name: "gpt-3.5-turbo".to_string(),
        },
        RouteCandidate {
            provider: p2.clone(),
            upstream_model_name: "gpt-3.5-turbo".to_string(),
        },
    ];

    let balancer = LoadBalancer::new();
    let client = Client::new();
    let request = chat_request("gpt-3.5-turbo");

    let (provider_id, response) = route_with_failover(&balancer, &client, candidates, &request, 3)
        .await
        .expect("second provider should serve the request");

    assert_eq!(provider_id, p2.id);
    assert_eq!(response.usage.total_tokens, 5);

    assert_eq!(balancer.stats_for(p1.id).failed_requests, 1);
    assert_eq!(balancer.stats_for(p1.id).successful_requests, 0);
    assert_eq!(balancer.stats_for(p2.id).successful_requests, 1);
    assert_eq!(balancer.stats_for(p2.id).failed_requests, 0);
}

/// S3 variant at the algorithm level: an empty candidate set (e.g. every
/// `ProviderModelSupport` row disabled) yields `NoProviderForModel`
/// immediately, with no adapter ever dispatched.
#[tokio::test]
async fn test_no_candidates_yields_no_provider_error() {
    let balancer = LoadBalancer::new();
    let client = Client::new();
    let request = chat_request("gpt-3.5-turbo");

    let result = route_with_failover(&balancer, &client, vec![], &request, 3).await;
    assert!(matches!(result, Err(tollgate::error::GatewayError::NoProviderForModel(_))));
}

/// spec.md §4.8 step 3: the retry loop is bounded by `max_retries`, not by
/// the candidate set's length. Three always-failing providers with
/// `max_retries == 2` must give up after two attempts, leaving the third
/// provider untried (and therefore unrecorded in the balancer's stats).
#[tokio::test]
async fn test_retry_loop_bounded_by_max_retries() {
    let mut servers = Vec::new();
    for _ in 0..3 {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        servers.push(server);
    }

    let candidates: Vec<RouteCandidate> = servers
        .iter()
        .enumerate()
        .map(|(i, s)| RouteCandidate {
            provider: openai_provider(i as i64 + 1, s.uri(), 1),
            upstream_model_name: "gpt-3.5-turbo".to_string(),
        })
        .collect();

    let balancer = LoadBalancer::new();
    let client = Client::new();
    let request = chat_request("gpt-3.5-turbo");

    let result = route_with_failover(&balancer, &client, candidates, &request, 2).await;
    assert!(result.is_err());

    let attempted: u64 = (1..=3).map(|id| balancer.stats_for(id).total_requests).sum();
    assert_eq!(attempted, 2, "only max_retries attempts should have been made");
}

/// S5: the upstream emits three SSE frames then `[DONE]`; the adapter
/// forwards exactly three chunks and the channel closes cleanly.
#[tokio::test]
async fn test_stream_relay_forwards_chunks_then_closes() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"id\":\"1\",\"choices\":[{\"delta\":{\"content\":\"one \"}}]}\n\n",
        "data: {\"id\":\"1\",\"choices\":[{\"delta\":{\"content\":\"two \"}}]}\n\n",
        "data: {\"id\":\"1\",\"choices\":[{\"delta\":{\"content\":\"three\"}}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":3,\"total_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = openai_provider(1, server.uri(), 1);
    let adapter = providers::create_adapter(provider, Client::new());
    let mut request = chat_request("gpt-3.5-turbo");
    request.stream = true;

    let (tx, mut rx) = mpsc::channel(16);
    adapter.stream(&request, "gpt-3.5-turbo", tx).await.expect("stream should start cleanly");

    let mut chunks = Vec::new();
    while let Some(item) = rx.recv().await {
        chunks.push(item.expect("no relay errors expected"));
    }

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[2].usage.as_ref().map(|u| u.total_tokens), Some(4));
}

/// Property 6: two keys never share a bucket, even under the same
/// configured rate.
#[tokio::test]
async fn test_rate_limiter_isolates_distinct_keys() {
    let limiter = RateLimiter::new(2);
    assert!(limiter.check("apikey:a").is_ok());
    assert!(limiter.check("apikey:a").is_ok());
    assert!(limiter.check("apikey:a").is_err());

    // Key B is untouched by A's exhaustion.
    assert!(limiter.check("apikey:b").is_ok());
}

/// Property 5 / S5 boundary: once a chunk has reached the caller, a
/// mid-stream upstream error must not trigger failover — the helper mirrors
/// `router.rs::route_stream_request`'s `first_chunk_sent` gate.
#[tokio::test]
async fn test_stream_failover_boundary_blocks_after_first_chunk() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let server = MockServer::start().await;
    // One good frame, then the connection is cut before `[DONE]`.
    let body = "data: {\"id\":\"1\",\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = openai_provider(1, server.uri(), 1);
    let adapter = providers::create_adapter(provider, Client::new());
    let mut request = chat_request("gpt-3.5-turbo");
    request.stream = true;

    let first_chunk_sent = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel(16);
    adapter.stream(&request, "gpt-3.5-turbo", tx).await.expect("stream should start cleanly");

    let mut forwarded = 0;
    while let Some(item) = rx.recv().await {
        if item.is_ok() {
            forwarded += 1;
            first_chunk_sent.store(true, Ordering::SeqCst);
        }
    }

    assert_eq!(forwarded, 1);
    assert!(first_chunk_sent.load(Ordering::SeqCst));
}
