//! Handlers for the chat/completions, models, usage, auth, and health
//! surfaces (spec.md §6).

use std::sync::Arc;

use axum::extract::{Extension, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{GatewayError, Result};
use crate::types::{ChatCompletionRequest, Message, Model, Principal, UsageLog};

use super::state::AppState;

/// Headers spec.md §6 requires on every successful request.
fn success_headers(request_id: &str, provider: &str, model: &str, duration_ms: u64) -> [(&'static str, String); 4] {
    [
        ("X-Request-ID", request_id.to_string()),
        ("X-Provider", provider.to_string()),
        ("X-Model", model.to_string()),
        ("X-Duration-Ms", duration_ms.to_string()),
    ]
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Arc<Principal>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    if request.stream {
        return super::stream::chat_completions_stream(state, principal, request).await;
    }

    match state
        .gateway
        .process_request(&principal, request, "/v1/chat/completions")
        .await
    {
        Ok(result) => {
            let headers = success_headers(
                &result.request_id,
                &result.provider_slug,
                &result.response.model,
                result.duration_ms,
            );
            (headers, Json(result.response)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Legacy `prompt`-based completions (spec.md §6): translated into one
/// user message and run through the same chat pipeline.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
}

fn default_temperature() -> f32 {
    1.0
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Arc<Principal>>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    let chat_request = ChatCompletionRequest {
        model: request.model,
        messages: vec![Message {
            role: "user".to_string(),
            content: request.prompt,
        }],
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: request.stream,
        tools: None,
        tool_choice: None,
        metadata: request.metadata,
    };

    if chat_request.stream {
        return super::stream::chat_completions_stream(state, principal, chat_request).await;
    }

    match state.gateway.process_request(&principal, chat_request, "/v1/completions").await {
        Ok(result) => {
            let headers = success_headers(
                &result.request_id,
                &result.provider_slug,
                &result.response.model,
                result.duration_ms,
            );
            (headers, Json(result.response)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Model>>> {
    Ok(Json(state.catalog.list_available_models().await?))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub limit: Option<i64>,
}

pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Arc<Principal>>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<UsageLog>>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let logs = state.usage_logs.list_for_user(principal.user.id, limit).await?;
    Ok(Json(logs))
}

// ============================================================================
// Health (spec.md §6: GET /health, /health/ready, /health/live, /health/stats,
// /health/version — all unauthenticated)
// ============================================================================

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub async fn health_live() -> Json<serde_json::Value> {
    Json(json!({"status": "alive"}))
}

/// Ready only once both backing stores are reachable; degraded dependencies
/// (cache) don't fail readiness since the cache layer already degrades
/// gracefully to the repository (spec.md §4.4).
pub async fn health_ready(State(state): State<Arc<AppState>>) -> Response {
    let db_ok = state.is_database_connected().await;
    let body = json!({
        "status": if db_ok { "ready" } else { "not_ready" },
        "database": db_ok,
        "cache": state.is_cache_connected(),
    });
    if db_ok {
        Json(body).into_response()
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

pub async fn health_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.quota_consumer.stats();
    Json(json!({
        "uptime_seconds": state.uptime_seconds(),
        "quota_consumer": {
            "total": stats.total.load(std::sync::atomic::Ordering::Relaxed),
            "processed": stats.processed.load(std::sync::atomic::Ordering::Relaxed),
            "failed": stats.failed.load(std::sync::atomic::Ordering::Relaxed),
            "dropped": stats.dropped.load(std::sync::atomic::Ordering::Relaxed),
            "batch_count": stats.batch_count.load(std::sync::atomic::Ordering::Relaxed),
        },
        "quota_dropped_events": state.gateway.dropped_quota_events(),
    }))
}

pub async fn health_version() -> Json<serde_json::Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    state.metrics.render()
}

// ============================================================================
// Auth (spec.md §6: login/register/refresh public; profile/change-password/
// recharge authenticated)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>> {
    let token = state.auth.login(&body.username, &body.password).await?;
    Ok(Json(TokenResponse { token }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<TokenResponse>> {
    let token = state.auth.register(&body.username, &body.email, &body.password).await?;
    Ok(Json(TokenResponse { token }))
}

/// Session JWTs are short-lived but stateless; "refresh" simply re-mints a
/// fresh token for the already-authenticated principal's user id rather than
/// tracking a separate refresh-token table (no such entity in spec.md §3).
pub async fn refresh(State(state): State<Arc<AppState>>, Extension(principal): Extension<Arc<Principal>>) -> Result<Json<TokenResponse>> {
    let token = state.auth.mint_session(principal.user.id)?;
    Ok(Json(TokenResponse { token }))
}

pub async fn profile(Extension(principal): Extension<Arc<Principal>>) -> Json<crate::types::User> {
    Json(principal.user.clone())
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Arc<Principal>>,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>> {
    state
        .auth
        .change_password(principal.user.id, &body.old_password, &body.new_password)
        .await?;
    Ok(Json(json!({"success": true})))
}

#[derive(Debug, Deserialize)]
pub struct RechargeRequest {
    pub amount: f64,
    pub description: Option<String>,
}

pub async fn recharge(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Arc<Principal>>,
    Json(body): Json<RechargeRequest>,
) -> Result<Json<crate::types::User>> {
    if body.amount <= 0.0 {
        return Err(GatewayError::InvalidRequest("amount must be positive".to_string()));
    }
    let user = state
        .ledger
        .recharge(principal.user.id, body.amount, body.description.as_deref())
        .await?;
    Ok(Json(user))
}
