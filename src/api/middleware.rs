//! API middleware: request logging, authentication, and rate limiting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::auth::extract_credential;
use crate::error::GatewayError;
use crate::types::Principal;

use super::state::AppState;

/// Request logging middleware. Also records `requests_total` and
/// `request_duration_seconds`, labeled by route path and response status.
pub async fn logging_middleware(State(state): State<Arc<AppState>>, request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path().to_string();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    state
        .metrics
        .requests_total
        .with_label_values(&[&path, status.as_str()])
        .inc();
    state
        .metrics
        .request_duration_seconds
        .with_label_values(&[&path])
        .observe(latency.as_secs_f64());

    if status.is_server_error() {
        warn!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            latency_ms = %latency.as_millis(),
            "Request failed"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            latency_ms = %latency.as_millis(),
            "Request completed"
        );
    }

    response
}

/// Outer guard applied before any credential is resolved (spec.md §4.2: a
/// per-IP bucket is always applied ahead of the per-principal one). Runs
/// first in the middleware stack so an unauthenticated flood is rejected
/// before it reaches the auth/database path.
pub async fn ip_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match state.gateway.check_ip_rate_limit(&addr.ip().to_string()) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            state.metrics.rate_limited_total.with_label_values(&["ip"]).inc();
            e.into_response()
        }
    }
}

/// Resolves the caller's [`Principal`] from the request's credentials and
/// inserts it into request extensions for downstream handlers. Rejects with
/// `401`/`403` before any handler runs if authentication fails.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let api_key_header = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    let api_key_query = request.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("api_key=").map(|v| v.to_string()))
    });

    let credential = match extract_credential(auth_header, api_key_header, api_key_query.as_deref()) {
        Some(c) => c,
        None => return GatewayError::MissingCredentials.into_response(),
    };

    let principal = match state.gateway.authenticate(credential).await {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };

    request.extensions_mut().insert(Arc::new(principal));
    next.run(request).await
}

/// Checks the caller's token bucket and attaches `X-RateLimit-*` headers to
/// the eventual response. Must run after [`auth_middleware`] so a
/// [`Principal`] is already in request extensions.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let principal = request.extensions().get::<Arc<Principal>>().cloned();
    let Some(principal) = principal else {
        return GatewayError::Internal("rate limit middleware ran before auth".to_string()).into_response();
    };

    match state.gateway.check_rate_limit(&principal) {
        Ok(headers) => {
            let mut response = next.run(request).await;
            if let (Ok(limit), Ok(remaining), Ok(reset)) = (
                axum::http::HeaderValue::from_str(&headers.limit.to_string()),
                axum::http::HeaderValue::from_str(&headers.remaining.to_string()),
                axum::http::HeaderValue::from_str(&headers.reset_secs.to_string()),
            ) {
                response.headers_mut().insert("X-RateLimit-Limit", limit);
                response.headers_mut().insert("X-RateLimit-Remaining", remaining);
                response.headers_mut().insert("X-RateLimit-Reset", reset);
            }
            response
        }
        Err(e) => {
            state.metrics.rate_limited_total.with_label_values(&["principal"]).inc();
            e.into_response()
        }
    }
}
