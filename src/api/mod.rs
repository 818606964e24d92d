//! HTTP surface: route table, shared state, and middleware (spec.md §6).

pub mod admin_handlers;
pub mod handlers;
pub mod middleware;
pub mod state;
pub mod stream;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Builds the full axum router: public routes, then authenticated routes
/// layered with rate limiting, all behind the outer per-IP guard and
/// request logger (spec.md §4.2: IP bucket checked ahead of auth).
pub fn build_router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::health_ready))
        .route("/health/live", get(handlers::health_live))
        .route("/health/stats", get(handlers::health_stats))
        .route("/health/version", get(handlers::health_version))
        .route("/metrics", get(handlers::metrics))
        .route("/auth/login", post(handlers::login))
        .route("/auth/register", post(handlers::register));

    let authenticated = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/usage", get(handlers::get_usage))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/profile", get(handlers::profile))
        .route("/auth/change-password", post(handlers::change_password))
        .route("/auth/recharge", post(handlers::recharge))
        .route("/admin/users", get(admin_handlers::list_users).post(admin_handlers::create_user))
        .route(
            "/admin/api-keys",
            get(admin_handlers::list_api_keys).post(admin_handlers::create_api_key),
        )
        .route("/admin/api-keys/:id", delete(admin_handlers::revoke_api_key))
        .route("/admin/quotas", get(admin_handlers::list_quotas).post(admin_handlers::create_quota))
        .route("/admin/quotas/:id", delete(admin_handlers::delete_quota))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit_middleware))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth_middleware));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::logging_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::ip_rate_limit_middleware))
        .layer(cors_layer(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    if state.config.server.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<axum::http::HeaderValue> = state
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

