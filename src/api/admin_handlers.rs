//! Thin admin CRUD surface over users, API keys, and quotas (spec.md §6
//! `/admin/users`, `/admin/api-keys`, `/admin/quotas`). The data model (§3)
//! defines no separate admin role, so these routes sit behind the same
//! authenticated-principal gate as the rest of the API — see DESIGN.md for
//! the Open Question this resolves.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::hash_api_key;
use crate::error::{GatewayError, Result};
use crate::types::{ApiKey, Quota, QuotaPeriod, QuotaType, User};

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

// ============================================================================
// /admin/users
// ============================================================================

pub async fn list_users(State(state): State<Arc<AppState>>, Query(q): Query<ListQuery>) -> Result<Json<Vec<User>>> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(state.users.list_all(limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

pub async fn create_user(State(state): State<Arc<AppState>>, Json(body): Json<CreateUserRequest>) -> Result<Json<User>> {
    let hash = bcrypt::hash(&body.password, bcrypt::DEFAULT_COST).map_err(|e| GatewayError::Internal(e.to_string()))?;
    let user = state.users.create(&body.username, &body.email, &hash).await?;
    Ok(Json(user))
}

// ============================================================================
// /admin/api-keys
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiKeyQuery {
    pub user_id: i64,
}

pub async fn list_api_keys(State(state): State<Arc<AppState>>, Query(q): Query<ApiKeyQuery>) -> Result<Json<Vec<ApiKey>>> {
    Ok(Json(state.api_keys.list_for_user(q.user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub user_id: i64,
    pub name: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    #[serde(flatten)]
    pub key: ApiKey,
    /// Shown exactly once at creation time; only the hash is persisted.
    pub plaintext: String,
}

/// `ak_` + 64 lowercase hex, per spec.md §6's API-key plaintext format.
fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ak_{}", hex::encode(bytes))
}

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<Json<CreatedApiKey>> {
    let plaintext = generate_api_key();
    let hash = hash_api_key(&plaintext);
    let prefix = plaintext.chars().take(8).collect::<String>();
    let key = state
        .api_keys
        .create(body.user_id, &hash, &prefix, body.name.as_deref(), body.expires_at)
        .await?;
    Ok(Json(CreatedApiKey { key, plaintext }))
}

pub async fn revoke_api_key(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<serde_json::Value>> {
    let revoked = state.api_keys.revoke(id).await?;
    if !revoked {
        return Err(GatewayError::NotFound(format!("api key {id}")));
    }
    Ok(Json(json!({"success": true})))
}

// ============================================================================
// /admin/quotas
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct QuotaQuery {
    pub user_id: i64,
}

pub async fn list_quotas(State(state): State<Arc<AppState>>, Query(q): Query<QuotaQuery>) -> Result<Json<Vec<Quota>>> {
    Ok(Json(state.quotas.list_for_user(q.user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateQuotaRequest {
    pub user_id: i64,
    pub quota_type: QuotaType,
    pub period: QuotaPeriod,
    pub limit_value: f64,
}

pub async fn create_quota(State(state): State<Arc<AppState>>, Json(body): Json<CreateQuotaRequest>) -> Result<Json<Quota>> {
    let quota = state
        .quotas
        .create(body.user_id, body.quota_type, body.period, body.limit_value)
        .await?;
    Ok(Json(quota))
}

/// Soft-delete: marks the quota inactive rather than removing the row, so
/// historical `quota_usage` rows keep a valid foreign key (spec.md §3).
pub async fn delete_quota(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<serde_json::Value>> {
    let found = state.quotas.set_active(id, false).await?;
    if !found {
        return Err(GatewayError::NotFound(format!("quota {id}")));
    }
    Ok(Json(json!({"success": true})))
}
