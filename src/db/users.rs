//! User & API key repositories.

use sqlx::FromRow;

use crate::db::DbPool;
use crate::types::{ApiKey, ApiKeyStatus, User, UserStatus};

#[derive(Debug, FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: String,
    password_hash: Option<String>,
    status: String,
    balance: sqlx::types::BigDecimal,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            status: match row.status.as_str() {
                "active" => UserStatus::Active,
                "suspended" => UserStatus::Suspended,
                _ => UserStatus::Inactive,
            },
            balance: row.balance.to_string().parse().unwrap_or(0.0),
        }
    }
}

pub struct UserRepository {
    pool: DbPool,
}

impl UserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, password_hash, status, balance FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, password_hash, status, balance FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn create(&self, username: &str, email: &str, password_hash: &str) -> Result<User, sqlx::Error> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (username, email, password_hash, status, balance)
            VALUES ($1, $2, $3, 'active', 0)
            RETURNING id, username, email, password_hash, status, balance
            "#,
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Admin listing surface (spec.md §6 `/admin/users`): no per-user
    /// filter, newest first.
    pub async fn list_all(&self, limit: i64) -> Result<Vec<User>, sqlx::Error> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, password_hash, status, balance FROM users ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn update_password(&self, user_id: i64, password_hash: &str) -> Result<User, sqlx::Error> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            UPDATE users SET password_hash = $2
            WHERE id = $1
            RETURNING id, username, email, password_hash, status, balance
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Atomically adjust balance by a signed delta (negative = debit). No
    /// floor is enforced — spec.md §9 permits a negative post-debit balance.
    pub async fn adjust_balance(&self, user_id: i64, delta: f64) -> Result<User, sqlx::Error> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            UPDATE users SET balance = balance + $2
            WHERE id = $1
            RETURNING id, username, email, password_hash, status, balance
            "#,
        )
        .bind(user_id)
        .bind(sqlx::types::BigDecimal::try_from(delta).unwrap_or_default())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}

#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: i64,
    user_id: i64,
    key_hash: String,
    key_prefix: String,
    name: Option<String>,
    status: String,
    allowed_providers: Option<serde_json::Value>,
    allowed_models: Option<serde_json::Value>,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        ApiKey {
            id: row.id,
            user_id: row.user_id,
            key_hash: row.key_hash,
            key_prefix: row.key_prefix,
            name: row.name,
            status: match row.status.as_str() {
                "active" => ApiKeyStatus::Active,
                "revoked" => ApiKeyStatus::Revoked,
                _ => ApiKeyStatus::Inactive,
            },
            allowed_providers: row
                .allowed_providers
                .and_then(|v| serde_json::from_value(v).ok()),
            allowed_models: row.allowed_models.and_then(|v| serde_json::from_value(v).ok()),
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
        }
    }
}

pub struct ApiKeyRepository {
    pool: DbPool,
}

impl ApiKeyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, sqlx::Error> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            SELECT id, user_id, key_hash, key_prefix, name, status,
                   allowed_providers, allowed_models, expires_at, last_used_at
            FROM api_keys WHERE key_hash = $1
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<ApiKey>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            SELECT id, user_id, key_hash, key_prefix, name, status,
                   allowed_providers, allowed_models, expires_at, last_used_at
            FROM api_keys WHERE user_id = $1 ORDER BY id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn create(
        &self,
        user_id: i64,
        key_hash: &str,
        key_prefix: &str,
        name: Option<&str>,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<ApiKey, sqlx::Error> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            INSERT INTO api_keys (user_id, key_hash, key_prefix, name, status, expires_at)
            VALUES ($1, $2, $3, $4, 'active', $5)
            RETURNING id, user_id, key_hash, key_prefix, name, status,
                      allowed_providers, allowed_models, expires_at, last_used_at
            "#,
        )
        .bind(user_id)
        .bind(key_hash)
        .bind(key_prefix)
        .bind(name)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Best-effort, non-blocking update — callers should not await a
    /// failure here to reject the request (spec.md §4.1).
    pub async fn touch_last_used(&self, id: i64) {
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;
    }

    pub async fn revoke(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE api_keys SET status = 'revoked' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
