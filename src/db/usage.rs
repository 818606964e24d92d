//! Usage log and billing ledger repositories (spec.md §4.9, §4.10).

use sqlx::FromRow;

use crate::db::DbPool;
use crate::types::{BillingRecord, BillingStatus, BillingType, UsageLog};

#[derive(Debug, FromRow)]
struct UsageLogRow {
    id: i64,
    user_id: i64,
    api_key_id: Option<i64>,
    provider_id: i64,
    model_id: i64,
    request_id: String,
    method: String,
    endpoint: String,
    input_tokens: i32,
    output_tokens: i32,
    total_tokens: i32,
    request_size: i32,
    response_size: i32,
    duration_ms: i64,
    status_code: i32,
    error_message: Option<String>,
    cost: sqlx::types::BigDecimal,
}

impl From<UsageLogRow> for UsageLog {
    fn from(row: UsageLogRow) -> Self {
        UsageLog {
            id: row.id,
            user_id: row.user_id,
            api_key_id: row.api_key_id,
            provider_id: row.provider_id,
            model_id: row.model_id,
            request_id: row.request_id,
            method: row.method,
            endpoint: row.endpoint,
            input_tokens: row.input_tokens.max(0) as u32,
            output_tokens: row.output_tokens.max(0) as u32,
            total_tokens: row.total_tokens.max(0) as u32,
            request_size: row.request_size.max(0) as u32,
            response_size: row.response_size.max(0) as u32,
            duration_ms: row.duration_ms.max(0) as u64,
            status_code: row.status_code.max(0) as u16,
            error_message: row.error_message,
            cost: row.cost.to_string().parse().unwrap_or(0.0),
        }
    }
}

pub struct UsageLogRepository {
    pool: DbPool,
}

impl UsageLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(&self, entry: NewUsageLog<'_>) -> Result<UsageLog, sqlx::Error> {
        let row = sqlx::query_as::<_, UsageLogRow>(
            r#"
            INSERT INTO usage_logs (
                user_id, api_key_id, provider_id, model_id, request_id, method, endpoint,
                input_tokens, output_tokens, total_tokens, request_size, response_size,
                duration_ms, status_code, error_message, cost
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id, user_id, api_key_id, provider_id, model_id, request_id, method, endpoint,
                      input_tokens, output_tokens, total_tokens, request_size, response_size,
                      duration_ms, status_code, error_message, cost
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.api_key_id)
        .bind(entry.provider_id)
        .bind(entry.model_id)
        .bind(entry.request_id)
        .bind(entry.method)
        .bind(entry.endpoint)
        .bind(entry.input_tokens as i32)
        .bind(entry.output_tokens as i32)
        .bind(entry.total_tokens as i32)
        .bind(entry.request_size as i32)
        .bind(entry.response_size as i32)
        .bind(entry.duration_ms as i64)
        .bind(entry.status_code as i32)
        .bind(entry.error_message)
        .bind(sqlx::types::BigDecimal::try_from(entry.cost).unwrap_or_default())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn list_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<UsageLog>, sqlx::Error> {
        let rows = sqlx::query_as::<_, UsageLogRow>(
            r#"
            SELECT id, user_id, api_key_id, provider_id, model_id, request_id, method, endpoint,
                   input_tokens, output_tokens, total_tokens, request_size, response_size,
                   duration_ms, status_code, error_message, cost
            FROM usage_logs WHERE user_id = $1 ORDER BY id DESC LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Fields needed to record one completed request. A plain struct rather
/// than a dozen-argument constructor (spec.md §4.9).
pub struct NewUsageLog<'a> {
    pub user_id: i64,
    pub api_key_id: Option<i64>,
    pub provider_id: i64,
    pub model_id: i64,
    pub request_id: &'a str,
    pub method: &'a str,
    pub endpoint: &'a str,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub request_size: u32,
    pub response_size: u32,
    pub duration_ms: u64,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub cost: f64,
}

#[derive(Debug, FromRow)]
struct BillingRecordRow {
    id: i64,
    user_id: i64,
    usage_log_id: Option<i64>,
    amount: sqlx::types::BigDecimal,
    currency: String,
    billing_type: String,
    description: Option<String>,
    status: String,
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<BillingRecordRow> for BillingRecord {
    fn from(row: BillingRecordRow) -> Self {
        BillingRecord {
            id: row.id,
            user_id: row.user_id,
            usage_log_id: row.usage_log_id,
            amount: row.amount.to_string().parse().unwrap_or(0.0),
            currency: row.currency,
            billing_type: match row.billing_type.as_str() {
                "recharge" => BillingType::Recharge,
                "refund" => BillingType::Refund,
                _ => BillingType::Usage,
            },
            description: row.description,
            status: match row.status.as_str() {
                "processed" => BillingStatus::Processed,
                "failed" => BillingStatus::Failed,
                _ => BillingStatus::Pending,
            },
            processed_at: row.processed_at,
        }
    }
}

pub struct BillingRepository {
    pool: DbPool,
}

impl BillingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_pending(
        &self,
        user_id: i64,
        usage_log_id: Option<i64>,
        amount: f64,
        billing_type: BillingType,
        description: Option<&str>,
    ) -> Result<BillingRecord, sqlx::Error> {
        let type_str = match billing_type {
            BillingType::Usage => "usage",
            BillingType::Recharge => "recharge",
            BillingType::Refund => "refund",
        };
        let row = sqlx::query_as::<_, BillingRecordRow>(
            r#"
            INSERT INTO billing_records (user_id, usage_log_id, amount, currency, billing_type, description, status)
            VALUES ($1, $2, $3, 'USD', $4, $5, 'pending')
            RETURNING id, user_id, usage_log_id, amount, currency, billing_type, description, status, processed_at
            "#,
        )
        .bind(user_id)
        .bind(usage_log_id)
        .bind(sqlx::types::BigDecimal::try_from(amount).unwrap_or_default())
        .bind(type_str)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn mark_processed(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE billing_records SET status = 'processed', processed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE billing_records SET status = 'failed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
