//! Provider, model, model-support and pricing repositories.

use sqlx::FromRow;

use crate::db::DbPool;
use crate::types::{
    HealthStatusKind, Model, ModelPricing, ModelType, PricingType, PricingUnit, Provider,
    ProviderModelSupport, ProviderShape, ProviderStatus,
};

#[derive(Debug, FromRow)]
struct ProviderRow {
    id: i64,
    slug: String,
    name: String,
    shape: String,
    base_url: String,
    api_key: Option<String>,
    status: String,
    health_status: String,
    priority: i32,
    timeout_seconds: i32,
    retry_attempts: i32,
    headers: Option<serde_json::Value>,
}

impl From<ProviderRow> for Provider {
    fn from(row: ProviderRow) -> Self {
        Provider {
            id: row.id,
            slug: row.slug,
            name: row.name,
            shape: match row.shape.as_str() {
                "anthropic" => ProviderShape::Anthropic,
                _ => ProviderShape::OpenAi,
            },
            base_url: row.base_url,
            api_key: row.api_key,
            status: match row.status.as_str() {
                "active" => ProviderStatus::Active,
                "maintenance" => ProviderStatus::Maintenance,
                _ => ProviderStatus::Inactive,
            },
            health_status: match row.health_status.as_str() {
                "healthy" => HealthStatusKind::Healthy,
                "unhealthy" => HealthStatusKind::Unhealthy,
                _ => HealthStatusKind::Unknown,
            },
            priority: row.priority,
            timeout_seconds: row.timeout_seconds.max(0) as u64,
            retry_attempts: row.retry_attempts.max(0) as u32,
            headers: row
                .headers
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
        }
    }
}

pub struct ProviderRepository {
    pool: DbPool,
}

impl ProviderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Provider>, sqlx::Error> {
        let row = sqlx::query_as::<_, ProviderRow>(
            r#"
            SELECT id, slug, name, shape, base_url, api_key, status, health_status,
                   priority, timeout_seconds, retry_attempts, headers
            FROM providers WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_active(&self) -> Result<Vec<Provider>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            r#"
            SELECT id, slug, name, shape, base_url, api_key, status, health_status,
                   priority, timeout_seconds, retry_attempts, headers
            FROM providers WHERE status = 'active' ORDER BY priority ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn set_health_status(&self, id: i64, status: HealthStatusKind) -> Result<(), sqlx::Error> {
        let value = match status {
            HealthStatusKind::Healthy => "healthy",
            HealthStatusKind::Unhealthy => "unhealthy",
            HealthStatusKind::Unknown => "unknown",
        };
        sqlx::query("UPDATE providers SET health_status = $1 WHERE id = $2")
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct ModelRow {
    id: i64,
    provider_id: i64,
    slug: String,
    upstream_name: String,
    model_type: String,
    context_length: i32,
    max_tokens: i32,
    supports_streaming: bool,
    supports_functions: bool,
}

impl From<ModelRow> for Model {
    fn from(row: ModelRow) -> Self {
        Model {
            id: row.id,
            provider_id: row.provider_id,
            slug: row.slug,
            upstream_name: row.upstream_name,
            model_type: match row.model_type.as_str() {
                "completion" => ModelType::Completion,
                "embedding" => ModelType::Embedding,
                "image" => ModelType::Image,
                _ => ModelType::Chat,
            },
            context_length: row.context_length.max(0) as u32,
            max_tokens: row.max_tokens.max(0) as u32,
            supports_streaming: row.supports_streaming,
            supports_functions: row.supports_functions,
        }
    }
}

pub struct ModelRepository {
    pool: DbPool,
}

impl ModelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_slug(&self, slug: &str) -> Result<Option<Model>, sqlx::Error> {
        let row = sqlx::query_as::<_, ModelRow>(
            r#"
            SELECT id, provider_id, slug, upstream_name, model_type, context_length,
                   max_tokens, supports_streaming, supports_functions
            FROM models WHERE slug = $1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_available(&self) -> Result<Vec<Model>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ModelRow>(
            r#"
            SELECT DISTINCT m.id, m.provider_id, m.slug, m.upstream_name, m.model_type,
                   m.context_length, m.max_tokens, m.supports_streaming, m.supports_functions
            FROM models m
            JOIN provider_model_support pms ON pms.model_slug = m.slug AND pms.enabled
            JOIN providers p ON p.id = pms.provider_id AND p.status = 'active'
            ORDER BY m.slug
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, FromRow)]
struct SupportRow {
    provider_id: i64,
    model_slug: String,
    upstream_model_name: Option<String>,
    enabled: bool,
    priority: i32,
}

impl From<SupportRow> for ProviderModelSupport {
    fn from(row: SupportRow) -> Self {
        ProviderModelSupport {
            provider_id: row.provider_id,
            model_slug: row.model_slug,
            upstream_model_name: row.upstream_model_name,
            enabled: row.enabled,
            priority: row.priority,
        }
    }
}

pub struct ModelSupportRepository {
    pool: DbPool,
}

impl ModelSupportRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// All enabled providers that can serve `model_slug`, ordered by the
    /// routing priority used by the load balancer (spec.md §4.5).
    pub async fn find_for_model(&self, model_slug: &str) -> Result<Vec<ProviderModelSupport>, sqlx::Error> {
        let rows = sqlx::query_as::<_, SupportRow>(
            r#"
            SELECT provider_id, model_slug, upstream_model_name, enabled, priority
            FROM provider_model_support
            WHERE model_slug = $1 AND enabled
            ORDER BY priority ASC
            "#,
        )
        .bind(model_slug)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, FromRow)]
struct PricingRow {
    model_id: i64,
    pricing_type: String,
    price_per_unit: sqlx::types::BigDecimal,
    unit: String,
    currency: String,
    effective_from: chrono::DateTime<chrono::Utc>,
    effective_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<PricingRow> for ModelPricing {
    fn from(row: PricingRow) -> Self {
        ModelPricing {
            model_id: row.model_id,
            pricing_type: match row.pricing_type.as_str() {
                "output" => PricingType::Output,
                "request" => PricingType::Request,
                _ => PricingType::Input,
            },
            price_per_unit: row.price_per_unit.to_string().parse().unwrap_or(0.0),
            unit: match row.unit.as_str() {
                "request" => PricingUnit::Request,
                "character" => PricingUnit::Character,
                _ => PricingUnit::Token,
            },
            currency: row.currency,
            effective_from: row.effective_from,
            effective_until: row.effective_until,
        }
    }
}

pub struct PricingRepository {
    pool: DbPool,
}

impl PricingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Every pricing row effective as of `at` for a model, across pricing
    /// types. Billing picks the most-recently-effective row per type
    /// (spec.md §4.10 tie-break: highest `effective_from` wins).
    pub async fn find_effective(
        &self,
        model_id: i64,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ModelPricing>, sqlx::Error> {
        let rows = sqlx::query_as::<_, PricingRow>(
            r#"
            SELECT model_id, pricing_type, price_per_unit, unit, currency,
                   effective_from, effective_until
            FROM model_pricing
            WHERE model_id = $1 AND effective_from <= $2
              AND (effective_until IS NULL OR effective_until > $2)
            ORDER BY effective_from DESC
            "#,
        )
        .bind(model_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
