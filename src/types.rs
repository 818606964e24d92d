//! Core domain types shared across the gateway (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Users & credentials
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub status: UserStatus,
    /// Signed decimal balance in USD. May go negative after a debit.
    pub balance: f64,
}

impl User {
    /// Admission gate from spec.md §4.1 / §9: active and a positive balance.
    pub fn can_authenticate(&self) -> bool {
        self.status == UserStatus::Active && self.balance > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Inactive,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub name: Option<String>,
    pub status: ApiKeyStatus,
    /// Allow-list of provider slugs; `None` means full access.
    pub allowed_providers: Option<Vec<String>>,
    /// Allow-list of model slugs; `None` means full access.
    pub allowed_models: Option<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_usable(&self) -> bool {
        if self.status != ApiKeyStatus::Active {
            return false;
        }
        match self.expires_at {
            Some(exp) => exp > Utc::now(),
            None => true,
        }
    }

    pub fn permits_model(&self, model_slug: &str) -> bool {
        match &self.allowed_models {
            Some(list) => list.iter().any(|m| m == model_slug),
            None => true,
        }
    }
}

/// The authenticated caller attached to request context by C1.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: User,
    pub api_key: Option<ApiKey>,
}

impl Principal {
    /// Rate-limit / quota identity preference: api_key_id > user_id.
    pub fn rate_limit_key(&self) -> String {
        match &self.api_key {
            Some(k) => format!("apikey:{}", k.id),
            None => format!("user:{}", self.user.id),
        }
    }

    /// `true` when no API key is attached (session auth) or the attached
    /// key's allow-list permits `model_slug`.
    pub fn api_key_permits(&self, model_slug: &str) -> bool {
        match &self.api_key {
            Some(k) => k.permits_model(model_slug),
            None => true,
        }
    }
}

// ============================================================================
// Providers & models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Active,
    Inactive,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatusKind {
    Healthy,
    Unhealthy,
    Unknown,
}

/// The wire shape a provider speaks — determines request/response
/// translation in `providers::adapter` (REDESIGN FLAG #1: tagged variant,
/// not one struct per vendor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderShape {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub shape: ProviderShape,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub status: ProviderStatus,
    pub health_status: HealthStatusKind,
    pub priority: i32,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Provider {
    /// `IsAvailable()` (spec.md §4.6): active status and not known-unhealthy.
    /// `Unknown` (no health check run yet) is treated as usable; only an
    /// explicit `Unhealthy` verdict excludes a provider.
    pub fn is_usable(&self) -> bool {
        self.status == ProviderStatus::Active && self.health_status != HealthStatusKind::Unhealthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Chat,
    Completion,
    Embedding,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub provider_id: i64,
    pub slug: String,
    pub upstream_name: String,
    pub model_type: ModelType,
    pub context_length: u32,
    pub max_tokens: u32,
    pub supports_streaming: bool,
    pub supports_functions: bool,
}

/// The many-to-many table routing actually consults (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderModelSupport {
    pub provider_id: i64,
    pub model_slug: String,
    pub upstream_model_name: Option<String>,
    pub enabled: bool,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingType {
    Input,
    Output,
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingUnit {
    Token,
    Request,
    Character,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model_id: i64,
    pub pricing_type: PricingType,
    pub price_per_unit: f64,
    pub unit: PricingUnit,
    pub currency: String,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
}

// ============================================================================
// Quotas
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    Requests,
    Tokens,
    Cost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Minute,
    Hour,
    Day,
    Month,
    Total,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub id: i64,
    pub user_id: i64,
    pub quota_type: QuotaType,
    pub period: QuotaPeriod,
    pub limit_value: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub id: i64,
    pub quota_id: i64,
    pub user_id: i64,
    pub used_value: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// In-memory event published by `ConsumeQuota`, never persisted directly
/// (spec.md §3).
#[derive(Debug, Clone)]
pub struct QuotaUsageEvent {
    pub user_id: i64,
    pub quota_type: QuotaType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
}

// ============================================================================
// Usage & billing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: i64,
    pub user_id: i64,
    pub api_key_id: Option<i64>,
    pub provider_id: i64,
    pub model_id: i64,
    pub request_id: String,
    pub method: String,
    pub endpoint: String,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    Usage,
    Recharge,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingStatus {
    Pending,
    Processed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    pub id: i64,
    pub user_id: i64,
    pub usage_log_id: Option<i64>,
    pub amount: f64,
    pub currency: String,
    pub billing_type: BillingType,
    pub description: Option<String>,
    pub status: BillingStatus,
    pub processed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Chat/completion request & response DTOs (OpenAI-compatible surface)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, validator::Validate)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, validator::Validate)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[validate(length(min = 1, message = "messages must not be empty"))]
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub stream: bool,
    pub tools: Option<Vec<serde_json::Value>>,
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_temperature() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn total_or_sum(&self) -> u32 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: Message,
    pub finish_reason: String,
}

/// The gateway's canonical response shape — adapters translate into this
/// regardless of upstream wire format (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: TokenUsage,
    pub error: Option<String>,
}

/// One SSE frame translated into the gateway's canonical shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub response: AiResponse,
    pub usage: TokenUsage,
    pub cost: f64,
    pub provider: String,
    pub model: String,
    pub duration_ms: u64,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_admission_gate() {
        let mut user = User {
            id: 1,
            username: "a".into(),
            email: "a@b.com".into(),
            password_hash: None,
            status: UserStatus::Active,
            balance: 10.0,
        };
        assert!(user.can_authenticate());
        user.balance = 0.0;
        assert!(!user.can_authenticate());
        user.balance = -5.0;
        assert!(!user.can_authenticate());
        user.balance = 10.0;
        user.status = UserStatus::Suspended;
        assert!(!user.can_authenticate());
    }

    #[test]
    fn test_api_key_permits_model() {
        let key = ApiKey {
            id: 1,
            user_id: 1,
            key_hash: "x".into(),
            key_prefix: "ak_abcd1234".into(),
            name: None,
            status: ApiKeyStatus::Active,
            allowed_providers: None,
            allowed_models: Some(vec!["gpt-4".to_string()]),
            expires_at: None,
            last_used_at: None,
        };
        assert!(key.permits_model("gpt-4"));
        assert!(!key.permits_model("claude-3"));
    }

    #[test]
    fn test_token_usage_total_fallback() {
        let usage = TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 0 };
        assert_eq!(usage.total_or_sum(), 15);
    }

    fn provider(status: ProviderStatus, health: HealthStatusKind) -> Provider {
        Provider {
            id: 1,
            slug: "p".into(),
            name: "P".into(),
            shape: ProviderShape::OpenAi,
            base_url: "https://example.com".into(),
            api_key: None,
            status,
            health_status: health,
            priority: 1,
            timeout_seconds: 30,
            retry_attempts: 2,
            headers: Default::default(),
        }
    }

    #[test]
    fn test_provider_is_usable_requires_active_and_not_unhealthy() {
        assert!(provider(ProviderStatus::Active, HealthStatusKind::Healthy).is_usable());
        assert!(provider(ProviderStatus::Active, HealthStatusKind::Unknown).is_usable());
        assert!(!provider(ProviderStatus::Active, HealthStatusKind::Unhealthy).is_usable());
        assert!(!provider(ProviderStatus::Inactive, HealthStatusKind::Healthy).is_usable());
    }
}
