//! Crate-wide error type and the standard error envelope (spec.md §6, §7).

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;

/// Top-level gateway error. Each variant maps to exactly one canonical
/// error code and HTTP status from spec.md §6.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("credential revoked")]
    CredentialRevoked,

    #[error("credential expired")]
    CredentialExpired,

    #[error("user account is not active")]
    UserInactive,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        limit: u32,
        reset_secs: u64,
    },

    #[error("quota exceeded for {quota_type}, resets at {reset_at}")]
    QuotaExceeded { quota_type: String, reset_at: String },

    #[error("no provider available for model: {0}")]
    NoProviderForModel(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The canonical error code from spec.md §6.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingCredentials => "MISSING_CREDENTIALS",
            GatewayError::InvalidCredentials => "INVALID_CREDENTIALS",
            GatewayError::CredentialRevoked => "INVALID_CREDENTIALS",
            GatewayError::CredentialExpired => "API_KEY_EXPIRED",
            GatewayError::UserInactive => "USER_INACTIVE",
            GatewayError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            GatewayError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            GatewayError::NoProviderForModel(_) => "NO_PROVIDER_FOR_MODEL",
            GatewayError::UpstreamFailure(_) => "UPSTREAM_FAILURE",
            GatewayError::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Database(_) => "INTERNAL_ERROR",
            GatewayError::Cache(_) => "INTERNAL_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// User-safe message: upstream/internal detail is redacted per spec.md
    /// §7 ("final failure surfaces as UPSTREAM_FAILURE with underlying
    /// message redacted to user-safe text").
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::UpstreamFailure(_) => "upstream provider request failed".to_string(),
            GatewayError::Database(_) | GatewayError::Cache(_) | GatewayError::Internal(_) => {
                "an internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingCredentials
            | GatewayError::InvalidCredentials
            | GatewayError::CredentialRevoked => StatusCode::UNAUTHORIZED,
            GatewayError::CredentialExpired => StatusCode::UNAUTHORIZED,
            GatewayError::UserInactive => StatusCode::FORBIDDEN,
            GatewayError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoProviderForModel(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            GatewayError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Database(_) | GatewayError::Cache(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let message = self.user_message();
        let status = self.status();
        let mut headers = Vec::new();
        if let GatewayError::RateLimited {
            retry_after_secs,
            limit,
            reset_secs,
        } = &self
        {
            headers.push(("Retry-After".to_string(), retry_after_secs.to_string()));
            headers.push(("X-RateLimit-Limit".to_string(), limit.to_string()));
            headers.push(("X-RateLimit-Remaining".to_string(), "0".to_string()));
            headers.push(("X-RateLimit-Reset".to_string(), reset_secs.to_string()));
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": message,
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        let mut response = (status, body).into_response();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_bytes()),
                axum::http::HeaderValue::from_str(&value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_code() {
        let err = GatewayError::QuotaExceeded {
            quota_type: "requests".to_string(),
            reset_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_insufficient_balance_is_402() {
        assert_eq!(GatewayError::InsufficientBalance.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_no_provider_is_503() {
        let err = GatewayError::NoProviderForModel("gpt-9".into());
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "NO_PROVIDER_FOR_MODEL");
    }
}
