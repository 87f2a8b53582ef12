use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::engine::RateLimitInfo;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the admission-control core
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Quota exceeded for rule {rule}")]
    QuotaExceeded {
        rule: String,
        message: Option<String>,
        info: RateLimitInfo,
    },

    #[error("Unknown rule: {0}")]
    UnknownRule(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(e: redis::RedisError) -> Self {
        RateLimitError::StoreUnavailable(e.to_string())
    }
}

impl RateLimitError {
    /// True for failures of the shared counter store
    pub fn is_store_failure(&self) -> bool {
        matches!(self, RateLimitError::StoreUnavailable(_))
    }
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        match self {
            RateLimitError::QuotaExceeded { rule, message, info } => {
                let body = json!({
                    "error": "rate_limit_exceeded",
                    "message": format!("Rate limit exceeded for {}. Try again in {} seconds.", rule, info.retry_after_secs()),
                    "violation_message": message,
                    "limit": info.limit,
                    "remaining": info.clamped_remaining(),
                    "reset": info.reset.timestamp(),
                    "window": info.window.as_secs(),
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                info.apply_headers(response.headers_mut());
                if let Ok(value) = HeaderValue::from_str(&info.retry_after_secs().to_string()) {
                    response.headers_mut().insert("retry-after", value);
                }
                response
            }
            RateLimitError::UnknownRule(name) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "unknown_rule", "message": format!("Unknown rule: {}", name) })),
            )
                .into_response(),
            RateLimitError::InvalidRule(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_rule", "message": msg })),
            )
                .into_response(),
            RateLimitError::Config(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_request", "message": msg })),
            )
                .into_response(),
            RateLimitError::StoreUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "store_unavailable", "message": msg })),
            )
                .into_response(),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal", "message": other.to_string() })),
            )
                .into_response(),
        }
    }
}
