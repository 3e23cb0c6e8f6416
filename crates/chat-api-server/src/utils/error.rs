use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::services::llm::RouterError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("LLM error: {0}")]
    LlmError(String),
}

/// Failures of the conversation store tiers
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::StorageError(msg) => {
                tracing::error!("Storage error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "StorageError",
                    "Conversation storage is unavailable, please try again".to_string(),
                )
            }
            ApiError::LlmError(msg) => {
                tracing::error!("LLM error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "LlmError", user_facing_message(&msg))
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("Conversation {} not found", id)),
            other => ApiError::StorageError(other.to_string()),
        }
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        ApiError::LlmError(err.to_string())
    }
}

const MAX_USER_ERROR_CHARS: usize = 200;

static RATE_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b429\b|rate.?limit|quota|too many requests").expect("valid regex"));
static AUTH_FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b401\b|api.?key|unauthori[sz]ed|authentication").expect("valid regex"));
static MODEL_MISSING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)model\b.*\bnot found|model_not_found|unknown model").expect("valid regex"));
static SECRET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(sk-[a-z0-9_-]{8,}|key=[^&\s]+|bearer\s+\S+)").expect("valid regex"));

/// Map a raw internal error to text that is safe to show a user.
///
/// Known failure classes get a fixed explanation. Anything else is trimmed
/// to a short prefix with credentials masked.
pub fn user_facing_message(raw: &str) -> String {
    if RATE_LIMIT.is_match(raw) {
        return "The AI service is receiving too many requests right now. Please wait a moment and try again.".to_string();
    }
    if AUTH_FAILURE.is_match(raw) {
        return "The AI service rejected our credentials. Please contact support if this continues.".to_string();
    }
    if MODEL_MISSING.is_match(raw) {
        return "The requested AI model is not available. Please try a different model.".to_string();
    }
    if raw.contains("All providers failed") || raw.contains("No providers available") {
        return "All AI providers are temporarily unavailable. Please try again shortly.".to_string();
    }

    let masked = SECRET.replace_all(raw, "[redacted]");
    let short: String = masked.chars().take(MAX_USER_ERROR_CHARS).collect();
    if short.trim().is_empty() {
        "Something went wrong while generating a response.".to_string()
    } else {
        format!("Something went wrong while generating a response: {}", short)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_error_classes() {
        assert!(user_facing_message("API error 429: slow down").contains("too many requests"));
        assert!(user_facing_message("Incorrect API key provided").contains("credentials"));
        assert!(user_facing_message("API error 404: model 'gpt-9' not found").contains("not available"));
        assert!(user_facing_message("All providers failed").contains("temporarily unavailable"));
    }

    #[test]
    fn test_unknown_errors_are_truncated() {
        let raw = "x".repeat(1000);
        let message = user_facing_message(&raw);
        assert!(message.chars().count() <= MAX_USER_ERROR_CHARS + 60);
    }

    #[test]
    fn test_credentials_are_masked() {
        let message = user_facing_message("upstream said: bearer abc.def for ?key=secret123");
        assert!(!message.contains("abc.def"));
        assert!(!message.contains("secret123"));
    }

    #[test]
    fn test_store_not_found_maps_to_404() {
        let id = Uuid::new_v4();
        let response = ApiError::from(StoreError::NotFound(id)).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::from(StoreError::Cache("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_status_per_variant() {
        let cases = [
            (ApiError::NotFound("c".into()), StatusCode::NOT_FOUND),
            (ApiError::BadRequest("b".into()), StatusCode::BAD_REQUEST),
            (ApiError::StorageError("s".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (ApiError::LlmError("l".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
