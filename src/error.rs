use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for the sync service
#[derive(Error, Debug)]
pub enum PulseError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Request validation errors — rejected before any store mutation
    #[error("Bad request: {0}")]
    BadRequest(String),

    // Authentication errors — always fail closed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Stream token rejected: {0}")]
    Token(#[from] TokenError),

    #[error("Rate limited: retry after {reset_at}")]
    RateLimited {
        reset_at: chrono::DateTime<chrono::Utc>,
    },

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for PulseError
pub type Result<T> = std::result::Result<T, PulseError>;

/// Stream-token verification failures. Every variant maps to the same
/// caller-visible outcome (401) so a forged token learns nothing from the
/// failure mode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has invalid format")]
    BadFormat,

    #[error("token signature mismatch")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token claims invalid")]
    BadClaims,
}

impl PulseError {
    /// Stable machine-readable code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            PulseError::BadRequest(_) => "bad_request",
            PulseError::Unauthorized(_) | PulseError::Token(_) => "unauthorized",
            PulseError::RateLimited { .. } => "rate_limited",
            PulseError::Config(_) => "config",
            _ => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            PulseError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PulseError::Unauthorized(_) | PulseError::Token(_) => StatusCode::UNAUTHORIZED,
            PulseError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PulseError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Token failures collapse to a single message so the failure mode
        // is not distinguishable from outside.
        let message = match &self {
            PulseError::Token(_) => "invalid stream token".to_string(),
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_collapse_to_unauthorized() {
        for err in [
            TokenError::BadFormat,
            TokenError::BadSignature,
            TokenError::Expired,
            TokenError::BadClaims,
        ] {
            assert_eq!(PulseError::from(err).code(), "unauthorized");
        }
    }

    #[test]
    fn bad_request_code() {
        let err = PulseError::BadRequest("type is required".to_string());
        assert_eq!(err.code(), "bad_request");
    }
}
