//! Error types for the federation engine
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Remote input never panics the process: parsing failures surface as
/// `Validation`, cryptographic failures as `InvalidSignature`/`Crypto`,
/// and delivery refusals as `PolicyRejected`.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error (500)
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote peer rejected or failed a federation request (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Remote actor could not be discovered (404)
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Signature verification failed (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Key generation or encoding failure (500)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Delivery refused by local policy: blocked domain or open circuit (409)
    #[error("Delivery rejected: {0}")]
    PolicyRejected(String),

    /// Rate limit exceeded (429)
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Short label used for the `errors_total` metric.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "database",
            AppError::Migration(_) => "migration",
            AppError::HttpClient(_) => "http_client",
            AppError::Federation(_) => "federation",
            AppError::Resolution(_) => "resolution",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::Crypto(_) => "crypto",
            AppError::PolicyRejected(_) => "policy_rejected",
            AppError::RateLimited(_) => "rate_limited",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::InvalidSignature(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Resolution(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::PolicyRejected(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone()),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Database(_) | AppError::Migration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Crypto(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Crypto error".to_string(),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.error_type()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_rejection_maps_to_conflict() {
        let response = AppError::PolicyRejected("circuit open".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn bad_signature_maps_to_unauthorized() {
        let response = AppError::InvalidSignature("verify failed".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
