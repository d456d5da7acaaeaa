//! Coarse error kinds surfaced to HTTP clients.
//!
//! Internal failures (crypto, network, SQLite) are logged where they happen
//! and converted into one of these kinds. The response body is always
//! `{"error": ..., "message": ...}` with a fixed message; the underlying
//! cause never reaches the client.

use crate::api::oauth::OAuthExchangeError;
use crate::config::ConfigError;
use crate::credentials::CipherError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("decryption failed: {0}")]
    Decryption(#[from] CipherError),

    #[error("token exchange failed: {0}")]
    OAuthExchange(#[from] OAuthExchangeError),

    #[error("invalid request: {0}")]
    Validation(&'static str),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("request origin rejected")]
    Forbidden,

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Stable JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Decryption(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::OAuthExchange(_) => StatusCode::BAD_GATEWAY,
            BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
            BrokerError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            BrokerError::Forbidden => StatusCode::FORBIDDEN,
            BrokerError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing body. Internal kinds get a generic message.
    pub fn body(&self) -> ErrorBody {
        let (error, message) = match self {
            BrokerError::Configuration(_)
            | BrokerError::Decryption(_)
            | BrokerError::Storage(_) => (
                "Internal Server Error",
                "An internal error occurred".to_string(),
            ),
            BrokerError::OAuthExchange(_) => (
                "Bad Gateway",
                "Failed to communicate with YNAB".to_string(),
            ),
            BrokerError::Validation(msg) => ("Bad Request", msg.to_string()),
            BrokerError::AuthenticationRequired => {
                ("Unauthorized", "You must be logged in".to_string())
            }
            BrokerError::Forbidden => ("Forbidden", "Invalid origin".to_string()),
            BrokerError::RateLimitExceeded { retry_after_secs } => (
                "Too Many Requests",
                format!(
                    "Rate limit exceeded. Try again in {} seconds.",
                    retry_after_secs
                ),
            ),
        };
        ErrorBody { error, message }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        if let BrokerError::RateLimitExceeded { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
