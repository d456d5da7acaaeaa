//! OAuth token exchange against YNAB's token endpoint.
//!
//! Handles both the `authorization_code` and the `refresh_token` grants.
//! No retries happen here; callers decide what a failure means.

use super::provider::YnabOAuthConfig;
use crate::config::YnabConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Longest token lifetime accepted from the provider (one year).
const MAX_EXPIRES_IN_SECONDS: i64 = 366 * 24 * 60 * 60;

/// Validated token endpoint response.
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: i64,
    pub refresh_token: String,
    /// Unix seconds at which the provider issued the token
    pub created_at: i64,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl TokenResponse {
    fn validate(self) -> Result<Self, OAuthExchangeError> {
        if self.access_token.is_empty() {
            return Err(OAuthExchangeError::InvalidResponse(
                "access_token is empty".to_string(),
            ));
        }
        if self.refresh_token.is_empty() {
            return Err(OAuthExchangeError::InvalidResponse(
                "refresh_token is empty".to_string(),
            ));
        }
        if self.expires_in <= 0 || self.expires_in > MAX_EXPIRES_IN_SECONDS {
            return Err(OAuthExchangeError::InvalidResponse(format!(
                "expires_in out of range: {}",
                self.expires_in
            )));
        }
        Ok(self)
    }
}

/// Error body returned by the provider on a non-2xx response.
#[derive(Deserialize, Debug, Default)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthExchangeError {
    #[error("{grant} request failed: {source}")]
    Transport {
        grant: GrantType,
        #[source]
        source: reqwest::Error,
    },

    #[error(
        "{grant} rejected with status {status}: {}",
        rejection_detail(.code, .description)
    )]
    Rejected {
        grant: GrantType,
        status: u16,
        /// Provider `error` field, when the body was parseable
        code: Option<String>,
        description: Option<String>,
    },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

fn rejection_detail<'a>(code: &'a Option<String>, description: &'a Option<String>) -> &'a str {
    description
        .as_deref()
        .or(code.as_deref())
        .unwrap_or("unknown error")
}

impl OAuthExchangeError {
    /// Provider error code (`invalid_grant`, ...) if one was returned.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            OAuthExchangeError::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Token endpoint operations used by the vault and the callback route.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchanges an authorization code for a token pair.
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OAuthExchangeError>;

    /// Trades a refresh token for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthExchangeError>;
}

/// reqwest-backed YNAB token client.
#[derive(Clone, Debug)]
pub struct YnabOAuthClient {
    http: reqwest::Client,
    config: YnabOAuthConfig,
}

impl YnabOAuthClient {
    /// Builds a client whose every request carries the configured timeout.
    pub fn from_config(config: &YnabConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            config: YnabOAuthConfig::from_config(config),
        })
    }

    pub fn config(&self) -> &YnabOAuthConfig {
        &self.config
    }

    async fn request_token(
        &self,
        grant: GrantType,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, OAuthExchangeError> {
        debug!(grant = grant.as_str(), url = %self.config.token_url, "Requesting YNAB token");

        let response = self
            .http
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|source| OAuthExchangeError::Transport { grant, source })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| OAuthExchangeError::Transport { grant, source })?;

        if !status.is_success() {
            let parsed: ProviderErrorBody = serde_json::from_str(&body).unwrap_or_default();
            return Err(OAuthExchangeError::Rejected {
                grant,
                status: status.as_u16(),
                code: parsed.error,
                description: parsed.error_description,
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| OAuthExchangeError::InvalidResponse(e.to_string()))?;

        let token = token.validate()?;

        debug!(
            grant = grant.as_str(),
            expires_in = token.expires_in,
            "YNAB token request successful"
        );

        Ok(token)
    }
}

#[async_trait]
impl TokenExchange for YnabOAuthClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OAuthExchangeError> {
        let grant = GrantType::AuthorizationCode;
        self.request_token(
            grant,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("grant_type", grant.as_str()),
                ("code", code),
            ],
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthExchangeError> {
        let grant = GrantType::RefreshToken;
        self.request_token(
            grant,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", grant.as_str()),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }
}
