//! YNAB OAuth endpoint configuration.
//!
//! YNAB does not support PKCE. The authorization request is protected only
//! by the single-use `state` token from the state store.

use crate::config::YnabConfig;

/// OAuth provider configuration
#[derive(Clone)]
pub struct YnabOAuthConfig {
    /// OAuth authorization endpoint URL
    pub authorize_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    pub client_id: String,

    pub client_secret: String,

    /// Fixed redirect URI registered with YNAB
    pub redirect_uri: String,
}

impl std::fmt::Debug for YnabOAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YnabOAuthConfig")
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl YnabOAuthConfig {
    pub fn from_config(config: &YnabConfig) -> Self {
        let base = config.oauth_base_url.trim_end_matches('/');
        Self {
            authorize_url: format!("{}/oauth/authorize", base),
            token_url: format!("{}/oauth/token", base),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        }
    }

    /// Build authorization URL carrying the CSRF `state`
    pub fn build_authorization_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&state={}",
            self.authorize_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(state)
        )
    }
}
