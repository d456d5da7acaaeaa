//! Broker configuration.
//!
//! Values come from an optional TOML file (path in `YNAB_BROKER_CONFIG`)
//! and are then overlaid with environment variables. Secrets are normally
//! supplied through the environment only.
//!
//! [`BrokerConfig::validate`] runs before the server binds; a production
//! configuration without `ENCRYPTION_SALT` never starts.

use serde::Deserialize;
use std::time::Duration;

/// Salt used for key derivation outside production when none is configured.
pub const DEFAULT_ENCRYPTION_SALT: &str = "ynab-mcp-token-encryption";

/// Minimum length of the secret fed into key derivation.
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(
        "ENCRYPTION_SALT must be set in production. Generate one with: openssl rand -hex 32"
    )]
    MissingSaltInProduction,

    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "production" | "prod" => Some(Environment::Production),
            "test" => Some(Environment::Test),
            _ => None,
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// Complete broker configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ynab: YnabConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`.
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "ynab-broker.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// YNAB OAuth application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct YnabConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Must match the redirect URI registered with YNAB.
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default = "default_oauth_base_url")]
    pub oauth_base_url: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_oauth_base_url() -> String {
    "https://app.ynab.com".to_string()
}

fn default_http_timeout() -> u64 {
    15
}

impl Default for YnabConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            oauth_base_url: default_oauth_base_url(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

impl YnabConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Dedicated token encryption secret. Falls back to `auth_secret`.
    #[serde(default)]
    pub token_encryption_key: Option<String>,
    /// Identity provider signing secret (`BETTER_AUTH_SECRET`).
    #[serde(default)]
    pub auth_secret: Option<String>,
    #[serde(default)]
    pub encryption_salt: Option<String>,
    /// Shared secret for the cron cleanup endpoint.
    #[serde(default)]
    pub cron_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Background sweep interval. 0 disables the in-process sweep.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval() -> u64 {
    300
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

impl BrokerConfig {
    /// Loads the optional TOML file named by `YNAB_BROKER_CONFIG`, then
    /// applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("YNAB_BROKER_CONFIG") {
            Ok(path) if !path.is_empty() => load_config(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlays values from `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = get("DATABASE_URL") {
            self.database.path = v
                .strip_prefix("sqlite://")
                .or_else(|| v.strip_prefix("sqlite:"))
                .unwrap_or(v.as_str())
                .to_string();
        }
        if let Some(v) = get("YNAB_CLIENT_ID") {
            self.ynab.client_id = v;
        }
        if let Some(v) = get("YNAB_CLIENT_SECRET") {
            self.ynab.client_secret = v;
        }
        if let Some(v) = get("YNAB_REDIRECT_URI") {
            self.ynab.redirect_uri = v;
        }
        if let Some(v) = get("YNAB_OAUTH_BASE_URL") {
            self.ynab.oauth_base_url = v;
        }
        if let Some(v) = get("YNAB_HTTP_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.ynab.http_timeout_seconds = n;
            }
        }
        if let Some(v) = get("APP_ENV").or_else(|| get("NODE_ENV")) {
            if let Some(env) = Environment::parse(&v) {
                self.security.environment = env;
            }
        }
        if let Some(v) = get("TOKEN_ENCRYPTION_KEY") {
            self.security.token_encryption_key = Some(v);
        }
        if let Some(v) = get("BETTER_AUTH_SECRET") {
            self.security.auth_secret = Some(v);
        }
        if let Some(v) = get("ENCRYPTION_SALT") {
            self.security.encryption_salt = Some(v);
        }
        if let Some(v) = get("CRON_SECRET") {
            self.security.cron_secret = Some(v);
        }
        if let Some(v) = get("STATE_CLEANUP_INTERVAL_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.state.cleanup_interval_seconds = n;
            }
        }
    }

    /// Secret used for token key derivation.
    pub fn encryption_secret(&self) -> Result<&str, ConfigError> {
        let secret = self
            .security
            .token_encryption_key
            .as_deref()
            .or(self.security.auth_secret.as_deref())
            .ok_or(ConfigError::Missing(
                "TOKEN_ENCRYPTION_KEY or BETTER_AUTH_SECRET",
            ))?;

        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                field: "TOKEN_ENCRYPTION_KEY",
                reason: format!("must be at least {} characters", MIN_SECRET_LEN),
            });
        }
        Ok(secret)
    }

    /// Salt used for token key derivation. Production requires an explicit one.
    pub fn encryption_salt(&self) -> Result<&str, ConfigError> {
        match self.security.encryption_salt.as_deref() {
            Some(salt) => Ok(salt),
            None if self.security.environment.is_production() => {
                Err(ConfigError::MissingSaltInProduction)
            }
            None => Ok(DEFAULT_ENCRYPTION_SALT),
        }
    }

    /// Checks everything the server needs before it binds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ynab.client_id.is_empty() {
            return Err(ConfigError::Missing("YNAB_CLIENT_ID"));
        }
        if self.ynab.client_secret.is_empty() {
            return Err(ConfigError::Missing("YNAB_CLIENT_SECRET"));
        }
        if self.ynab.redirect_uri.is_empty() {
            return Err(ConfigError::Missing("YNAB_REDIRECT_URI"));
        }
        url::Url::parse(&self.ynab.redirect_uri).map_err(|e| ConfigError::Invalid {
            field: "YNAB_REDIRECT_URI",
            reason: e.to_string(),
        })?;
        url::Url::parse(&self.ynab.oauth_base_url).map_err(|e| ConfigError::Invalid {
            field: "YNAB_OAUTH_BASE_URL",
            reason: e.to_string(),
        })?;
        if self.ynab.http_timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "YNAB_HTTP_TIMEOUT_SECONDS",
                reason: "must be greater than zero".to_string(),
            });
        }

        self.encryption_secret()?;
        self.encryption_salt()?;
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<BrokerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: BrokerConfig = toml::from_str(&contents)?;
    Ok(config)
}
