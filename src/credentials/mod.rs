//! Encrypted storage for YNAB OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenVault                         │
//! │  - refresh 5 min before expiry           │
//! │  - drop tokens that fail to decrypt      │
//! │  - drop tokens that fail to refresh      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher                        │
//! │  - PBKDF2-derived AES-256-GCM key        │
//! │  - Unique nonce per value                │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenStore (SQLite)                │
//! │  - one row per user, atomic upsert       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ynab_broker::api::oauth::YnabOAuthClient;
//! use ynab_broker::clock::system_clock;
//! use ynab_broker::config::BrokerConfig;
//! use ynab_broker::credentials::{TokenCipher, TokenStore, TokenVault};
//! use ynab_broker::db::Database;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = BrokerConfig::load()?;
//! let db = Database::open(&config.database.path)?;
//! let cipher = TokenCipher::new(config.encryption_secret()?, config.encryption_salt()?)?;
//! let oauth = Arc::new(YnabOAuthClient::from_config(&config.ynab)?);
//! let vault = TokenVault::new(TokenStore::new(db), cipher, oauth, system_clock());
//!
//! if let Some(tokens) = vault.get("user-1").await? {
//!     // tokens.access_token is valid for at least the refresh buffer
//!     let _ = tokens.access_token;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Both tokens encrypted at rest with AES-256-GCM
//! - Key derived in memory only, never persisted
//! - Authenticated encryption (tampering and key rotation are detected)
//! - Undecryptable rows are deleted, forcing the user to reconnect

use chrono::{DateTime, Utc};

mod encryption;
mod storage;
mod vault;

pub use encryption::{CipherError, TokenCipher};
pub use storage::{StoredTokens, TokenStore};
pub use vault::{TokenVault, REFRESH_BUFFER_MINUTES};

/// Decrypted YNAB token pair handed to API callers.
#[derive(Clone, PartialEq, Eq)]
pub struct YnabTokens {
    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    pub refresh_token: String,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for YnabTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YnabTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
