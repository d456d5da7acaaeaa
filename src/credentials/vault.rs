//! Token lifecycle: decrypt, refresh near expiry, persist.

use super::{CipherError, StoredTokens, TokenCipher, TokenStore, YnabTokens};
use crate::api::oauth::{TokenExchange, TokenResponse};
use crate::clock::SharedClock;
use crate::error::BrokerError;
use crate::logging::redact_error;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Access tokens are refreshed when this close to expiry.
pub const REFRESH_BUFFER_MINUTES: i64 = 5;

/// Encrypted per-user token vault.
///
/// Refreshes are serialized per user inside this process: two requests
/// racing on an expiring token perform one provider refresh, and the loser
/// re-reads the row the winner saved. YNAB rotates the refresh token on
/// every use, so spending it twice would disconnect the user.
pub struct TokenVault {
    store: TokenStore,
    cipher: TokenCipher,
    oauth: Arc<dyn TokenExchange>,
    clock: SharedClock,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenVault {
    pub fn new(
        store: TokenStore,
        cipher: TokenCipher,
        oauth: Arc<dyn TokenExchange>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            cipher,
            oauth,
            clock,
            refresh_locks: DashMap::new(),
        }
    }

    /// Returns a usable token pair for `user_id`, refreshing if needed.
    ///
    /// `Ok(None)` means the user has to (re)connect: either nothing is
    /// stored, the stored row could not be decrypted, or the refresh was
    /// rejected. In the last two cases the row is deleted.
    pub async fn get(&self, user_id: &str) -> Result<Option<YnabTokens>> {
        let Some(tokens) = self.load(user_id)? else {
            return Ok(None);
        };

        if !self.needs_refresh(tokens.expires_at) {
            return Ok(Some(tokens));
        }

        let lock = self
            .refresh_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(user_id).await
        };
        drop(lock);

        // Clones are only taken under the map's shard lock, so a count of
        // one means nobody is waiting on this entry.
        self.refresh_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn refresh_locked(&self, user_id: &str) -> Result<Option<YnabTokens>> {
        // Another task may have refreshed while we waited.
        let Some(tokens) = self.load(user_id)? else {
            return Ok(None);
        };
        if !self.needs_refresh(tokens.expires_at) {
            debug!(user_id = %user_id, "Token refreshed by concurrent request");
            return Ok(Some(tokens));
        }

        debug!(user_id = %user_id, expires_at = %tokens.expires_at, "Refreshing YNAB token");

        match self.refresh(user_id, &tokens.refresh_token).await {
            Ok(refreshed) => {
                info!(user_id = %user_id, "YNAB token refreshed");
                Ok(Some(refreshed))
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    error = %redact_error(&e),
                    "YNAB token refresh failed, removing stored tokens"
                );
                self.store.delete(user_id)?;
                Ok(None)
            }
        }
    }

    async fn refresh(&self, user_id: &str, refresh_token: &str) -> Result<YnabTokens, BrokerError> {
        let response = self.oauth.refresh(refresh_token).await?;
        Ok(self.save(user_id, &response)?)
    }

    /// Encrypts and stores a token response, replacing any existing row.
    ///
    /// Expiry is computed from the provider's `created_at` plus `expires_in`,
    /// not from the local clock.
    pub fn save(&self, user_id: &str, response: &TokenResponse) -> Result<YnabTokens> {
        let issued_at = DateTime::<Utc>::from_timestamp(response.created_at, 0)
            .context("Token response created_at out of range")?;
        let lifetime = Duration::try_seconds(response.expires_in)
            .context("Token response expires_in out of range")?;
        let expires_at = issued_at
            .checked_add_signed(lifetime)
            .context("Token expiry out of range")?;

        let access_enc = self
            .cipher
            .encrypt(&response.access_token)
            .context("Failed to encrypt access token")?;
        let refresh_enc = self
            .cipher
            .encrypt(&response.refresh_token)
            .context("Failed to encrypt refresh token")?;

        self.store
            .upsert(user_id, &access_enc, &refresh_enc, expires_at, self.clock.now())?;

        Ok(YnabTokens {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            expires_at,
        })
    }

    /// Removes the user's tokens. Idempotent.
    pub fn delete(&self, user_id: &str) -> Result<()> {
        if self.store.delete(user_id)? {
            info!(user_id = %user_id, "YNAB tokens deleted");
        }
        self.refresh_locks.remove(user_id);
        Ok(())
    }

    /// Whether a row exists. Does not decrypt or refresh.
    pub fn is_connected(&self, user_id: &str) -> Result<bool> {
        self.store.exists(user_id)
    }

    fn needs_refresh(&self, expires_at: DateTime<Utc>) -> bool {
        expires_at - self.clock.now() < Duration::minutes(REFRESH_BUFFER_MINUTES)
    }

    /// Reads and decrypts the stored row, deleting it if it can't be read back.
    fn load(&self, user_id: &str) -> Result<Option<YnabTokens>> {
        let Some(row) = self.store.get(user_id)? else {
            return Ok(None);
        };

        match self.decrypt_row(&row) {
            Ok(tokens) => Ok(Some(tokens)),
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    error = %e,
                    "Stored YNAB tokens could not be decrypted, removing"
                );
                self.store.delete(user_id)?;
                Ok(None)
            }
        }
    }

    fn decrypt_row(&self, row: &StoredTokens) -> Result<YnabTokens, BrokerError> {
        Ok(YnabTokens {
            access_token: self.reveal(&row.access_token)?,
            refresh_token: self.reveal(&row.refresh_token)?,
            expires_at: row.expires_at,
        })
    }

    /// Rows written before encryption was introduced hold plaintext.
    fn reveal(&self, value: &str) -> Result<String, CipherError> {
        if TokenCipher::is_encrypted(value) {
            self.cipher.decrypt(value)
        } else {
            Ok(value.to_string())
        }
    }
}
