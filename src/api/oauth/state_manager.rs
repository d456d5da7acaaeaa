//! OAuth state management for CSRF protection.
//!
//! Each `/connect/authorize` request stores a random state token bound to
//! the signed-in user. The callback consumes it. Tokens are single-use,
//! expire after ten minutes and are persisted in the `verification` table
//! so they survive restarts and work across instances sharing the database.

use crate::clock::SharedClock;
use crate::db::Database;
use anyhow::{Context, Result};
use chrono::Duration;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info};
use uuid::Uuid;

/// How long a state token stays valid.
pub const STATE_TTL_MINUTES: i64 = 10;

const STATE_IDENTIFIER_PREFIX: &str = "ynab_oauth_state";
const STATE_TOKEN_BYTES: usize = 32;

/// Outcome of consuming a state token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateValidation {
    pub valid: bool,
    /// Where to send the user after a successful connect
    pub return_url: Option<String>,
}

impl StateValidation {
    fn invalid() -> Self {
        Self::default()
    }
}

/// JSON form of the stored value.
#[derive(Serialize, Deserialize)]
struct PackedState {
    state: String,
    #[serde(rename = "returnUrl", default, skip_serializing_if = "Option::is_none")]
    return_url: Option<String>,
}

/// Stored value: JSON with a return URL, or a bare token from older rows.
enum StateValue {
    Packed(PackedState),
    Legacy(String),
}

impl StateValue {
    fn decode(raw: &str) -> Self {
        match serde_json::from_str::<PackedState>(raw) {
            Ok(packed) => StateValue::Packed(packed),
            Err(_) => StateValue::Legacy(raw.to_string()),
        }
    }

    fn token(&self) -> &str {
        match self {
            StateValue::Packed(packed) => &packed.state,
            StateValue::Legacy(token) => token,
        }
    }

    fn into_return_url(self) -> Option<String> {
        match self {
            StateValue::Packed(packed) => packed.return_url,
            StateValue::Legacy(_) => None,
        }
    }
}

/// SQLite-backed OAuth state store.
#[derive(Clone)]
pub struct StateStore {
    db: Database,
    clock: SharedClock,
    ttl: Duration,
}

impl StateStore {
    pub fn new(db: Database, clock: SharedClock) -> Self {
        Self {
            db,
            clock,
            ttl: Duration::minutes(STATE_TTL_MINUTES),
        }
    }

    /// Generates a 256-bit state token as 64 lowercase hex chars.
    pub fn generate() -> String {
        let mut bytes = [0u8; STATE_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Stores `token` for `user_id`, optionally with a post-connect return URL.
    ///
    /// A user may hold several live tokens at once (one per browser tab).
    pub fn store(&self, user_id: &str, token: &str, return_url: Option<&str>) -> Result<()> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let value = serde_json::to_string(&PackedState {
            state: token.to_string(),
            return_url: return_url.map(str::to_string),
        })
        .context("Failed to encode OAuth state")?;

        self.db
            .lock()?
            .execute(
                r#"
                INSERT INTO verification (id, identifier, value, expires_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    identifier(user_id),
                    value,
                    expires_at.timestamp_millis(),
                    now.timestamp_millis(),
                ],
            )
            .context("Failed to store OAuth state")?;

        debug!(user_id = %user_id, "OAuth state stored");
        Ok(())
    }

    /// Consumes `token` for `user_id`.
    ///
    /// Valid only if an unexpired row for this user carries the token and
    /// this call is the one that deletes it. Storage errors are logged and
    /// reported as invalid.
    pub fn validate(&self, user_id: &str, token: &str) -> StateValidation {
        match self.consume(user_id, token) {
            Ok(validation) => validation,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "OAuth state validation failed");
                StateValidation::invalid()
            }
        }
    }

    fn consume(&self, user_id: &str, token: &str) -> Result<StateValidation> {
        let now = self.clock.now().timestamp_millis();
        let mut conn = self.db.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin state transaction")?;

        let matched = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, value FROM verification
                WHERE identifier = ?1 AND expires_at > ?2
                "#,
            )?;
            let rows = stmt.query_map(params![identifier(user_id), now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut matched = None;
            for row in rows {
                let (id, raw) = row?;
                let value = StateValue::decode(&raw);
                if bool::from(value.token().as_bytes().ct_eq(token.as_bytes())) {
                    matched = Some((id, value));
                    break;
                }
            }
            matched
        };

        let Some((id, value)) = matched else {
            return Ok(StateValidation::invalid());
        };

        // Whoever deletes the row owns the state.
        let deleted = tx.execute(
            "DELETE FROM verification WHERE id = ?1 AND expires_at > ?2",
            params![id, now],
        )?;
        tx.commit().context("Failed to commit state transaction")?;

        if deleted != 1 {
            return Ok(StateValidation::invalid());
        }

        Ok(StateValidation {
            valid: true,
            return_url: value.into_return_url(),
        })
    }

    /// Deletes every expired verification row. Returns the number removed.
    pub fn cleanup(&self) -> Result<usize> {
        let now = self.clock.now().timestamp_millis();
        let removed = self
            .db
            .lock()?
            .execute(
                "DELETE FROM verification WHERE expires_at <= ?1",
                params![now],
            )
            .context("Failed to clean up expired states")?;
        Ok(removed)
    }

    /// Count of live OAuth state rows (for monitoring)
    pub fn count(&self) -> Result<usize> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM verification WHERE identifier LIKE ?1 AND expires_at > ?2",
            params![format!("{}:%", STATE_IDENTIFIER_PREFIX), now],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn identifier(user_id: &str) -> String {
    format!("{}:{}", STATE_IDENTIFIER_PREFIX, user_id)
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(store: StateStore, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        match store.cleanup() {
            Ok(0) => debug!("OAuth state cleanup complete, nothing expired"),
            Ok(removed) => info!(removed, "Expired OAuth states removed"),
            Err(e) => error!(error = %e, "OAuth state cleanup failed"),
        }
    }
}
