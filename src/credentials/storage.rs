//! Token rows in SQLite.
//!
//! Values handed to this store are already encrypted; it never sees a
//! plaintext token.

use crate::db::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

/// Encrypted row as stored.
#[derive(Clone, Debug)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One-row-per-user token table.
///
/// # Thread Safety
/// - Shares the `Database` connection mutex with the other stores
/// - Writes are single statements, so a crash never leaves half a pair
#[derive(Clone)]
pub struct TokenStore {
    db: Database,
}

impl TokenStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts or replaces the user's row in one statement.
    ///
    /// Concurrent writers for the same user resolve last-write-wins.
    pub fn upsert(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        self.db
            .lock()?
            .execute(
                r#"
                INSERT INTO ynab_token (
                    id, user_id, access_token, refresh_token,
                    expires_at, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(user_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    access_token,
                    refresh_token,
                    expires_at.to_rfc3339(),
                    now,
                    now,
                ],
            )
            .context("Failed to store YNAB tokens")?;

        Ok(())
    }

    /// Reads the user's encrypted row.
    pub fn get(&self, user_id: &str) -> Result<Option<StoredTokens>> {
        let conn = self.db.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT access_token, refresh_token, expires_at, updated_at
                FROM ynab_token
                WHERE user_id = ?1
                "#,
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to read YNAB tokens")?;

        let Some((access_token, refresh_token, expires_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(StoredTokens {
            access_token,
            refresh_token,
            expires_at: parse_timestamp(&expires_at).context("Invalid expires_at")?,
            updated_at: parse_timestamp(&updated_at).context("Invalid updated_at")?,
        }))
    }

    /// Deletes the user's row. Returns whether a row existed.
    pub fn delete(&self, user_id: &str) -> Result<bool> {
        let rows_affected = self
            .db
            .lock()?
            .execute("DELETE FROM ynab_token WHERE user_id = ?1", params![user_id])
            .context("Failed to delete YNAB tokens")?;

        Ok(rows_affected > 0)
    }

    pub fn exists(&self, user_id: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM ynab_token WHERE user_id = ?1",
                params![user_id],
                |_| Ok(()),
            )
            .optional()
            .context("Failed to check YNAB tokens")?;
        Ok(found.is_some())
    }

    /// Number of rows for `user_id`. Always 0 or 1.
    pub fn count_for_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM ynab_token WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count YNAB tokens")?;
        Ok(count as usize)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
