//! Session lookup against the identity provider's tables.

use super::{extract_session_token, TokenError};
use crate::clock::SharedClock;
use crate::db::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: String,
    pub email: String,
}

/// Authenticated browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: SessionUser,
}

/// Resolves the signed-in user for a request.
///
/// `Ok(None)` means "not signed in". `Err` is reserved for lookup failures.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self, headers: &HeaderMap) -> Result<Option<Session>>;
}

/// Reads sessions written by the identity provider into the shared database.
#[derive(Clone)]
pub struct SqliteSessionProvider {
    db: Database,
    clock: SharedClock,
}

impl SqliteSessionProvider {
    pub fn new(db: Database, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    fn lookup(&self, token: &str) -> Result<Option<Session>> {
        let conn = self.db.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT u.id, u.email, s.expires_at
                FROM session s
                JOIN "user" u ON u.id = s.user_id
                WHERE s.token = ?1
                "#,
                params![token],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to look up session")?;

        let Some((id, email, expires_at)) = row else {
            return Ok(None);
        };

        if expires_at <= self.clock.now().timestamp_millis() {
            debug!(user_id = %id, "Session expired");
            return Ok(None);
        }

        Ok(Some(Session {
            user: SessionUser { id, email },
        }))
    }
}

#[async_trait]
impl SessionProvider for SqliteSessionProvider {
    async fn get_session(&self, headers: &HeaderMap) -> Result<Option<Session>> {
        match extract_session_token(headers) {
            Ok(token) => self.lookup(&token),
            Err(TokenError::Missing) => Ok(None),
            Err(e) => {
                debug!(error = %e, "Unusable session cookie");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::Duration;
    use std::sync::Arc;

    fn setup() -> (SqliteSessionProvider, Database, Arc<ManualClock>) {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::default());
        let expires_at = (clock.now() + Duration::days(7)).timestamp_millis();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                r#"INSERT INTO "user" (id, email, created_at) VALUES ('user1', 'alice@example.com', '2026-01-01T00:00:00Z')"#,
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO session (id, token, user_id, expires_at) VALUES ('s1', 'tok1', 'user1', ?1)",
                params![expires_at],
            )
            .unwrap();
        }
        (
            SqliteSessionProvider::new(db.clone(), clock.clone()),
            db,
            clock,
        )
    }

    fn with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_valid_session() {
        let (provider, _db, _clock) = setup();
        let session = provider
            .get_session(&with_cookie("better-auth.session_token=tok1.sig"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.user.id, "user1");
        assert_eq!(session.user.email, "alice@example.com");
    }

    #[tokio::test]
    async fn test_no_cookie() {
        let (provider, _db, _clock) = setup();
        assert!(provider.get_session(&HeaderMap::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (provider, _db, _clock) = setup();
        let session = provider
            .get_session(&with_cookie("better-auth.session_token=other.sig"))
            .await
            .unwrap();
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn test_expired_session() {
        let (provider, _db, clock) = setup();
        clock.advance(Duration::days(8));

        let session = provider
            .get_session(&with_cookie("better-auth.session_token=tok1.sig"))
            .await
            .unwrap();
        assert!(session.is_none());
    }
}
