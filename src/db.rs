//! Shared SQLite connection and schema.
//!
//! The state store, token store and session lookup all run against one
//! connection so that foreign keys (token row → user) and single-statement
//! upserts behave the same in tests (`:memory:`) and in production.
//!
//! # Schema
//! ```sql
//! CREATE TABLE "user" (
//!     id         TEXT PRIMARY KEY,
//!     email      TEXT NOT NULL UNIQUE,
//!     created_at TEXT NOT NULL
//! );
//! CREATE TABLE session (
//!     id         TEXT PRIMARY KEY,
//!     token      TEXT NOT NULL UNIQUE,
//!     user_id    TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
//!     expires_at INTEGER NOT NULL           -- unix millis
//! );
//! CREATE TABLE verification (
//!     id         TEXT PRIMARY KEY,
//!     identifier TEXT NOT NULL,             -- "<prefix>:<user_id>"
//!     value      TEXT NOT NULL,
//!     expires_at INTEGER NOT NULL,          -- unix millis
//!     created_at INTEGER NOT NULL
//! );
//! CREATE TABLE ynab_token (
//!     id            TEXT PRIMARY KEY,
//!     user_id       TEXT NOT NULL UNIQUE REFERENCES "user"(id) ON DELETE CASCADE,
//!     access_token  TEXT NOT NULL,          -- EncryptedSecret
//!     refresh_token TEXT NOT NULL,          -- EncryptedSecret
//!     expires_at    TEXT NOT NULL,          -- RFC 3339
//!     created_at    TEXT NOT NULL,
//!     updated_at    TEXT NOT NULL
//! );
//! ```
//!
//! `user` and `session` belong to the identity provider; they are created
//! here only if missing so the schema is complete on a fresh database.

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS "user" (
        id         TEXT PRIMARY KEY,
        email      TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS session (
        id         TEXT PRIMARY KEY,
        token      TEXT NOT NULL UNIQUE,
        user_id    TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS verification (
        id         TEXT PRIMARY KEY,
        identifier TEXT NOT NULL,
        value      TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_verification_identifier
        ON verification(identifier);
    CREATE INDEX IF NOT EXISTS idx_verification_expires_at
        ON verification(expires_at);

    CREATE TABLE IF NOT EXISTS ynab_token (
        id            TEXT PRIMARY KEY,
        user_id       TEXT NOT NULL UNIQUE REFERENCES "user"(id) ON DELETE CASCADE,
        access_token  TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        expires_at    TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    );
"#;

/// Cloneable handle to the shared connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database file and applies the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection for one unit of work.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }
}
