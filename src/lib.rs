// HTTP routes (connect flow, cron, health)
pub mod api;

// Session cookies and bearer tokens
pub mod auth;

// Injectable time source
pub mod clock;

// TOML + environment configuration
pub mod config;

// Encrypted YNAB token storage
pub mod credentials;

// Shared SQLite connection and schema
pub mod db;

// Client-facing error taxonomy
pub mod error;

// Tracing setup and secret redaction
pub mod logging;

// Fixed-window rate limiting
pub mod rate_limit;
