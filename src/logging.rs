//! Tracing setup and secret redaction for log output.
//!
//! Anything that may carry a provider token, a bearer header or a JWT goes
//! through [`redact`] before it reaches a `tracing` macro.

use regex::Regex;
use std::sync::OnceLock;

/// Replacement for redacted values.
pub const REDACTION_PLACEHOLDER: &str = "[REDACTED]";

// Bearer runs before `authorization` so the header value itself is caught.
const SENSITIVE_PATTERNS: &[&str] = &[
    r"(?i)bearer\s+[\w.~+/-]+=*",
    r#"(?i)access_token["']?\s*[=:]\s*["']?[\w.~+/-]+=*"#,
    r#"(?i)refresh_token["']?\s*[=:]\s*["']?[\w.~+/-]+=*"#,
    r#"(?i)authorization["']?\s*[=:]\s*["']?[\w.~+/-]+=*"#,
    r#"(?i)api[_-]?key["']?\s*[=:]\s*["']?[\w.~+/-]+=*"#,
    r#"(?i)client[_-]?secret["']?\s*[=:]\s*["']?[\w.~+/-]+=*"#,
    // JWT
    r"eyJ[\w-]+\.eyJ[\w-]+\.[\w-]+",
];

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SENSITIVE_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// Replaces token-like substrings with [`REDACTION_PLACEHOLDER`].
pub fn redact(input: &str) -> String {
    let mut out = input.to_string();
    for pattern in patterns() {
        if pattern.is_match(&out) {
            out = pattern.replace_all(&out, REDACTION_PLACEHOLDER).into_owned();
        }
    }
    out
}

/// Redacts the `Display` form of an error, including its context chain.
pub fn redact_error(err: &dyn std::fmt::Display) -> String {
    redact(&err.to_string())
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `ynab_broker=info`.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ynab_broker=info".into()),
        )
        .try_init();
}
