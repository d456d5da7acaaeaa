//! Request credentials: bearer tokens (cron) and session cookies (users).

use axum::http::{header, HeaderMap};

mod session;

pub use session::{Session, SessionProvider, SessionUser, SqliteSessionProvider};


/// Session cookie set by the identity provider over plain HTTP.
pub const SESSION_COOKIE: &str = "better-auth.session_token";

/// Same cookie when served over HTTPS.
pub const SECURE_SESSION_COOKIE: &str = "__Secure-better-auth.session_token";

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
/// Returns the token string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Extract the session token from the `Cookie` header.
///
/// The cookie value is `<token>.<signature>`; only the token part is
/// returned. The secure cookie wins when both are present.
pub fn extract_session_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let mut plain = None;
    let mut secure = None;

    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let Some((name, raw)) = pair.trim().split_once('=') else {
                continue;
            };
            match name.trim() {
                SECURE_SESSION_COOKIE => secure = Some(raw.trim()),
                SESSION_COOKIE => plain = Some(raw.trim()),
                _ => {}
            }
        }
    }

    let raw = secure.or(plain).ok_or(TokenError::Missing)?;
    let decoded = urlencoding::decode(raw).map_err(|_| TokenError::InvalidFormat)?;
    let token = decoded.split('.').next().unwrap_or_default();

    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Parse bearer token from Authorization header value
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let Some((scheme, token)) = header_value.split_once(' ') else {
        return Err(TokenError::InvalidFormat);
    };

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum TokenError {
    /// Header or cookie not present
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>", or undecodable cookie value
    #[error("Invalid authorization token format")]
    InvalidFormat,
    #[error("Authorization token is empty")]
    Empty,
}
