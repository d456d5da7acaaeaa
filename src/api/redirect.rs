//! Open-redirect guard.
//!
//! Every browser-facing redirect issued by the broker goes through
//! [`safe_redirect`]. Targets must be relative paths on the allow-list;
//! anything else is replaced with a generic error page.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

/// Paths the broker may redirect to.
pub const ALLOWED_REDIRECT_PATHS: &[&str] = &["/ynab/connected", "/error", "/login", "/", "/consent"];

/// Where a rejected target is sent instead.
pub const INVALID_REDIRECT_TARGET: &str = "/error?message=Invalid+redirect";

/// Whether `target` is a relative URL whose path is on the allow-list.
pub fn is_allowed_redirect(target: &str) -> bool {
    if !target.starts_with('/') || target.starts_with("//") || target.contains('\\') {
        return false;
    }
    if target.chars().any(|c| c.is_control()) {
        return false;
    }

    let path = target
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    // "/" only matches itself, never acts as a prefix.
    ALLOWED_REDIRECT_PATHS.contains(&path)
}

/// Whether `target` may be stored as a post-connect destination.
///
/// Only a bare allow-listed path qualifies. A query or fragment would be
/// replayed into the final redirect, so any `?` or `#` disqualifies it.
pub fn is_allowed_return_url(target: &str) -> bool {
    ALLOWED_REDIRECT_PATHS.contains(&target)
}

/// 302 to `path` with `params` appended, if `path` is allowed.
pub fn safe_redirect(path: &str, params: &[(&str, &str)]) -> Response {
    let target = if params.is_empty() {
        path.to_string()
    } else {
        let query = serde_urlencoded::to_string(params).unwrap_or_default();
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{}{}{}", path, separator, query)
    };

    if is_allowed_redirect(&target) {
        found(&target)
    } else {
        tracing::warn!(target = %target, "Rejected redirect target");
        found(INVALID_REDIRECT_TARGET)
    }
}

/// Redirect to the error page with a fixed message.
pub fn error_redirect(message: &str) -> Response {
    safe_redirect("/error", &[("message", message)])
}

/// Plain 302 Found.
pub(crate) fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => (
            StatusCode::FOUND,
            [(
                header::LOCATION,
                HeaderValue::from_static(INVALID_REDIRECT_TARGET),
            )],
        )
            .into_response(),
    }
}
