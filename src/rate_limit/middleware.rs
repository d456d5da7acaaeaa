// axum layer applying the fixed-window limiter to sensitive paths.

use super::{RateLimitPolicy, RateLimitResult, RateLimiter};
use crate::error::BrokerError;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

const X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitCategory {
    Login,
    OAuth,
    Introspection,
}

impl RateLimitCategory {
    pub fn key_prefix(self) -> &'static str {
        match self {
            RateLimitCategory::Login => "login",
            RateLimitCategory::OAuth => "oauth",
            RateLimitCategory::Introspection => "introspect",
        }
    }

    pub fn policy(self) -> RateLimitPolicy {
        match self {
            RateLimitCategory::Login => RateLimitPolicy::LOGIN,
            RateLimitCategory::OAuth => RateLimitPolicy::OAUTH,
            RateLimitCategory::Introspection => RateLimitPolicy::INTROSPECTION,
        }
    }
}

/// Which limit (if any) applies to `path`.
pub fn classify_path(path: &str) -> Option<RateLimitCategory> {
    if path.starts_with("/api/auth/sign-in") || path.starts_with("/api/auth/sign-up") {
        Some(RateLimitCategory::Login)
    } else if path.starts_with("/connect/authorize") || path.starts_with("/connect/callback") {
        Some(RateLimitCategory::OAuth)
    } else if path.starts_with("/api/auth/oauth/introspect") {
        Some(RateLimitCategory::Introspection)
    } else {
        None
    }
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, else "unknown".
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Limits classified paths; everything else passes through untouched.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(category) = classify_path(request.uri().path()) else {
        return next.run(request).await;
    };

    let ip = client_ip(request.headers());
    let key = format!("{}:{}", category.key_prefix(), ip);
    let result = limiter.check(&key, category.policy());

    let mut response = if result.allowed {
        next.run(request).await
    } else {
        warn!(
            category = category.key_prefix(),
            ip = %ip,
            current = result.current,
            limit = result.limit,
            "Rate limit exceeded"
        );
        BrokerError::RateLimitExceeded {
            retry_after_secs: result.reset_in_seconds(),
        }
        .into_response()
    };

    insert_rate_limit_headers(response.headers_mut(), &result);
    response
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(X_RATE_LIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from(result.remaining()));
    headers.insert(X_RATE_LIMIT_RESET, HeaderValue::from(result.reset_in_seconds()));
}
