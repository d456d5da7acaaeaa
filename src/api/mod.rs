// HTTP routes: account connection, maintenance and health

pub mod cron;
pub mod oauth;
pub mod redirect;

pub use cron::{create_cron_router, CronAppState};
pub use oauth::{create_connect_router, run_state_cleanup, OAuthAppState, StateStore};

use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use axum::{middleware, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn create_health_router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Full application router with rate limiting applied.
pub fn create_app(
    oauth_state: OAuthAppState,
    cron_state: CronAppState,
    rate_limiter: Arc<RateLimiter>,
) -> Router {
    Router::new()
        .merge(create_connect_router(oauth_state))
        .merge(create_cron_router(cron_state))
        .merge(create_health_router())
        .layer(middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
}
