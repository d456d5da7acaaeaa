use super::oauth::StateStore;
use crate::auth::extract_bearer_token;
use crate::clock::SharedClock;
use crate::config::Environment;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::SecondsFormat;
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

/// State for the cron API.
#[derive(Clone)]
pub struct CronAppState {
    pub state_store: StateStore,
    /// Required bearer token. None = open outside production, closed in production.
    pub cron_secret: Option<String>,
    pub environment: Environment,
    pub clock: SharedClock,
}

#[derive(Serialize)]
struct CleanupResponse {
    success: bool,
    message: String,
    removed: usize,
    timestamp: String,
}

#[derive(Serialize)]
struct CleanupFailure {
    success: bool,
    error: String,
    timestamp: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn create_cron_router(state: CronAppState) -> Router {
    Router::new()
        .route("/cron/cleanup-states", get(cleanup_states))
        .with_state(Arc::new(state))
}

/// GET /cron/cleanup-states: removes expired OAuth state rows.
async fn cleanup_states(State(state): State<Arc<CronAppState>>, headers: HeaderMap) -> Response {
    if !authorize_cron(&headers, &state) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Unauthorized".to_string(),
            }),
        )
            .into_response();
    }

    let timestamp = state
        .clock
        .now()
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    match state.state_store.cleanup() {
        Ok(removed) => {
            info!(removed, "OAuth state cleanup completed");
            Json(CleanupResponse {
                success: true,
                message: "Expired OAuth states cleaned up".to_string(),
                removed,
                timestamp,
            })
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "OAuth state cleanup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CleanupFailure {
                    success: false,
                    error: "Cleanup failed".to_string(),
                    timestamp,
                }),
            )
                .into_response()
        }
    }
}

/// Returns true if the bearer token in `Authorization` matches the cron secret.
fn authorize_cron(headers: &HeaderMap, state: &CronAppState) -> bool {
    let Some(expected) = state.cron_secret.as_deref().filter(|s| !s.is_empty()) else {
        if state.environment.is_production() {
            warn!("CRON_SECRET not configured, refusing cron request");
            return false;
        }
        return true;
    };

    match extract_bearer_token(headers) {
        Ok(token) => bool::from(token.as_bytes().ct_eq(expected.as_bytes())),
        Err(_) => false,
    }
}
