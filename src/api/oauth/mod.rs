//! YNAB account connection flow.
//!
//! Implements the authorization code flow on top of an existing session:
//! 1. Signed-in user hits GET /connect/authorize
//! 2. Store single-use state bound to the user → 302 to YNAB
//! 3. User authorizes on YNAB
//! 4. YNAB redirects to GET /connect/callback
//! 5. Validate state, exchange code, store encrypted tokens
//! 6. POST /connect/disconnect removes the tokens again

mod exchange;
mod provider;
mod state_manager;

pub use exchange::{GrantType, OAuthExchangeError, TokenExchange, TokenResponse, YnabOAuthClient};
pub use provider::YnabOAuthConfig;
pub use state_manager::{run_state_cleanup, StateStore, StateValidation, STATE_TTL_MINUTES};

use super::redirect::{error_redirect, found, is_allowed_return_url, safe_redirect};
use crate::auth::{Session, SessionProvider};
use crate::credentials::TokenVault;
use crate::error::BrokerError;
use crate::logging::{redact, redact_error};
use axum::{
    extract::{OriginalUri, RawQuery, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default landing page after a successful connect.
pub const CONNECTED_REDIRECT: &str = "/ynab/connected";

const MAX_CODE_LEN: usize = 512;
const MAX_ERROR_LEN: usize = 256;
const MAX_ERROR_DESCRIPTION_LEN: usize = 1024;

/// Shared application state for the connect routes
#[derive(Clone)]
pub struct OAuthAppState {
    pub sessions: Arc<dyn SessionProvider>,
    pub state_store: StateStore,
    pub vault: Arc<TokenVault>,
    pub oauth_client: Arc<dyn TokenExchange>,
    pub oauth_config: YnabOAuthConfig,
}

/// Fixed messages shown on the error page.
///
/// Provider-supplied text never reaches the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFailure {
    InvalidParameters,
    ProviderDenied,
    MissingCode,
    MissingState,
    InvalidState,
    ConnectFailed,
}

impl CallbackFailure {
    pub fn message(self) -> &'static str {
        match self {
            CallbackFailure::InvalidParameters => "Invalid callback parameters",
            CallbackFailure::ProviderDenied => "YNAB authorization was denied",
            CallbackFailure::MissingCode => "No authorization code received",
            CallbackFailure::MissingState => "Missing OAuth state parameter",
            CallbackFailure::InvalidState => "Invalid or expired OAuth state",
            CallbackFailure::ConnectFailed => "Failed to connect YNAB account",
        }
    }

    fn redirect(self) -> Response {
        error_redirect(self.message())
    }
}

/// OAuth callback query parameters
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    /// Strict parse of the raw query string.
    fn parse(query: &str) -> Result<Self, CallbackFailure> {
        let params: CallbackParams =
            serde_urlencoded::from_str(query).map_err(|_| CallbackFailure::InvalidParameters)?;

        let params = CallbackParams {
            code: non_empty(params.code),
            state: non_empty(params.state),
            error: non_empty(params.error),
            error_description: non_empty(params.error_description),
        };

        let too_long = |value: &Option<String>, max: usize| {
            value.as_ref().is_some_and(|v| v.len() > max)
        };
        if too_long(&params.code, MAX_CODE_LEN)
            || too_long(&params.error, MAX_ERROR_LEN)
            || too_long(&params.error_description, MAX_ERROR_DESCRIPTION_LEN)
        {
            return Err(CallbackFailure::InvalidParameters);
        }

        if let Some(state) = &params.state {
            if !is_state_token(state) {
                return Err(CallbackFailure::InvalidParameters);
            }
        }

        Ok(params)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn is_state_token(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Debug, Default, Deserialize)]
struct AuthorizeParams {
    return_url: Option<String>,
}

impl AuthorizeParams {
    /// Repeated or undecodable parameters are rejected.
    fn parse(query: &str) -> Result<Self, BrokerError> {
        let params: AuthorizeParams = serde_urlencoded::from_str(query)
            .map_err(|_| BrokerError::Validation("Invalid query parameters"))?;
        Ok(AuthorizeParams {
            return_url: non_empty(params.return_url),
        })
    }
}

/// Disconnect response
#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
    pub message: String,
}

/// Create connect router
pub fn create_connect_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/connect/authorize", get(authorize))
        .route("/connect/callback", get(callback))
        .route("/connect/disconnect", post(disconnect))
        .with_state(Arc::new(state))
}

async fn current_session(
    state: &OAuthAppState,
    headers: &HeaderMap,
) -> Result<Option<Session>, BrokerError> {
    state.sessions.get_session(headers).await.map_err(|e| {
        error!(error = %redact_error(&e), "Session lookup failed");
        BrokerError::Storage(e)
    })
}

/// GET /connect/authorize
///
/// Starts the flow for the signed-in user.
///
/// # Security
/// - Requires a session; otherwise bounces to /login
/// - State is 256 random bits, bound to the user, single-use, 10 minute TTL
/// - `return_url` is kept only if it is a bare allow-listed path
async fn authorize(
    State(state): State<Arc<OAuthAppState>>,
    OriginalUri(uri): OriginalUri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let params = match AuthorizeParams::parse(query.as_deref().unwrap_or_default()) {
        Ok(params) => params,
        Err(e) => {
            warn!("Rejected malformed authorize request");
            return e.into_response();
        }
    };

    let session = match current_session(&state, &headers).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            let original = uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/connect/authorize");
            debug!("No session, redirecting to login");
            return safe_redirect("/login", &[("redirect", original)]);
        }
        Err(_) => return CallbackFailure::ConnectFailed.redirect(),
    };
    let user_id = &session.user.id;

    let return_url = params
        .return_url
        .as_deref()
        .filter(|url| is_allowed_return_url(url));
    if params.return_url.is_some() && return_url.is_none() {
        warn!(user_id = %user_id, "Ignoring disallowed return_url");
    }

    let token = StateStore::generate();
    if let Err(e) = state.state_store.store(user_id, &token, return_url) {
        error!(user_id = %user_id, error = %e, "Failed to store OAuth state");
        return CallbackFailure::ConnectFailed.redirect();
    }

    info!(user_id = %user_id, "Redirecting to YNAB authorization");
    found(&state.oauth_config.build_authorization_url(&token))
}

/// GET /connect/callback
///
/// # Security
/// - Strict query schema (unknown or oversized fields are rejected)
/// - State must belong to the signed-in user and is consumed on use
/// - No token row is written unless exchange and encryption both succeed
async fn callback(
    State(state): State<Arc<OAuthAppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let params = match CallbackParams::parse(query.as_deref().unwrap_or_default()) {
        Ok(params) => params,
        Err(failure) => {
            warn!("Rejected malformed OAuth callback");
            return failure.redirect();
        }
    };

    if let Some(provider_error) = &params.error {
        warn!(
            error = %redact(provider_error),
            description = %redact(params.error_description.as_deref().unwrap_or_default()),
            "YNAB authorization failed"
        );
        return CallbackFailure::ProviderDenied.redirect();
    }

    let Some(code) = params.code else {
        return CallbackFailure::MissingCode.redirect();
    };
    let Some(csrf_state) = params.state else {
        return CallbackFailure::MissingState.redirect();
    };

    let session = match current_session(&state, &headers).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return safe_redirect("/login", &[("redirect", "/connect/authorize")]);
        }
        Err(_) => return CallbackFailure::ConnectFailed.redirect(),
    };
    let user_id = &session.user.id;

    let validation = state.state_store.validate(user_id, &csrf_state);
    if !validation.valid {
        warn!(user_id = %user_id, "Invalid or expired OAuth state");
        return CallbackFailure::InvalidState.redirect();
    }

    if let Err(e) = connect_account(&state, user_id, &code).await {
        error!(user_id = %user_id, error = %redact_error(&e), "Failed to connect YNAB account");
        return CallbackFailure::ConnectFailed.redirect();
    }

    info!(user_id = %user_id, "YNAB account connected");

    let target = validation
        .return_url
        .as_deref()
        .filter(|url| is_allowed_return_url(url))
        .unwrap_or(CONNECTED_REDIRECT);
    safe_redirect(target, &[])
}

/// Exchanges the code and stores the resulting tokens.
///
/// Nothing is written unless the exchange succeeds.
async fn connect_account(
    state: &OAuthAppState,
    user_id: &str,
    code: &str,
) -> Result<(), BrokerError> {
    debug!(user_id = %user_id, "Exchanging authorization code");
    let response = state.oauth_client.exchange_code(code).await?;
    state.vault.save(user_id, &response)?;
    Ok(())
}

/// POST /connect/disconnect
///
/// # Security
/// - Cross-origin requests are refused (Origin must match Host)
/// - JSON content type required, so plain HTML forms cannot post here
async fn disconnect(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, BrokerError> {
    if !same_origin(&headers) {
        warn!("Disconnect refused: origin does not match host");
        return Err(BrokerError::Forbidden);
    }

    if !is_json_request(&headers) {
        return Err(BrokerError::Validation("Content-Type must be application/json"));
    }

    let session = current_session(&state, &headers)
        .await?
        .ok_or(BrokerError::AuthenticationRequired)?;
    let user_id = &session.user.id;

    state.vault.delete(user_id).map_err(|e| {
        error!(user_id = %user_id, error = %e, "Failed to disconnect YNAB account");
        BrokerError::Storage(e)
    })?;

    info!(user_id = %user_id, "YNAB account disconnected");

    Ok(Json(DisconnectResponse {
        success: true,
        message: "YNAB account disconnected successfully".to_string(),
    }))
}

/// Requests without an `Origin` header pass (same-origin navigations and
/// non-browser clients). A present `Origin` must name the `Host`.
fn same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    let Some(origin) = origin
        .to_str()
        .ok()
        .and_then(|o| url::Url::parse(o).ok())
    else {
        return false;
    };
    let Some(origin_host) = origin.host_str() else {
        return false;
    };

    let authority = match origin.port() {
        Some(port) => format!("{}:{}", origin_host, port),
        None => origin_host.to_string(),
    };
    authority.eq_ignore_ascii_case(host)
}

fn is_json_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}
