// Integration tests for /connect/authorize, /connect/callback and /connect/disconnect
//
// Drives the full router against an in-memory database, a manual clock and a
// mockito server standing in for YNAB's token endpoint.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Duration;
use mockito::{Matcher, ServerGuard};
use rusqlite::params;
use std::sync::Arc;
use tower::ServiceExt;
use ynab_broker::api::oauth::{YnabOAuthClient, YnabOAuthConfig};
use ynab_broker::api::{create_app, CronAppState, OAuthAppState, StateStore};
use ynab_broker::auth::SqliteSessionProvider;
use ynab_broker::clock::{Clock, ManualClock};
use ynab_broker::config::{Environment, YnabConfig};
use ynab_broker::credentials::{TokenCipher, TokenStore, TokenVault};
use ynab_broker::db::Database;
use ynab_broker::rate_limit::RateLimiter;

const ALICE_COOKIE: &str = "better-auth.session_token=alice-session.sig";
const BOB_COOKIE: &str = "better-auth.session_token=bob-session.sig";

// ── Test harness ──────────────────────────────────────────────────────────────

struct TestApp {
    router: Router,
    clock: Arc<ManualClock>,
    vault: Arc<TokenVault>,
    tokens: TokenStore,
    server: ServerGuard,
}

async fn create_test_app() -> TestApp {
    let server = mockito::Server::new_async().await;
    let db = Database::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::default());

    seed_user(&db, "alice", "alice@example.com", "alice-session", &clock);
    seed_user(&db, "bob", "bob@example.com", "bob-session", &clock);

    let ynab = YnabConfig {
        client_id: "test-client".to_string(),
        client_secret: "test-secret".to_string(),
        redirect_uri: "http://localhost:3000/connect/callback".to_string(),
        oauth_base_url: server.url(),
        http_timeout_seconds: 5,
    };
    let oauth_client = Arc::new(YnabOAuthClient::from_config(&ynab).unwrap());
    let cipher = TokenCipher::new("integration-test-secret-of-at-least-32-chars", "test-salt").unwrap();
    let tokens = TokenStore::new(db.clone());
    let vault = Arc::new(TokenVault::new(
        tokens.clone(),
        cipher,
        oauth_client.clone(),
        clock.clone(),
    ));
    let state_store = StateStore::new(db.clone(), clock.clone());

    let oauth_state = OAuthAppState {
        sessions: Arc::new(SqliteSessionProvider::new(db.clone(), clock.clone())),
        state_store: state_store.clone(),
        vault: vault.clone(),
        oauth_client,
        oauth_config: YnabOAuthConfig::from_config(&ynab),
    };
    let cron_state = CronAppState {
        state_store,
        cron_secret: None,
        environment: Environment::Test,
        clock: clock.clone(),
    };
    let router = create_app(
        oauth_state,
        cron_state,
        Arc::new(RateLimiter::new(clock.clone())),
    );

    TestApp {
        router,
        clock,
        vault,
        tokens,
        server,
    }
}

fn seed_user(db: &Database, id: &str, email: &str, session_token: &str, clock: &ManualClock) {
    let conn = db.lock().unwrap();
    conn.execute(
        r#"INSERT INTO "user" (id, email, created_at) VALUES (?1, ?2, '2026-01-01T00:00:00Z')"#,
        params![id, email],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO session (id, token, user_id, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            format!("session-{}", id),
            session_token,
            id,
            (clock.now() + Duration::days(7)).timestamp_millis()
        ],
    )
    .unwrap();
}

fn token_body(access: &str, refresh: &str, clock: &ManualClock) -> String {
    serde_json::json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 7200,
        "refresh_token": refresh,
        "created_at": clock.now().timestamp(),
    })
    .to_string()
}

fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &TestApp, request: Request<Body>) -> Response {
    app.router.clone().oneshot(request).await.unwrap()
}

fn location(response: &Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("Missing Location header")
        .to_str()
        .unwrap()
        .to_string()
}

/// Runs /connect/authorize and returns the state YNAB would echo back.
async fn start_authorize(app: &TestApp, uri: &str, cookie: &str) -> String {
    let response = send(app, get(uri, Some(cookie))).await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let target = url::Url::parse(&location(&response)).unwrap();
    assert_eq!(target.path(), "/oauth/authorize");
    target
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .expect("state missing from authorization URL")
}

async fn mock_token_exchange(app: &mut TestApp, code: &str, hits: usize) -> mockito::Mock {
    let body = token_body("access-1", "refresh-1", &app.clock);
    app.server
        .mock("POST", "/oauth/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), code.into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .expect(hits)
        .create_async()
        .await
}

// ── Authorize ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_authorize_without_session_redirects_to_login() {
    let app = create_test_app().await;

    let response = send(&app, get("/connect/authorize?return_url=/consent", None)).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        location(&response),
        "/login?redirect=%2Fconnect%2Fauthorize%3Freturn_url%3D%2Fconsent"
    );
}

#[tokio::test]
async fn test_authorize_redirects_to_ynab() {
    let app = create_test_app().await;

    let response = send(&app, get("/connect/authorize", Some(ALICE_COOKIE))).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    let target = url::Url::parse(&location(&response)).unwrap();
    let query: Vec<(String, String)> = target.query_pairs().into_owned().collect();
    let value = |key: &str| {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    assert_eq!(value("client_id").as_deref(), Some("test-client"));
    assert_eq!(
        value("redirect_uri").as_deref(),
        Some("http://localhost:3000/connect/callback")
    );
    assert_eq!(value("response_type").as_deref(), Some("code"));
    let state = value("state").unwrap();
    assert_eq!(state.len(), 64);
    assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
}

// ── Callback ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_connect_flow() {
    let mut app = create_test_app().await;
    let state = start_authorize(&app, "/connect/authorize?return_url=/consent", ALICE_COOKIE).await;
    let mock = mock_token_exchange(&mut app, "auth-code", 1).await;

    let response = send(
        &app,
        get(
            &format!("/connect/callback?code=auth-code&state={}", state),
            Some(ALICE_COOKIE),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/consent");
    mock.assert_async().await;

    let tokens = app.vault.get("alice").await.unwrap().expect("tokens saved");
    assert_eq!(tokens.access_token, "access-1");
    assert_eq!(tokens.refresh_token, "refresh-1");

    // Encrypted at rest
    let row = app.tokens.get("alice").unwrap().unwrap();
    assert!(TokenCipher::is_encrypted(&row.access_token));
    assert!(!row.access_token.contains("access-1"));
    assert!(!row.refresh_token.contains("refresh-1"));
}

#[tokio::test]
async fn test_callback_default_redirect() {
    let mut app = create_test_app().await;
    let state = start_authorize(&app, "/connect/authorize", ALICE_COOKIE).await;
    let _mock = mock_token_exchange(&mut app, "code", 1).await;

    let response = send(
        &app,
        get(&format!("/connect/callback?code=code&state={}", state), Some(ALICE_COOKIE)),
    )
    .await;

    assert_eq!(location(&response), "/ynab/connected");
}

#[tokio::test]
async fn test_disallowed_return_url_is_dropped() {
    let mut app = create_test_app().await;
    let state = start_authorize(
        &app,
        "/connect/authorize?return_url=https%3A%2F%2Fevil.example%2F",
        ALICE_COOKIE,
    )
    .await;
    let _mock = mock_token_exchange(&mut app, "code", 1).await;

    let response = send(
        &app,
        get(&format!("/connect/callback?code=code&state={}", state), Some(ALICE_COOKIE)),
    )
    .await;

    assert_eq!(location(&response), "/ynab/connected");
}

#[tokio::test]
async fn test_return_url_query_is_not_replayed() {
    for return_url in [
        "%2Ferror%3Fmessage%3DYour%2Baccount%2Bwas%2Bsuspended%2C%2Bcall%2B555-0100",
        "%2Flogin%3Fredirect%3Dhttps%3A%2F%2Fevil.example",
        "%2Fconsent%23fragment",
    ] {
        let mut app = create_test_app().await;
        let state = start_authorize(
            &app,
            &format!("/connect/authorize?return_url={}", return_url),
            ALICE_COOKIE,
        )
        .await;
        let _mock = mock_token_exchange(&mut app, "code", 1).await;

        let response = send(
            &app,
            get(&format!("/connect/callback?code=code&state={}", state), Some(ALICE_COOKIE)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/ynab/connected");
        assert!(app.vault.is_connected("alice").unwrap());
    }
}

#[tokio::test]
async fn test_authorize_duplicate_return_url_is_bad_request() {
    let app = create_test_app().await;

    let response = send(
        &app,
        get(
            "/connect/authorize?return_url=/consent&return_url=/",
            Some(ALICE_COOKIE),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Bad Request");
    assert_eq!(json["message"], "Invalid query parameters");
}

#[tokio::test]
async fn test_state_replay_rejected() {
    let mut app = create_test_app().await;
    let state = start_authorize(&app, "/connect/authorize", ALICE_COOKIE).await;
    let mock = mock_token_exchange(&mut app, "code", 1).await;
    let uri = format!("/connect/callback?code=code&state={}", state);

    let first = send(&app, get(&uri, Some(ALICE_COOKIE))).await;
    assert_eq!(location(&first), "/ynab/connected");

    let replay = send(&app, get(&uri, Some(ALICE_COOKIE))).await;
    assert_eq!(
        location(&replay),
        "/error?message=Invalid+or+expired+OAuth+state"
    );

    // Second callback never reached YNAB
    mock.assert_async().await;
}

#[tokio::test]
async fn test_state_from_another_user_rejected() {
    let mut app = create_test_app().await;
    let state = start_authorize(&app, "/connect/authorize", ALICE_COOKIE).await;
    let mock = mock_token_exchange(&mut app, "code", 0).await;

    let response = send(
        &app,
        get(&format!("/connect/callback?code=code&state={}", state), Some(BOB_COOKIE)),
    )
    .await;

    assert_eq!(
        location(&response),
        "/error?message=Invalid+or+expired+OAuth+state"
    );
    assert!(!app.vault.is_connected("bob").unwrap());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_expired_state_rejected() {
    let mut app = create_test_app().await;
    let state = start_authorize(&app, "/connect/authorize", ALICE_COOKIE).await;
    let _mock = mock_token_exchange(&mut app, "code", 0).await;

    app.clock.advance(Duration::minutes(11));

    let response = send(
        &app,
        get(&format!("/connect/callback?code=code&state={}", state), Some(ALICE_COOKIE)),
    )
    .await;

    assert_eq!(
        location(&response),
        "/error?message=Invalid+or+expired+OAuth+state"
    );
}

#[tokio::test]
async fn test_provider_error_not_reflected() {
    let app = create_test_app().await;

    let response = send(
        &app,
        get(
            "/connect/callback?error=access_denied&error_description=%3Cscript%3Ealert(1)%3C%2Fscript%3E",
            Some(ALICE_COOKIE),
        ),
    )
    .await;

    let target = location(&response);
    assert_eq!(target, "/error?message=YNAB+authorization+was+denied");
    assert!(!target.contains("script"));
}

#[tokio::test]
async fn test_missing_code_and_state() {
    let app = create_test_app().await;

    let response = send(&app, get("/connect/callback", Some(ALICE_COOKIE))).await;
    assert_eq!(
        location(&response),
        "/error?message=No+authorization+code+received"
    );

    let response = send(&app, get("/connect/callback?code=abc", Some(ALICE_COOKIE))).await;
    assert_eq!(
        location(&response),
        "/error?message=Missing+OAuth+state+parameter"
    );
}

#[tokio::test]
async fn test_malformed_callback_parameters() {
    let app = create_test_app().await;
    let state = "a".repeat(64);

    for uri in [
        format!("/connect/callback?code=abc&state={}&extra=1", state),
        "/connect/callback?code=abc&state=short".to_string(),
        format!("/connect/callback?code={}&state={}", "x".repeat(600), state),
    ] {
        let response = send(&app, get(&uri, Some(ALICE_COOKIE))).await;
        assert_eq!(
            location(&response),
            "/error?message=Invalid+callback+parameters",
            "uri: {}",
            uri
        );
    }
}

#[tokio::test]
async fn test_callback_without_session_redirects_to_login() {
    let app = create_test_app().await;

    let response = send(
        &app,
        get(&format!("/connect/callback?code=abc&state={}", "b".repeat(64)), None),
    )
    .await;

    assert_eq!(
        location(&response),
        "/login?redirect=%2Fconnect%2Fauthorize"
    );
}

#[tokio::test]
async fn test_failed_exchange_writes_nothing() {
    let mut app = create_test_app().await;
    let state = start_authorize(&app, "/connect/authorize", ALICE_COOKIE).await;
    let _mock = app
        .server
        .mock("POST", "/oauth/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant","error_description":"code expired"}"#)
        .create_async()
        .await;

    let response = send(
        &app,
        get(&format!("/connect/callback?code=stale&state={}", state), Some(ALICE_COOKIE)),
    )
    .await;

    let target = location(&response);
    assert_eq!(target, "/error?message=Failed+to+connect+YNAB+account");
    assert!(!target.contains("expired"));
    assert!(!app.vault.is_connected("alice").unwrap());
}

#[tokio::test]
async fn test_out_of_range_expiry_fails_connect() {
    let mut app = create_test_app().await;
    let state = start_authorize(&app, "/connect/authorize", ALICE_COOKIE).await;
    let body = serde_json::json!({
        "access_token": "access-1",
        "token_type": "Bearer",
        "expires_in": 9_000_000_000_000_000_i64,
        "refresh_token": "refresh-1",
        "created_at": app.clock.now().timestamp(),
    })
    .to_string();
    let _mock = app
        .server
        .mock("POST", "/oauth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await;

    let response = send(
        &app,
        get(&format!("/connect/callback?code=code&state={}", state), Some(ALICE_COOKIE)),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        location(&response),
        "/error?message=Failed+to+connect+YNAB+account"
    );
    assert!(!app.vault.is_connected("alice").unwrap());
}

#[tokio::test]
async fn test_vault_refreshes_through_ynab() {
    let mut app = create_test_app().await;
    let state = start_authorize(&app, "/connect/authorize", ALICE_COOKIE).await;
    let _exchange = mock_token_exchange(&mut app, "code", 1).await;
    send(
        &app,
        get(&format!("/connect/callback?code=code&state={}", state), Some(ALICE_COOKIE)),
    )
    .await;

    // Two minutes left on the access token
    app.clock.advance(Duration::minutes(118));
    let refreshed_body = token_body("access-2", "refresh-2", &app.clock);
    let refresh = app
        .server
        .mock("POST", "/oauth/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
        ]))
        .with_status(200)
        .with_body(refreshed_body)
        .expect(1)
        .create_async()
        .await;

    let tokens = app.vault.get("alice").await.unwrap().unwrap();

    assert_eq!(tokens.access_token, "access-2");
    assert_eq!(tokens.refresh_token, "refresh-2");
    assert_eq!(app.tokens.count_for_user("alice").unwrap(), 1);
    refresh.assert_async().await;
}

// ── Disconnect ────────────────────────────────────────────────────────────────

fn disconnect_request(cookie: Option<&str>, origin: Option<&str>, json: bool) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/connect/disconnect")
        .header(header::HOST, "broker.example");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    if let Some(origin) = origin {
        builder = builder.header(header::ORIGIN, origin);
    }
    if json {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    builder.body(Body::from("{}")).unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn connect_alice(app: &mut TestApp) {
    let state = start_authorize(app, "/connect/authorize", ALICE_COOKIE).await;
    let _mock = mock_token_exchange(app, "code", 1).await;
    send(
        app,
        get(&format!("/connect/callback?code=code&state={}", state), Some(ALICE_COOKIE)),
    )
    .await;
    assert!(app.vault.is_connected("alice").unwrap());
}

#[tokio::test]
async fn test_disconnect_removes_tokens() {
    let mut app = create_test_app().await;
    connect_alice(&mut app).await;

    let response = send(
        &app,
        disconnect_request(Some(ALICE_COOKIE), Some("https://broker.example"), true),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "YNAB account disconnected successfully");
    assert!(!app.vault.is_connected("alice").unwrap());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let app = create_test_app().await;

    let response = send(&app, disconnect_request(Some(ALICE_COOKIE), None, true)).await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_disconnect_cross_origin_forbidden() {
    let mut app = create_test_app().await;
    connect_alice(&mut app).await;

    let response = send(
        &app,
        disconnect_request(Some(ALICE_COOKIE), Some("https://evil.example"), true),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(app.vault.is_connected("alice").unwrap());
}

#[tokio::test]
async fn test_disconnect_requires_json() {
    let app = create_test_app().await;

    let response = send(&app, disconnect_request(Some(ALICE_COOKIE), None, false)).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Bad Request");
}

#[tokio::test]
async fn test_disconnect_requires_session() {
    let app = create_test_app().await;

    let response = send(&app, disconnect_request(None, None, true)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Unauthorized");
}

#[tokio::test]
async fn test_health() {
    let app = create_test_app().await;

    let response = send(&app, get("/health", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}
