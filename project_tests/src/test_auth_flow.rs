use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lib_setu::auth::{AuthError, AuthState, LOGGED_KEY, OTP_CONTEXT_KEY};
use lib_setu::realtime::{RestTokenProvider, WsTransport};
use lib_setu::retrieve::ApiClient;
use lib_setu::storage::{KeyValueStore, MemoryStore};
use lib_setu::{ConnectionManager, ConnectionState};
use project_tests::mock_backend::VALID_OTP;
use project_tests::{ClientFrame, MockBackend};

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn wait_state(manager: &ConnectionManager, want: ConnectionState) {
    let mut state = manager.watch_state();
    within(state.wait_for(|s| *s == want))
        .await
        .expect("manager stopped");
}

struct App {
    auth: Arc<AuthState>,
    store: Arc<MemoryStore>,
    manager: ConnectionManager,
}

/// Wires one REST client (and so one cookie jar) into both the auth oracle
/// and the token provider, as the binary does.
fn app_for(backend: &MockBackend) -> App {
    let config = backend.manager_config();
    let client = Arc::new(ApiClient::with_retries(&config.api_base_url, None, 0).unwrap());
    let store = Arc::new(MemoryStore::new());
    let auth = Arc::new(AuthState::new(Arc::clone(&client), store.clone()));
    let tokens = RestTokenProvider::new(client, config.token_path.clone());
    let manager = ConnectionManager::spawn(config, tokens, WsTransport);
    App { auth, store, manager }
}

#[tokio::test]
async fn test_otp_login_authorizes_the_socket_and_logout_tears_it_down() {
    let mut backend = MockBackend::start().await;
    backend.require_session(true);
    let app = app_for(&backend);
    let _bridge = app.manager.follow_auth(app.auth.subscribe());
    app.store.set(OTP_CONTEXT_KEY, r#"{"key":"stale"}"#).unwrap();

    // No cookie yet: the profile 401 triggers a refresh, which fails too.
    assert!(!app.auth.check_auth().await);
    assert_eq!(app.store.get(LOGGED_KEY).unwrap().as_deref(), Some("false"));
    assert_eq!(app.store.get(OTP_CONTEXT_KEY).unwrap(), None);
    assert_eq!(backend.refresh_attempts(), 1);
    assert_eq!(backend.refreshes(), 0);

    let challenge = app.auth.login("mechanic@setu.test").await.unwrap();
    assert_eq!(challenge.id, "1");
    assert!(app.auth.verify_otp(&challenge, VALID_OTP).await.unwrap());
    assert!(app.auth.was_logged_in());

    let mut conn = backend.next_conn().await.expect("no socket accepted");
    assert_eq!(conn.token, "tok-1");
    wait_state(&app.manager, ConnectionState::Connected).await;

    app.auth.logout().await;
    assert_eq!(
        conn.next_frame().await,
        Some(ClientFrame::Closed(Some((1000, "User logged out".to_string()))))
    );
    wait_state(&app.manager, ConnectionState::Disconnected).await;
    assert_eq!(app.store.get(LOGGED_KEY).unwrap(), None);
    assert!(!app.auth.check_auth().await);

    app.manager.shutdown().await;
}

#[tokio::test]
async fn test_token_endpoint_refuses_without_a_session() {
    let backend = MockBackend::start().await;
    backend.require_session(true);
    let app = app_for(&backend);

    app.manager.set_authenticated(true);
    wait_state(&app.manager, ConnectionState::Error).await;
    assert_eq!(backend.tokens_issued(), 0);
    assert!(backend.refresh_attempts() >= 1);
    assert_eq!(backend.refreshes(), 0);

    app.manager.set_authenticated(false);
    wait_state(&app.manager, ConnectionState::Disconnected).await;
    assert_eq!(app.manager.reconnect_attempt(), 0);

    app.manager.shutdown().await;
}

#[tokio::test]
async fn test_wrong_code_is_rejected_with_the_server_message() {
    let backend = MockBackend::start().await;
    let app = app_for(&backend);

    let challenge = app.auth.login("mechanic@setu.test").await.unwrap();
    match app.auth.verify_otp(&challenge, "000000").await {
        Err(AuthError::Rejected { status, message }) => {
            assert_eq!(status, 400);
            assert_eq!(message, "Invalid OTP");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!app.auth.is_authenticated());

    app.manager.shutdown().await;
}

#[tokio::test]
async fn test_expired_access_is_refreshed_before_the_socket_token() {
    let mut backend = MockBackend::start().await;
    backend.expire_access(true);
    let app = app_for(&backend);

    app.manager.set_authenticated(true);
    let conn = backend.next_conn().await.expect("no socket after refresh");
    assert_eq!(conn.token, "tok-1");
    wait_state(&app.manager, ConnectionState::Connected).await;

    assert_eq!(backend.refresh_attempts(), 1);
    assert_eq!(backend.refreshes(), 1);
    assert_eq!(backend.tokens_issued(), 1);
    assert_eq!(app.manager.reconnect_attempt(), 0);
    assert_eq!(app.store.get(LOGGED_KEY).unwrap().as_deref(), Some("true"));

    app.manager.shutdown().await;
}
