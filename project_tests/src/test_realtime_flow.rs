use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lib_setu::realtime::{RestTokenProvider, WsTransport};
use lib_setu::retrieve::ApiClient;
use lib_setu::{ConnectionManager, ConnectionState, ManagerConfig, OutboundMessage};
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

fn manager_with(config: ManagerConfig) -> ConnectionManager {
    let client = Arc::new(ApiClient::with_retries(&config.api_base_url, None, 0).unwrap());
    let tokens = RestTokenProvider::new(client, config.token_path.clone());
    ConnectionManager::spawn(config, tokens, WsTransport)
}

#[tokio::test]
async fn test_connects_with_fresh_token_and_receives_notifications() {
    let mut backend = MockBackend::start().await;
    let manager = manager_with(backend.manager_config());

    manager.set_authenticated(true);
    let conn = backend.next_conn().await.expect("no socket accepted");
    assert_eq!(conn.token, "tok-1");
    wait_state(&manager, ConnectionState::Connected).await;

    let mut messages = manager.watch_messages();
    conn.push(r#"{"type":"new_job","request_id":"42","job_id":7}"#);
    within(messages.wait_for(|m| m.is_some())).await.unwrap();

    let last = manager.last_message().unwrap();
    assert_eq!(last.type_name(), Some("new_job"));
    assert_eq!(last.request_id(), Some(42));
    assert_eq!(last.job_id().as_deref(), Some("7"));
    assert_eq!(backend.rejected_upgrades(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_offline_subscription_is_flushed_on_connect() {
    let mut backend = MockBackend::start().await;
    let manager = manager_with(backend.manager_config());

    assert!(!manager.send(&OutboundMessage::SubscribeToRequest { request_id: 42 }));
    assert_eq!(manager.queue_size(), 1);

    manager.set_authenticated(true);
    let mut conn = backend.next_conn().await.expect("no socket accepted");
    assert_eq!(
        conn.next_frame().await,
        Some(ClientFrame::Text(r#"{"type":"subscribe_to_request","request_id":42}"#.to_string()))
    );
    assert_eq!(manager.queue_size(), 0);

    assert!(manager.send(&OutboundMessage::CancelRequest { request_id: 42 }));
    assert_eq!(
        conn.next_frame().await,
        Some(ClientFrame::Text(r#"{"type":"cancel_request","request_id":42}"#.to_string()))
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_abnormal_server_close_reconnects_with_a_new_token() {
    let mut backend = MockBackend::start().await;
    let manager = manager_with(backend.manager_config());

    manager.set_authenticated(true);
    let first = backend.next_conn().await.expect("no socket accepted");
    wait_state(&manager, ConnectionState::Connected).await;

    first.close(1011);
    let second = backend.next_conn().await.expect("no reconnect");
    assert_eq!(second.token, "tok-2");
    wait_state(&manager, ConnectionState::Connected).await;
    assert_eq!(manager.reconnect_attempt(), 0);
    assert_eq!(backend.tokens_issued(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_normal_server_close_is_final() {
    let mut backend = MockBackend::start().await;
    let manager = manager_with(backend.manager_config());

    manager.set_authenticated(true);
    let conn = backend.next_conn().await.expect("no socket accepted");
    wait_state(&manager, ConnectionState::Connected).await;

    conn.close(1000);
    wait_state(&manager, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(backend.try_next_conn().is_none());
    assert_eq!(backend.tokens_issued(), 1);
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_token_rejection_reports_error_then_recovers() {
    let mut backend = MockBackend::start().await;
    let config = ManagerConfig {
        backoff: vec![Duration::from_millis(400)],
        ..backend.manager_config()
    };
    let manager = manager_with(config);

    backend.fail_tokens(true);
    manager.set_authenticated(true);
    wait_state(&manager, ConnectionState::Error).await;
    assert!(manager.reconnect_attempt() >= 1);

    backend.fail_tokens(false);
    let conn = backend.next_conn().await.expect("no socket after recovery");
    assert_eq!(conn.token, "tok-1");
    wait_state(&manager, ConnectionState::Connected).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_logout_closes_normally_and_stays_down() {
    let mut backend = MockBackend::start().await;
    let manager = manager_with(backend.manager_config());

    manager.set_authenticated(true);
    let mut conn = backend.next_conn().await.expect("no socket accepted");
    wait_state(&manager, ConnectionState::Connected).await;

    manager.set_authenticated(false);
    assert_eq!(
        conn.next_frame().await,
        Some(ClientFrame::Closed(Some((1000, "User logged out".to_string()))))
    );
    wait_state(&manager, ConnectionState::Disconnected).await;

    assert!(!manager.send_text("while logged out"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(backend.try_next_conn().is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_carries_the_active_job() {
    let mut backend = MockBackend::start().await;
    let config = ManagerConfig {
        heartbeat_interval: Duration::from_millis(200),
        ..backend.manager_config()
    };
    let manager = manager_with(config);
    manager.set_active_job_id(Some("55".to_string()));

    manager.set_authenticated(true);
    let mut conn = backend.next_conn().await.expect("no socket accepted");

    let Some(ClientFrame::Text(text)) = conn.next_frame().await else {
        panic!("expected a heartbeat frame");
    };
    let beat: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(beat["type"], "user_heartbeat");
    assert_eq!(beat["job_id"], "55");
    assert!(beat["timestamp"].as_i64().unwrap() > 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_planned_refresh_rotates_the_token() {
    let mut backend = MockBackend::start().await;
    let config = ManagerConfig {
        refresh_interval: Duration::from_millis(300),
        refresh_delay: Duration::from_millis(100),
        ..backend.manager_config()
    };
    let manager = manager_with(config);

    manager.set_authenticated(true);
    let mut first = backend.next_conn().await.expect("no socket accepted");
    assert_eq!(
        first.next_frame().await,
        Some(ClientFrame::Closed(Some((1000, "refresh".to_string()))))
    );

    let second = backend.next_conn().await.expect("no socket after refresh");
    assert_eq!(second.token, "tok-2");
    wait_state(&manager, ConnectionState::Connected).await;
    assert_eq!(manager.reconnect_attempt(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_dropping_every_handle_closes_the_socket() {
    let mut backend = MockBackend::start().await;
    let manager = manager_with(backend.manager_config());

    manager.set_authenticated(true);
    let mut conn = backend.next_conn().await.expect("no socket accepted");
    wait_state(&manager, ConnectionState::Connected).await;

    drop(manager);
    assert_eq!(
        conn.next_frame().await,
        Some(ClientFrame::Closed(Some((1000, "Provider unmounted".to_string()))))
    );
}
