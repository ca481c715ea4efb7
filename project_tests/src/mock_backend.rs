//! In-process stand-in for the Mechanic Setu backend.
//!
//! Serves the REST endpoints the client touches (OTP login, profile, logout,
//! socket token, session refresh) and the job notification websocket. Socket upgrades are
//! refused unless the `Origin` header matches the server and the token was
//! issued by this backend and not used before. Each accepted socket is handed
//! to the test as a `ServerConn` it can script.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::{COOKIE, ORIGIN, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use lib_setu::ManagerConfig;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const VALID_OTP: &str = "123456";
const SESSION_COOKIE: &str = "sessionid=valid";
const WAIT: Duration = Duration::from_secs(5);

/// What the client sent on an accepted socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    /// Close frame code and reason, or `None` when the connection just dropped.
    Closed(Option<(u16, String)>),
}

enum ServerCmd {
    Text(String),
    Close(u16),
}

/// Server side of one accepted socket.
pub struct ServerConn {
    pub token: String,
    inbound: mpsc::UnboundedReceiver<ClientFrame>,
    outbound: mpsc::UnboundedSender<ServerCmd>,
}

impl ServerConn {
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.outbound.send(ServerCmd::Text(text.into()));
    }

    pub fn close(&self, code: u16) {
        let _ = self.outbound.send(ServerCmd::Close(code));
    }

    /// Next frame from the client, or `None` after five seconds.
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        tokio::time::timeout(WAIT, self.inbound.recv()).await.ok().flatten()
    }
}

struct BackendState {
    expected_origin: String,
    tokens_issued: AtomicUsize,
    unused_tokens: Mutex<HashSet<String>>,
    fail_tokens: AtomicBool,
    require_session: AtomicBool,
    access_expired: AtomicBool,
    refresh_attempts: AtomicUsize,
    refreshes: AtomicUsize,
    rejected_upgrades: AtomicUsize,
    conns: mpsc::UnboundedSender<ServerConn>,
}

pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    server: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let addr = listener.local_addr().expect("listener has no address");
        let (conns_tx, conns) = mpsc::unbounded_channel();

        let state = Arc::new(BackendState {
            expected_origin: format!("http://{}", addr),
            tokens_issued: AtomicUsize::new(0),
            unused_tokens: Mutex::new(HashSet::new()),
            fail_tokens: AtomicBool::new(false),
            require_session: AtomicBool::new(false),
            access_expired: AtomicBool::new(false),
            refresh_attempts: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            rejected_upgrades: AtomicUsize::new(0),
            conns: conns_tx,
        });

        let app = Router::new()
            .route("/api/core/ws-token/", get(ws_token))
            .route("/api/core/token/refresh/", post(refresh))
            .route("/api/Profile/UserProfile/", get(profile))
            .route("/api/users/Login_SignUp/", post(login))
            .route("/api/users/otp-verify/", post(verify_otp))
            .route("/api/users/logout/", post(logout))
            .route("/ws/job_notifications/", get(upgrade))
            .with_state(Arc::clone(&state));

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("mock backend stopped: {}", e);
            }
        });

        Self {
            addr,
            state,
            conns,
            server,
        }
    }

    pub fn api_base(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    /// Manager settings pointed at this backend, with a short backoff table.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            api_base_url: self.api_base(),
            backoff: vec![Duration::from_millis(100), Duration::from_millis(200)],
            ..ManagerConfig::default()
        }
    }

    /// Makes the token endpoint answer 403 while set.
    pub fn fail_tokens(&self, fail: bool) {
        self.state.fail_tokens.store(fail, Ordering::SeqCst);
    }

    /// Makes the token endpoint demand the session cookie.
    pub fn require_session(&self, require: bool) {
        self.state.require_session.store(require, Ordering::SeqCst);
    }

    /// Makes the token endpoint answer 401 until the session is refreshed.
    pub fn expire_access(&self, expired: bool) {
        self.state.access_expired.store(expired, Ordering::SeqCst);
    }

    /// Calls to the refresh endpoint, successful or not.
    pub fn refresh_attempts(&self) -> usize {
        self.state.refresh_attempts.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.state.refreshes.load(Ordering::SeqCst)
    }

    pub fn tokens_issued(&self) -> usize {
        self.state.tokens_issued.load(Ordering::SeqCst)
    }

    pub fn rejected_upgrades(&self) -> usize {
        self.state.rejected_upgrades.load(Ordering::SeqCst)
    }

    /// Next accepted socket, or `None` after five seconds.
    pub async fn next_conn(&mut self) -> Option<ServerConn> {
        tokio::time::timeout(WAIT, self.conns.recv()).await.ok().flatten()
    }

    /// An accepted socket that has not been collected yet, if any.
    pub fn try_next_conn(&mut self) -> Option<ServerConn> {
        self.conns.try_recv().ok()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": "Authentication credentials were not provided." })),
    )
        .into_response()
}

fn has_session(headers: &HeaderMap) -> bool {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|cookies| cookies.split(';').any(|c| c.trim() == SESSION_COOKIE))
}

async fn ws_token(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    if state.fail_tokens.load(Ordering::SeqCst) {
        return (StatusCode::FORBIDDEN, Json(json!({ "detail": "token service disabled" }))).into_response();
    }
    if state.access_expired.load(Ordering::SeqCst)
        || (state.require_session.load(Ordering::SeqCst) && !has_session(&headers))
    {
        return unauthorized();
    }
    let n = state.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("tok-{}", n);
    state
        .unused_tokens
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(token.clone());
    Json(json!({ "ws_token": token })).into_response()
}

async fn refresh(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    state.refresh_attempts.fetch_add(1, Ordering::SeqCst);
    if state.require_session.load(Ordering::SeqCst) && !has_session(&headers) {
        return unauthorized();
    }
    state.access_expired.store(false, Ordering::SeqCst);
    state.refreshes.fetch_add(1, Ordering::SeqCst);
    Json(json!({})).into_response()
}

async fn profile(headers: HeaderMap) -> Response {
    if has_session(&headers) {
        Json(json!({ "id": 1, "email": "mechanic@setu.test", "first_name": "Ravi" })).into_response()
    } else {
        unauthorized()
    }
}

async fn login(Json(body): Json<Value>) -> Response {
    match body.get("email").and_then(Value::as_str) {
        Some(email) if email.contains('@') => {
            Json(json!({ "key": "otp-key-1", "id": 1, "status": "Existing User" })).into_response()
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid email" }))).into_response(),
    }
}

async fn verify_otp(Json(body): Json<Value>) -> Response {
    if body.get("otp").and_then(Value::as_str) == Some(VALID_OTP) {
        (
            [(SET_COOKIE, format!("{}; Path=/", SESSION_COOKIE))],
            Json(json!({ "message": "Login successful" })),
        )
            .into_response()
    } else {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid OTP" }))).into_response()
    }
}

async fn logout() -> Response {
    (
        [(SET_COOKIE, "sessionid=; Max-Age=0; Path=/".to_string())],
        Json(json!({ "message": "Logged out" })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn upgrade(
    State(state): State<Arc<BackendState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok()).unwrap_or_default();
    let token = query.token.unwrap_or_default();
    let token_ok = state
        .unused_tokens
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&token);

    if origin != state.expected_origin || !token_ok {
        state.rejected_upgrades.fetch_add(1, Ordering::SeqCst);
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| serve(socket, token, state))
}

async fn serve(socket: WebSocket, token: String, state: Arc<BackendState>) {
    let (in_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, mut commands) = mpsc::unbounded_channel();
    if state
        .conns
        .send(ServerConn {
            token,
            inbound,
            outbound,
        })
        .is_err()
    {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let mut scripted = true;
    loop {
        tokio::select! {
            cmd = commands.recv(), if scripted => match cmd {
                Some(ServerCmd::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCmd::Close(code)) => {
                    let frame = CloseFrame { code, reason: "".into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                // The test let go of the connection; keep serving it.
                None => scripted = false,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = in_tx.send(ClientFrame::Text(text.as_str().to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let _ = in_tx.send(ClientFrame::Closed(
                        frame.map(|f| (f.code, f.reason.as_str().to_string())),
                    ));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    let _ = in_tx.send(ClientFrame::Closed(None));
                    break;
                }
            },
        }
    }
}
