//! Scripted transport and token provider for driving the manager in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::endpoint::SocketEndpoint;
use super::error::RealtimeError;
use super::token::TokenProvider;
use super::transport::{EventSink, ReadyState, Socket, SocketEvent, Transport};

struct FakeSocketInner {
    state: ReadyState,
    sent: Vec<String>,
    fail_all: bool,
    fail_next: usize,
    closed_with: Option<(u16, String)>,
}

#[derive(Clone)]
pub(crate) struct FakeSocket {
    inner: Arc<Mutex<FakeSocketInner>>,
}

impl FakeSocket {
    pub(crate) fn new(state: ReadyState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeSocketInner {
                state,
                sent: Vec::new(),
                fail_all: false,
                fail_next: 0,
                closed_with: None,
            })),
        }
    }

    pub(crate) fn set_state(&self, state: ReadyState) {
        self.inner.lock().unwrap().state = state;
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.inner.lock().unwrap().fail_all = fail;
    }

    pub(crate) fn fail_next(&self, count: usize) {
        self.inner.lock().unwrap().fail_next = count;
    }

    pub(crate) fn closed_with(&self) -> Option<(u16, String)> {
        self.inner.lock().unwrap().closed_with.clone()
    }
}

impl Socket for FakeSocket {
    fn ready_state(&self) -> ReadyState {
        self.inner.lock().unwrap().state
    }

    fn send(&self, text: &str) -> Result<(), RealtimeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ReadyState::Open {
            return Err(RealtimeError::NotOpen);
        }
        if inner.fail_all {
            return Err(RealtimeError::Transport("scripted failure".into()));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(RealtimeError::Transport("scripted failure".into()));
        }
        inner.sent.push(text.to_string());
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, ReadyState::Connecting | ReadyState::Open) {
            inner.state = ReadyState::Closed;
            inner.closed_with = Some((code, reason.to_string()));
        }
    }
}

/// One `Transport::open` call, handed to the test to script.
pub(crate) struct FakeConn {
    pub(crate) socket: FakeSocket,
    pub(crate) sink: EventSink,
    pub(crate) endpoint: SocketEndpoint,
    pub(crate) opened_at: Instant,
}

impl FakeConn {
    pub(crate) fn open(&self) {
        self.socket.set_state(ReadyState::Open);
        self.sink.emit(SocketEvent::Open);
    }

    pub(crate) fn message(&self, text: &str) {
        self.sink.emit(SocketEvent::Message(text.to_string()));
    }

    pub(crate) fn close_remote(&self, code: Option<u16>) {
        self.socket.set_state(ReadyState::Closed);
        self.sink.emit(SocketEvent::Close {
            code,
            reason: String::new(),
        });
    }

    pub(crate) fn error(&self, message: &str) {
        self.socket.set_state(ReadyState::Closed);
        self.sink.emit(SocketEvent::Error(message.to_string()));
    }
}

pub(crate) struct FakeTransport {
    opened: mpsc::UnboundedSender<FakeConn>,
}

pub(crate) fn fake_transport() -> (FakeTransport, mpsc::UnboundedReceiver<FakeConn>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FakeTransport { opened: tx }, rx)
}

impl Transport for FakeTransport {
    fn open(&self, endpoint: &SocketEndpoint, events: EventSink) -> Box<dyn Socket> {
        let socket = FakeSocket::new(ReadyState::Connecting);
        let _ = self.opened.send(FakeConn {
            socket: socket.clone(),
            sink: events,
            endpoint: endpoint.clone(),
            opened_at: Instant::now(),
        });
        Box::new(socket)
    }
}

/// Hands out `tok-1`, `tok-2`, ... unless a scripted result is queued.
#[derive(Clone, Default)]
pub(crate) struct FakeTokens {
    script: Arc<Mutex<VecDeque<Result<String, RealtimeError>>>>,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Notify>>,
}

impl FakeTokens {
    /// Every fetch waits for one `notify_one` on the returned gate.
    pub(crate) fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let tokens = Self {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        (tokens, gate)
    }

    pub(crate) fn push(&self, result: Result<String, RealtimeError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenProvider for FakeTokens {
    fn fetch_token(&self) -> BoxFuture<'static, Result<String, RealtimeError>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.script.lock().unwrap().pop_front();
        let gate = self.gate.clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            scripted.unwrap_or_else(|| Ok(format!("tok-{}", n)))
        })
    }
}
