//! # Duplex Transport Seam
//!
//! The manager never touches a websocket library directly. It asks a
//! `Transport` to open a `Socket` and receives the socket's lifecycle through
//! an `EventSink`. The production implementation lives in `ws_transport`;
//! tests plug in a scripted fake.

use std::fmt;
use std::sync::Arc;

use super::endpoint::SocketEndpoint;
use super::error::RealtimeError;

/// Close code for a deliberate client-side closure. Suppresses reconnects.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Mirrors the websocket `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Lifecycle notifications emitted by a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    /// A text frame (binary frames are forwarded only if valid UTF-8).
    Message(String),
    /// `code` is `None` when the peer vanished without a close frame.
    Close { code: Option<u16>, reason: String },
    Error(String),
}

/// Callback handed to a transport for one socket instance.
#[derive(Clone)]
pub struct EventSink {
    emit: Arc<dyn Fn(SocketEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new<F>(emit: F) -> Self
    where
        F: Fn(SocketEvent) + Send + Sync + 'static,
    {
        Self { emit: Arc::new(emit) }
    }

    pub fn emit(&self, event: SocketEvent) {
        (self.emit)(event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// A live (or opening) socket owned by the manager.
pub trait Socket: Send {
    fn ready_state(&self) -> ReadyState;

    /// Queues a text frame. Must not block; fails when the socket is not open
    /// or its writer is gone.
    fn send(&self, text: &str) -> Result<(), RealtimeError>;

    /// Starts a close handshake, or abandons a pending open. Idempotent.
    fn close(&self, code: u16, reason: &str);
}

/// Opens sockets. Implementations must return immediately and report the
/// outcome through `events`.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, endpoint: &SocketEndpoint, events: EventSink) -> Box<dyn Socket>;
}
