//! # Realtime Module
//!
//! The job notification channel: one persistent socket per authenticated
//! session, recovered transparently across network flaps, app backgrounding
//! and token rotation.
//!
//! ## Components:
//!
//! - **`manager`**: the `ConnectionManager` handle and its driver task. All
//!   state transitions (connect, open, close, error, backoff, refresh,
//!   foreground reattachment, teardown) happen in the driver, one event at a
//!   time.
//! - **`session`**: the mutable per-login state (socket, outbound queue,
//!   counters) shared between the driver and `send`.
//! - **`transport`** / **`ws_transport`**: the duplex socket seam and its
//!   `tokio-tungstenite` implementation.
//! - **`token`**: one-time connection tokens, including the REST provider.
//! - **`endpoint`**: socket URL and `Origin` derivation from the REST base.
//! - **`messages`**: outbound frame shapes and inbound accessors.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod messages;
pub mod session;
pub mod token;
pub mod transport;
pub mod ws_transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ManagerConfig, DEFAULT_BACKOFF};
pub use endpoint::SocketEndpoint;
pub use error::RealtimeError;
pub use lifecycle::AppLifecycle;
pub use manager::ConnectionManager;
pub use messages::{encode_frame, InboundKind, InboundMessage, OutboundMessage};
pub use session::ConnectionState;
pub use token::TokenProvider;
#[cfg(feature = "retrieve")]
pub use token::RestTokenProvider;
pub use transport::{EventSink, ReadyState, Socket, SocketEvent, Transport, NORMAL_CLOSURE};
pub use ws_transport::WsTransport;
