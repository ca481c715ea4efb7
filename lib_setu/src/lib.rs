//! # lib_setu
//!
//! Client-side plumbing for the Mechanic Setu job notification channel.
//! Each top-level folder is gated behind a cargo feature of the same name.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// The connection manager for the job notification socket.
#[cfg(feature = "realtime")]
pub mod realtime;

/// REST client with retry middleware.
#[cfg(feature = "retrieve")]
pub mod retrieve;

/// Key-value persistence interface.
#[cfg(feature = "storage")]
pub mod storage;

/// Auth oracle over the profile endpoint and the persisted login flag.
#[cfg(feature = "auth")]
pub mod auth;

#[cfg(feature = "realtime")]
pub use realtime::{
    AppLifecycle, ConnectionManager, ConnectionState, InboundMessage, ManagerConfig,
    OutboundMessage, RealtimeError,
};
