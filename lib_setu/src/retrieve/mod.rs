//! # Data Retrieval Module
//!
//! The REST side of the backend conversation. Everything that talks HTTP to
//! the Mechanic Setu API (the socket token endpoint, the profile check used as
//! the auth oracle, logout) goes through the one client defined here, so
//! retries, cookies and URL joining behave the same everywhere.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: `ApiClient`, built on `reqwest` and `reqwest-middleware`,
//!   with transient-error retries on an exponential backoff for idempotent
//!   methods, and a one-shot session refresh when the backend answers 401.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse, RefreshListener};

#[cfg(test)]
pub(crate) mod test_server;
