//! Shared fixtures for the end-to-end tests.

pub mod mock_backend;

pub use mock_backend::{ClientFrame, MockBackend, ServerConn};
