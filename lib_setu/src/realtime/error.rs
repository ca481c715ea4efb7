use thiserror::Error;

/// Errors raised inside the realtime layer.
///
/// None of these cross the `ConnectionManager` boundary; they are logged and
/// folded into `ConnectionState::Error` plus a scheduled reconnect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// The token endpoint could not be reached or answered with a failure status.
    #[error("Token request failed: {0}")]
    TokenRequest(String),

    /// The token endpoint answered but without a usable `ws_token`.
    #[error("Token response carried no ws_token")]
    MissingToken,

    /// The configured REST base cannot be turned into a socket endpoint.
    #[error("Invalid API base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    /// The socket is not in the open state.
    #[error("Socket is not open")]
    NotOpen,

    /// The underlying transport rejected or lost the frame.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An outbound structure could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Serialization(e.to_string())
    }
}
