//! One-time connection token acquisition.

use futures_util::future::BoxFuture;

use super::error::RealtimeError;

/// Issues short-lived tokens that authorize a single socket connection.
///
/// The returned future is spawned by the manager, so it must own everything
/// it needs.
pub trait TokenProvider: Send + Sync + 'static {
    fn fetch_token(&self) -> BoxFuture<'static, Result<String, RealtimeError>>;
}

#[cfg(feature = "retrieve")]
pub use rest::RestTokenProvider;

#[cfg(feature = "retrieve")]
mod rest {
    use std::sync::Arc;

    use futures_util::future::BoxFuture;
    use reqwest::Method;
    use serde::Deserialize;

    use super::TokenProvider;
    use crate::realtime::error::RealtimeError;
    use crate::retrieve::ky_http::ApiClient;

    #[derive(Debug, Deserialize)]
    struct WsTokenResponse {
        ws_token: Option<String>,
    }

    /// Fetches `{ "ws_token": "..." }` from the backend over the shared REST client.
    pub struct RestTokenProvider {
        client: Arc<ApiClient>,
        path: String,
    }

    impl RestTokenProvider {
        pub fn new(client: Arc<ApiClient>, path: impl Into<String>) -> Self {
            Self {
                client,
                path: path.into(),
            }
        }
    }

    impl TokenProvider for RestTokenProvider {
        fn fetch_token(&self) -> BoxFuture<'static, Result<String, RealtimeError>> {
            let client = Arc::clone(&self.client);
            let path = self.path.clone();
            Box::pin(async move {
                let response = client
                    .request::<WsTokenResponse, ()>(Method::GET, &path, None, None)
                    .await
                    .map_err(|e| RealtimeError::TokenRequest(format!("{:#}", e)))?;

                if !response.success {
                    return Err(RealtimeError::TokenRequest(format!(
                        "HTTP {}: {}",
                        response.status,
                        response.error_body.unwrap_or_default()
                    )));
                }

                response
                    .data
                    .and_then(|body| body.ws_token)
                    .filter(|token| !token.is_empty())
                    .ok_or(RealtimeError::MissingToken)
            })
        }
    }
}
