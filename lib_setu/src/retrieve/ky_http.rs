//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client around `reqwest` with a cookie jar, an optional
//! bearer token and exponential-backoff retries for transient failures.
//!
//! Paths are appended to the base URL as plain strings. `Url::join` would
//! replace the last segment of a base like `https://host/api`, and every
//! backend path is written relative to that `/api` prefix.
//!
//! Only idempotent methods go through the retry middleware. A POST that timed
//! out may already have been applied, so it is sent exactly once.
//!
//! A 401 triggers one session refresh (`POST {}` to the refresh path) and, if
//! that succeeds, one retry of the original request. Concurrent 401s share a
//! single refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

/// Retries applied to connection failures, timeouts and 5xx responses.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Endpoint that renews the session cookie.
pub const DEFAULT_REFRESH_PATH: &str = "/core/token/refresh/";

/// Called after every session refresh attempt with its outcome.
pub type RefreshListener = Arc<dyn Fn(bool) + Send + Sync>;

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized response body. `None` on failure or an empty 2xx body.
    pub data: Option<T>,
    /// The raw body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Shared HTTP client for the backend API.
///
/// Session cookies set by the backend are replayed on later requests, which
/// is how the token and profile endpoints recognise the logged-in user.
pub struct ApiClient {
    retrying: ClientWithMiddleware,
    single_shot: ClientWithMiddleware,
    base_url: String,
    auth_token: Option<String>,
    refresh_path: Option<String>,
    refresh_gate: tokio::sync::Mutex<()>,
    refresh_generation: AtomicU64,
    refresh_listener: Mutex<Option<RefreshListener>>,
}

impl ApiClient {
    /// Creates a client with the default retry policy.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the TLS backend cannot
    /// be initialised.
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        Self::with_retries(base_url, auth_token, DEFAULT_MAX_RETRIES)
    }

    /// Creates a client that retries transient failures of idempotent
    /// requests up to `max_retries` times.
    pub fn with_retries(
        base_url: &str,
        auth_token: Option<String>,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        Url::parse(base_url).with_context(|| format!("Invalid base URL '{}'", base_url))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        // Both wrappers share one connection pool and one cookie jar.
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;
        let retrying = ClientBuilder::new(http.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let single_shot = ClientBuilder::new(http).build();

        Ok(Self {
            retrying,
            single_shot,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            refresh_path: Some(DEFAULT_REFRESH_PATH.to_string()),
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            refresh_listener: Mutex::new(None),
        })
    }

    /// Replaces the session refresh endpoint. `None` turns refreshing off and
    /// 401 responses are returned as they are.
    pub fn with_refresh_path(mut self, path: Option<&str>) -> Self {
        self.refresh_path = path.map(str::to_string);
        self
    }

    /// Registers the callback told about each refresh outcome. Replaces any
    /// earlier one.
    pub fn on_session_refresh<F>(&self, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self
            .refresh_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// The base URL with any trailing slash removed.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves `path` against the base by concatenation.
    ///
    /// ```
    /// use lib_setu::retrieve::ApiClient;
    ///
    /// let client = ApiClient::new("https://example.com/api/", None).unwrap();
    /// let url = client.url_for("/core/ws-token/").unwrap();
    /// assert_eq!(url.as_str(), "https://example.com/api/core/ws-token/");
    /// ```
    pub fn url_for(&self, path: &str) -> anyhow::Result<Url> {
        let joined = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Url::parse(&joined).with_context(|| format!("Invalid request URL '{}'", joined))
    }

    /// Performs an HTTP request and decodes a JSON response.
    ///
    /// Non-2xx responses are not errors: they come back with `success ==
    /// false` and the body in `error_body`. A 401 is retried once after a
    /// successful session refresh; if the refresh fails the original 401 is
    /// returned.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be built, the request cannot be
    /// sent after retries, or a 2xx body is not valid JSON for `T`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let full_url = self.url_for(path)?;
        let json_body = body.map(|b| serde_json::to_string(&b)).transpose()?;

        let generation = self.refresh_generation.load(Ordering::Acquire);
        let mut response = self
            .send_once(method.clone(), full_url.clone(), headers.as_ref(), json_body.as_deref())
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && self.may_refresh(path)
            && self.refresh_session(generation).await
        {
            log::info!("Retrying {} {} after session refresh", method, full_url);
            response = self
                .send_once(method, full_url, headers.as_ref(), json_body.as_deref())
                .await?;
        }

        Self::into_api_response(response).await
    }

    async fn send_once(
        &self,
        method: Method,
        url: Url,
        headers: Option<&HeaderMap>,
        body: Option<&str>,
    ) -> anyhow::Result<reqwest::Response> {
        let client = if method.is_idempotent() {
            &self.retrying
        } else {
            &self.single_shot
        };
        log::debug!("{} {}", method, url);
        let mut req = client.request(method, url);

        if let Some(h) = headers {
            req = req.headers(h.clone());
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(b.to_string());
        }

        Ok(req.send().await?)
    }

    /// Refresh calls themselves never trigger a refresh.
    fn may_refresh(&self, path: &str) -> bool {
        match self.refresh_path.as_deref() {
            Some(refresh) => {
                let path = path.trim_start_matches('/');
                path != refresh.trim_start_matches('/') && !path.contains("token/refresh/")
            }
            None => false,
        }
    }

    /// Renews the session unless another request already did so since
    /// `seen_generation` was read. Returns whether a retry is worthwhile.
    async fn refresh_session(&self, seen_generation: u64) -> bool {
        let Some(refresh_path) = self.refresh_path.as_deref() else {
            return false;
        };
        let _gate = self.refresh_gate.lock().await;
        if self.refresh_generation.load(Ordering::Acquire) != seen_generation {
            return true;
        }

        log::info!("Attempting to refresh session...");
        let outcome = match self.url_for(refresh_path) {
            Ok(url) => self.send_once(Method::POST, url, None, Some("{}")).await,
            Err(e) => Err(e),
        };
        let refreshed = match outcome {
            Ok(resp) if resp.status().is_success() => {
                log::info!("Session refresh successful");
                true
            }
            Ok(resp) => {
                log::warn!("Session refresh rejected: HTTP {}", resp.status());
                false
            }
            Err(e) => {
                log::warn!("Session refresh failed: {:#}", e);
                false
            }
        };
        if refreshed {
            self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        }

        let listener = self
            .refresh_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(refreshed);
        }
        refreshed
    }

    async fn into_api_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> anyhow::Result<ApiResponse<T>> {
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let bytes = response.bytes().await?;
            let data = if bytes.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                Some(
                    serde_json::from_slice::<T>(&bytes)
                        .with_context(|| format!("Unexpected response body (HTTP {})", status))?,
                )
            };
            Ok(ApiResponse {
                data,
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            log::debug!("HTTP {} from backend: {:?}", status, error_text);
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieve::test_server::{request_line, scripted_server};

    fn recorder(client: &ApiClient) -> Arc<Mutex<Vec<bool>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.on_session_refresh(move |ok| sink.lock().unwrap().push(ok));
        seen
    }

    #[test]
    fn rejects_relative_base() {
        assert!(ApiClient::new("/api", None).is_err());
    }

    #[test]
    fn keeps_the_base_path_prefix() {
        let client = ApiClient::new("https://mechanic-setu.onrender.com/api", None).unwrap();
        assert_eq!(
            client.url_for("/Profile/UserProfile/").unwrap().as_str(),
            "https://mechanic-setu.onrender.com/api/Profile/UserProfile/"
        );
        assert_eq!(
            client.url_for("users/logout/").unwrap().as_str(),
            "https://mechanic-setu.onrender.com/api/users/logout/"
        );
    }

    #[tokio::test]
    async fn decodes_json_and_sends_bearer() {
        let (base, server) = scripted_server(vec![("200 OK", r#"{"ws_token":"abc"}"#)]);
        let client = ApiClient::new(&base, Some("secret".into())).unwrap();

        let resp = client
            .request::<serde_json::Value, ()>(Method::GET, "/core/ws-token/", None, None)
            .await
            .unwrap();
        let raw = server.join().unwrap();

        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["ws_token"], "abc");
        assert_eq!(request_line(&raw[0]), "GET /api/core/ws-token/ HTTP/1.1");
        assert!(raw[0].to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn client_errors_are_reported_not_raised() {
        let (base, server) = scripted_server(vec![("403 Forbidden", r#"{"detail":"no session"}"#)]);
        let client = ApiClient::new(&base, None).unwrap();

        let resp = client
            .request::<serde_json::Value, ()>(Method::GET, "/Profile/UserProfile/", None, None)
            .await
            .unwrap();
        server.join().unwrap();

        assert!(!resp.success);
        assert_eq!(resp.status, 403);
        assert!(resp.data.is_none());
        assert_eq!(resp.error_body.as_deref(), Some(r#"{"detail":"no session"}"#));
    }

    #[tokio::test]
    async fn empty_success_body_has_no_data() {
        let (base, server) = scripted_server(vec![("200 OK", "")]);
        let client = ApiClient::new(&base, None).unwrap();

        let resp = client
            .request::<serde_json::Value, _>(Method::POST, "/users/logout/", None, Some(serde_json::json!({})))
            .await
            .unwrap();
        let raw = server.join().unwrap();

        assert!(resp.success);
        assert!(resp.data.is_none());
        assert_eq!(request_line(&raw[0]), "POST /api/users/logout/ HTTP/1.1");
    }

    #[tokio::test]
    async fn post_is_sent_once_even_on_server_error() {
        // A retry would find no listener and surface as a transport error.
        let (base, server) = scripted_server(vec![("503 Service Unavailable", "busy")]);
        let client = ApiClient::with_retries(&base, None, 3).unwrap();

        let resp = client
            .request::<serde_json::Value, _>(
                Method::POST,
                "/users/Login_SignUp/",
                None,
                Some(serde_json::json!({"email": "a@b.c"})),
            )
            .await
            .unwrap();
        let raw = server.join().unwrap();

        assert_eq!(resp.status, 503);
        assert_eq!(resp.error_body.as_deref(), Some("busy"));
        assert_eq!(raw.len(), 1);
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_and_retried_once() {
        let (base, server) = scripted_server(vec![
            ("401 Unauthorized", r#"{"detail":"expired"}"#),
            ("200 OK", "{}"),
            ("200 OK", r#"{"ws_token":"fresh"}"#),
        ]);
        let client = ApiClient::with_retries(&base, None, 0).unwrap();
        let outcomes = recorder(&client);

        let resp = client
            .request::<serde_json::Value, ()>(Method::GET, "/core/ws-token/", None, None)
            .await
            .unwrap();
        let raw = server.join().unwrap();

        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["ws_token"], "fresh");
        let lines: Vec<&str> = raw.iter().map(|r| request_line(r)).collect();
        assert_eq!(
            lines,
            [
                "GET /api/core/ws-token/ HTTP/1.1",
                "POST /api/core/token/refresh/ HTTP/1.1",
                "GET /api/core/ws-token/ HTTP/1.1",
            ]
        );
        assert!(raw[1].ends_with("{}"));
        assert_eq!(*outcomes.lock().unwrap(), [true]);
    }

    #[tokio::test]
    async fn failed_refresh_returns_the_original_401() {
        let (base, server) = scripted_server(vec![
            ("401 Unauthorized", r#"{"detail":"expired"}"#),
            ("401 Unauthorized", r#"{"detail":"refresh expired"}"#),
        ]);
        let client = ApiClient::with_retries(&base, None, 0).unwrap();
        let outcomes = recorder(&client);

        let resp = client
            .request::<serde_json::Value, ()>(Method::GET, "/Profile/UserProfile/", None, None)
            .await
            .unwrap();
        let raw = server.join().unwrap();

        assert_eq!(resp.status, 401);
        assert_eq!(resp.error_body.as_deref(), Some(r#"{"detail":"expired"}"#));
        assert_eq!(raw.len(), 2);
        assert_eq!(*outcomes.lock().unwrap(), [false]);
    }

    #[tokio::test]
    async fn refresh_endpoint_never_refreshes_itself() {
        let (base, server) = scripted_server(vec![("401 Unauthorized", "{}")]);
        let client = ApiClient::with_retries(&base, None, 0).unwrap();
        let outcomes = recorder(&client);

        let resp = client
            .request::<serde_json::Value, _>(
                Method::POST,
                DEFAULT_REFRESH_PATH,
                None,
                Some(serde_json::json!({})),
            )
            .await
            .unwrap();
        let raw = server.join().unwrap();

        assert_eq!(resp.status, 401);
        assert_eq!(raw.len(), 1);
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_can_be_turned_off() {
        let (base, server) = scripted_server(vec![("401 Unauthorized", "{}")]);
        let client = ApiClient::with_retries(&base, None, 0)
            .unwrap()
            .with_refresh_path(None);

        let resp = client
            .request::<serde_json::Value, ()>(Method::GET, "/core/ws-token/", None, None)
            .await
            .unwrap();

        assert_eq!(resp.status, 401);
        assert_eq!(server.join().unwrap().len(), 1);
    }
}
