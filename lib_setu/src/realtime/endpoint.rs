//! Socket endpoint derivation from the REST base.

use url::Url;

use super::error::RealtimeError;

/// Where and how to open the notification socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEndpoint {
    /// Full `ws://` or `wss://` URL including the `token` query parameter.
    pub url: Url,
    /// Value for the `Origin` header; the backend rejects upgrades without it.
    pub origin: String,
}

impl SocketEndpoint {
    /// Builds the endpoint for `token`.
    ///
    /// `http` maps to `ws` and `https` to `wss`. A trailing `/api` segment on
    /// the base path is dropped before `notification_path` is appended.
    ///
    /// ```
    /// use lib_setu::realtime::endpoint::SocketEndpoint;
    ///
    /// let ep = SocketEndpoint::derive(
    ///     "https://mechanic-setu.onrender.com/api",
    ///     "/ws/job_notifications/",
    ///     "abc",
    /// ).unwrap();
    /// assert_eq!(ep.url.as_str(), "wss://mechanic-setu.onrender.com/ws/job_notifications/?token=abc");
    /// assert_eq!(ep.origin, "https://mechanic-setu.onrender.com");
    /// ```
    pub fn derive(
        api_base: &str,
        notification_path: &str,
        token: &str,
    ) -> Result<Self, RealtimeError> {
        let invalid = |reason: String| RealtimeError::InvalidBaseUrl {
            url: api_base.to_string(),
            reason,
        };

        let mut url = Url::parse(api_base).map_err(|e| invalid(e.to_string()))?;
        let ws_scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }

        // http(s) origin serializes as scheme://host[:non-default-port]
        let origin = url.origin().ascii_serialization();

        let base_path = url.path().trim_end_matches('/');
        let base_path = base_path.strip_suffix("/api").unwrap_or(base_path);
        let path = format!("{}/{}", base_path, notification_path.trim_start_matches('/'));

        url.set_scheme(ws_scheme)
            .map_err(|_| invalid(format!("cannot switch scheme to {}", ws_scheme)))?;
        url.set_path(&path);
        url.set_fragment(None);
        url.set_query(None);
        url.query_pairs_mut().append_pair("token", token);

        Ok(Self { url, origin })
    }
}
