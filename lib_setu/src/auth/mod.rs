//! # Auth Module
//!
//! `AuthState` is the auth oracle the connection manager follows. The backend
//! keeps the session in a cookie, so "authenticated" simply means the profile
//! endpoint answers with a user. The verdict is published on a `watch`
//! channel and mirrored into the key-value store as the `Logged` flag so a
//! cold start can tell whether a session is worth checking.

use std::sync::{Arc, Mutex, PoisonError};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::retrieve::ApiClient;
use crate::storage::KeyValueStore;

pub const LOGGED_KEY: &str = "Logged";
pub const OTP_CONTEXT_KEY: &str = "otp_ctx";

pub const PROFILE_PATH: &str = "/Profile/UserProfile/";
pub const LOGOUT_PATH: &str = "/users/logout/";
pub const LOGIN_PATH: &str = "/users/Login_SignUp/";
pub const VERIFY_OTP_PATH: &str = "/users/otp-verify/";
pub const RESEND_OTP_PATH: &str = "/users/resend-otp/";
pub const GOOGLE_LOGIN_PATH: &str = "/users/google/";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Request(String),
    #[error("rejected by server (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Server reply to a login request, needed to verify the emailed code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpChallenge {
    pub key: String,
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

fn id_as_string<'de, D: serde::Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected id {}", other))),
    }
}

impl OtpChallenge {
    /// The backend marks first-time sign-ups, which still owe a profile form.
    pub fn is_new_user(&self) -> bool {
        self.status.as_deref() == Some("New User")
    }
}

/// Outcome of a Google sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoogleLogin {
    /// First sign-in; the profile form is still owed, no session check runs.
    NewUser,
    /// Known account; carries the verdict of the follow-up session check.
    Existing { authenticated: bool },
}

/// Pulls the `error` field out of a JSON error body, falling back to the raw text.
fn rejection(status: u16, body: Option<String>, fallback: &str) -> AuthError {
    let body = body.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("detail"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| if body.is_empty() { fallback.to_string() } else { body });
    AuthError::Rejected { status, message }
}

pub struct AuthState {
    client: Arc<ApiClient>,
    store: Arc<dyn KeyValueStore>,
    user: Mutex<Option<Value>>,
    authenticated: watch::Sender<bool>,
}

impl AuthState {
    /// Starts unauthenticated; call `check_auth` to learn the real state.
    ///
    /// Session refreshes done by `client` are mirrored into the `Logged` flag.
    /// A failed refresh also drops the pending OTP context.
    pub fn new(client: Arc<ApiClient>, store: Arc<dyn KeyValueStore>) -> Self {
        let (authenticated, _) = watch::channel(false);
        let refresh_store = Arc::clone(&store);
        client.on_session_refresh(move |refreshed| {
            let value = if refreshed { "true" } else { "false" };
            if let Err(e) = refresh_store.set(LOGGED_KEY, value) {
                log::warn!("Could not persist login flag: {}", e);
            }
            if !refreshed {
                if let Err(e) = refresh_store.delete(OTP_CONTEXT_KEY) {
                    log::warn!("Could not delete {}: {}", OTP_CONTEXT_KEY, e);
                }
            }
        });
        Self {
            client,
            store,
            user: Mutex::new(None),
            authenticated,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.authenticated.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        *self.authenticated.borrow()
    }

    /// Profile returned by the last successful check.
    pub fn user(&self) -> Option<Value> {
        self.user.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Reads the persisted `Logged` flag. Storage errors count as "no".
    pub fn was_logged_in(&self) -> bool {
        match self.store.get(LOGGED_KEY) {
            Ok(flag) => flag.as_deref() == Some("true"),
            Err(e) => {
                log::warn!("Could not read login flag: {}", e);
                false
            }
        }
    }

    fn set_user(&self, user: Option<Value>) {
        let authenticated = user.is_some();
        *self.user.lock().unwrap_or_else(PoisonError::into_inner) = user;
        self.authenticated.send_if_modified(|current| {
            let changed = *current != authenticated;
            *current = authenticated;
            changed
        });
    }

    fn persist_flag(&self, logged: bool) {
        let value = if logged { "true" } else { "false" };
        if let Err(e) = self.store.set(LOGGED_KEY, value) {
            log::warn!("Could not persist login flag: {}", e);
        }
    }

    /// Fetches the profile and publishes the verdict. Returns it as well.
    pub async fn check_auth(&self) -> bool {
        log::info!("Checking login status...");
        let outcome = self
            .client
            .request::<Value, ()>(Method::GET, PROFILE_PATH, None, None)
            .await;

        let user = match outcome {
            Ok(resp) if resp.success => resp.data.filter(|v| !v.is_null()),
            Ok(resp) => {
                log::info!("Not logged in or session expired (HTTP {})", resp.status);
                None
            }
            Err(e) => {
                log::info!("Not logged in or session expired: {:#}", e);
                None
            }
        };

        let authenticated = user.is_some();
        if authenticated {
            log::info!("User profile fetched");
        }
        self.set_user(user);
        self.persist_flag(authenticated);
        authenticated
    }

    /// Requests an emailed one-time code for `email`.
    pub async fn login(&self, email: &str) -> Result<OtpChallenge, AuthError> {
        log::info!("Requesting login code for {}", email);
        let resp = self
            .client
            .request::<OtpChallenge, _>(
                Method::POST,
                LOGIN_PATH,
                None,
                Some(serde_json::json!({ "email": email })),
            )
            .await
            .map_err(|e| AuthError::Request(format!("{:#}", e)))?;

        if !resp.success {
            return Err(rejection(
                resp.status,
                resp.error_body,
                "Login failed. Please check your email or try again.",
            ));
        }
        resp.data
            .ok_or_else(|| AuthError::Request("empty login response".to_string()))
    }

    /// Submits the emailed code, then re-checks the session.
    pub async fn verify_otp(&self, challenge: &OtpChallenge, otp: &str) -> Result<bool, AuthError> {
        let payload = serde_json::json!({
            "key": challenge.key,
            "id": challenge.id,
            "otp": otp,
        });
        let resp = self
            .client
            .request::<Value, _>(Method::POST, VERIFY_OTP_PATH, None, Some(payload))
            .await
            .map_err(|e| AuthError::Request(format!("{:#}", e)))?;

        if !resp.success {
            return Err(rejection(resp.status, resp.error_body, "Verification failed. Try again."));
        }
        Ok(self.check_auth().await)
    }

    /// Asks for a new code for an outstanding challenge.
    pub async fn resend_otp(&self, challenge: &OtpChallenge) -> Result<Value, AuthError> {
        log::info!("Resending OTP...");
        let payload = serde_json::json!({ "key": challenge.key, "id": challenge.id });
        let resp = self
            .client
            .request::<Value, _>(Method::POST, RESEND_OTP_PATH, None, Some(payload))
            .await
            .map_err(|e| AuthError::Request(format!("{:#}", e)))?;

        if !resp.success {
            return Err(rejection(
                resp.status,
                resp.error_body,
                "Failed to resend OTP. Try again later.",
            ));
        }
        Ok(resp.data.unwrap_or(Value::Null))
    }

    /// Exchanges a Google ID token for a backend session.
    pub async fn google_login(&self, token: &str) -> Result<GoogleLogin, AuthError> {
        log::info!("Google login with token");
        let resp = self
            .client
            .request::<Value, _>(
                Method::POST,
                GOOGLE_LOGIN_PATH,
                None,
                Some(serde_json::json!({ "token": token })),
            )
            .await
            .map_err(|e| AuthError::Request(format!("{:#}", e)))?;

        if !resp.success {
            return Err(rejection(
                resp.status,
                resp.error_body,
                "Google login failed on our server.",
            ));
        }
        let status = resp
            .data
            .as_ref()
            .and_then(|v| v.get("status"))
            .and_then(Value::as_str);
        if status == Some("New User") {
            return Ok(GoogleLogin::NewUser);
        }
        Ok(GoogleLogin::Existing {
            authenticated: self.check_auth().await,
        })
    }

    /// Ends the session. A server-side failure is logged and local state is
    /// cleared regardless.
    pub async fn logout(&self) {
        log::info!("Logging out...");
        match self
            .client
            .request::<Value, ()>(Method::POST, LOGOUT_PATH, None, None)
            .await
        {
            Ok(resp) if !resp.success => {
                log::error!("Logout failed on server: HTTP {}", resp.status)
            }
            Err(e) => log::error!("Logout failed on server: {:#}", e),
            Ok(_) => {}
        }

        self.set_user(None);
        for key in [LOGGED_KEY, OTP_CONTEXT_KEY] {
            if let Err(e) = self.store.delete(key) {
                log::warn!("Could not delete {}: {}", key, e);
            }
        }
    }
}
