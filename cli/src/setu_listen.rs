use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lib_setu::auth::{AuthState, GoogleLogin};
use lib_setu::realtime::{RestTokenProvider, WsTransport};
use lib_setu::retrieve::ApiClient;
use lib_setu::storage::{FileStore, KeyValueStore};
use lib_setu::{ConnectionManager, OutboundMessage};
use tokio::io::{AsyncBufReadExt, BufReader};

mod setu_logic;
use setu_logic::{config, logger, signals};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    logger::setup_logging(config.log_dir(), config.log_level())?;

    let manager_config = config.manager_config();
    let client = Arc::new(
        ApiClient::new(&manager_config.api_base_url, None).context("Failed to create API client")?,
    );
    let store_path = config.store_path();
    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(&store_path)
            .with_context(|| format!("Failed to open session store {}", store_path.display()))?,
    );
    let auth = Arc::new(AuthState::new(Arc::clone(&client), store));

    let tokens = RestTokenProvider::new(Arc::clone(&client), manager_config.token_path.clone());
    let manager = ConnectionManager::spawn(manager_config, tokens, WsTransport);

    if config.assume_authenticated.unwrap_or(false) {
        log::info!("Assuming an authenticated session");
        manager.set_authenticated(true);
    } else {
        if auth.was_logged_in() {
            log::info!("A previous session was recorded; checking it");
        }
        let mut authenticated = auth.check_auth().await;
        if !authenticated {
            if let Some(token) = &config.google_token {
                authenticated = login_with_google(&auth, token).await?;
            }
        }
        if !authenticated {
            if let Some(email) = &config.email {
                authenticated = login_with_otp(&auth, email).await?;
            }
        }
        if !authenticated {
            bail!("Not logged in. Pass --email or --google-token to log in, or --assume-authenticated true.");
        }
        let _auth_bridge = manager.follow_auth(auth.subscribe());
    }
    let _lifecycle_bridge = manager.follow_lifecycle(signals::lifecycle_signals());

    if let Some(job_id) = &config.job_id {
        manager.set_active_job_id(Some(job_id.clone()));
    }
    if let Some(request_id) = config.request_id {
        manager.send(&OutboundMessage::SubscribeToRequest { request_id });
    }

    let printer = tokio::spawn(print_messages(manager.clone()));
    let status = tokio::spawn(report_status(manager.clone()));

    let reason = signals::shutdown_requested().await;
    log::info!("{} received, initiating shutdown.", reason);

    if config.logout_on_exit.unwrap_or(false) {
        auth.logout().await;
    }
    manager.shutdown().await;
    printer.abort();
    status.abort();

    log::info!("Shutdown complete.");
    Ok(())
}

/// Writes every inbound frame to stdout as one JSON line.
async fn print_messages(manager: ConnectionManager) {
    let mut messages = manager.watch_messages();
    while messages.changed().await.is_ok() {
        let line = messages.borrow_and_update().as_ref().map(|m| m.raw().to_string());
        if let Some(line) = line {
            let mut stdout = std::io::stdout().lock();
            if writeln!(stdout, "{}", line).and_then(|_| stdout.flush()).is_err() {
                break;
            }
        }
    }
}

async fn report_status(manager: ConnectionManager) {
    let mut state = manager.watch_state();
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        log::info!(
            "Status: {} (queued: {}, reconnect attempt: {})",
            current,
            manager.queue_size(),
            manager.reconnect_attempt()
        );
    }
}

async fn login_with_google(auth: &AuthState, token: &str) -> Result<bool> {
    match auth.google_login(token).await? {
        GoogleLogin::NewUser => {
            log::warn!("New account: complete the profile form in the app before taking jobs.");
            Ok(false)
        }
        GoogleLogin::Existing { authenticated } => Ok(authenticated),
    }
}

/// Prompts for the emailed code; an `r` line asks the backend to send a new one.
async fn login_with_otp(auth: &AuthState, email: &str) -> Result<bool> {
    let challenge = auth.login(email).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let otp = loop {
        eprint!("Enter the code sent to {} (r to resend): ", email);
        std::io::stderr().flush()?;
        let line = lines.next_line().await?.context("No code entered")?;
        match line.trim() {
            "" => continue,
            "r" | "R" => match auth.resend_otp(&challenge).await {
                Ok(_) => log::info!("OTP has been resent to {}", email),
                Err(e) => log::error!("{}", e),
            },
            code => break code.to_string(),
        }
    };

    let authenticated = auth.verify_otp(&challenge, &otp).await?;
    if authenticated && challenge.is_new_user() {
        log::warn!("New account: complete the profile form in the app before taking jobs.");
    }
    Ok(authenticated)
}
