//! Process signals mapped onto shutdown and app lifecycle transitions.
//!
//! On unix, `SIGUSR1` plays "app went to background" and `SIGUSR2` "app came
//! back to foreground", which is handy for exercising reattachment by hand.

use lib_setu::AppLifecycle;
use tokio::signal;
use tokio::sync::mpsc;

/// Resolves with the name of the first shutdown signal received.
pub async fn shutdown_requested() -> &'static str {
    tokio::select! {
        _ = signal::ctrl_c() => "Ctrl-C",
        _ = terminate() => "SIGTERM",
    }
}

#[cfg(unix)]
async fn terminate() {
    use signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Could not install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Stream of lifecycle transitions driven by user signals.
#[cfg(unix)]
pub fn lifecycle_signals() -> mpsc::UnboundedReceiver<AppLifecycle> {
    use signal::unix::{signal, SignalKind};

    let (tx, rx) = mpsc::unbounded_channel();
    let (usr1, usr2) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(usr1), Ok(usr2)) => (usr1, usr2),
        (Err(e), _) | (_, Err(e)) => {
            log::warn!("Lifecycle signals unavailable: {}", e);
            return rx;
        }
    };

    tokio::spawn(async move {
        let (mut usr1, mut usr2) = (usr1, usr2);
        loop {
            let next = tokio::select! {
                Some(()) = usr1.recv() => AppLifecycle::Background,
                Some(()) = usr2.recv() => AppLifecycle::Active,
                else => break,
            };
            log::info!("Lifecycle signal: {:?}", next);
            if tx.send(next).is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(not(unix))]
pub fn lifecycle_signals() -> mpsc::UnboundedReceiver<AppLifecycle> {
    let (_tx, rx) = mpsc::unbounded_channel();
    rx
}
