//! # Session State
//!
//! Everything the manager mutates for one authenticated login, kept in one
//! struct behind one mutex. The driver task performs all state transitions;
//! `ConnectionManager::send` only touches the queue and the live socket.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::transport::{ReadyState, Socket};

/// Observable socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Text shown by a status indicator.
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Connected => "Connected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Error => "Connection error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The single socket instance a session may own.
pub(crate) struct LiveSocket {
    /// Connect attempt that produced this socket; events from other attempts are stale.
    pub(crate) attempt: u64,
    pub(crate) handle: Box<dyn Socket>,
    /// Set once the driver has processed the open event and flushed the queue.
    pub(crate) acknowledged: bool,
}

impl LiveSocket {
    pub(crate) fn new(attempt: u64, handle: Box<dyn Socket>) -> Self {
        Self {
            attempt,
            handle,
            acknowledged: false,
        }
    }

    fn writable(&self) -> bool {
        self.acknowledged && self.handle.ready_state() == ReadyState::Open
    }
}

#[derive(Default)]
pub(crate) struct Session {
    pub(crate) authenticated: bool,
    pub(crate) socket: Option<LiveSocket>,
    pub(crate) reconnect_attempt: u32,
    pub(crate) active_job_id: Option<String>,
    /// Set once the driver has exited; nothing will ever flush the queue again.
    pub(crate) stopped: bool,
    outbound: VecDeque<String>,
}

/// Outcome of draining the outbound queue after an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushReport {
    pub(crate) sent: usize,
    pub(crate) requeued: usize,
}

impl Session {
    pub(crate) fn queue_len(&self) -> usize {
        self.outbound.len()
    }

    /// True while a socket is opening or open.
    pub(crate) fn has_live_socket(&self) -> bool {
        matches!(
            self.socket.as_ref().map(|s| s.handle.ready_state()),
            Some(ReadyState::Connecting) | Some(ReadyState::Open)
        )
    }

    pub(crate) fn socket_absent_or_closed(&self) -> bool {
        match &self.socket {
            None => true,
            Some(s) => s.handle.ready_state() == ReadyState::Closed,
        }
    }

    /// Sends right away when the socket is open, otherwise appends to the queue.
    /// Returns whether the frame went out immediately.
    pub(crate) fn send_or_queue(&mut self, text: String) -> bool {
        if self.stopped {
            log::warn!("Connection manager is shut down; dropping message: {}", text);
            return false;
        }
        if let Some(socket) = self.socket.as_ref().filter(|s| s.writable()) {
            match socket.handle.send(&text) {
                Ok(()) => {
                    log::debug!("Message sent: {}", text);
                    return true;
                }
                Err(e) => {
                    log::error!("Error sending message, queuing it: {}", e);
                }
            }
        } else {
            log::debug!("Message queued (offline): {}", text);
        }
        self.outbound.push_back(text);
        log::debug!("Queue size: {}", self.outbound.len());
        false
    }

    /// Drains a snapshot of the queue through the open socket, in order.
    ///
    /// Frames that fail are appended back, behind anything queued meanwhile.
    pub(crate) fn flush(&mut self) -> FlushReport {
        let snapshot: Vec<String> = self.outbound.drain(..).collect();
        let total = snapshot.len();
        let mut report = FlushReport { sent: 0, requeued: 0 };
        for (idx, text) in snapshot.into_iter().enumerate() {
            let result = match &self.socket {
                Some(socket) => socket.handle.send(&text),
                None => Err(super::error::RealtimeError::NotOpen),
            };
            match result {
                Ok(()) => {
                    report.sent += 1;
                    log::debug!("Sent queued message {}/{}", idx + 1, total);
                }
                Err(e) => {
                    log::error!("Failed to send queued message {}/{}: {}", idx + 1, total, e);
                    self.outbound.push_back(text);
                    report.requeued += 1;
                }
            }
        }
        report
    }

    pub(crate) fn clear_queue(&mut self) -> usize {
        let dropped = self.outbound.len();
        self.outbound.clear();
        dropped
    }
}

/// Locks the session, recovering from a poisoned mutex.
pub(crate) fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}
