//! # Connection Manager
//!
//! `ConnectionManager` is a cheap, cloneable handle. Behind it a single driver
//! task owns every timer and processes one event at a time:
//!
//! - commands from the host (auth flips, lifecycle changes, shutdown),
//! - token fetch results,
//! - socket events tagged with the connect attempt that produced them,
//! - the backoff / planned-refresh deadline and the heartbeat interval.
//!
//! Events carrying an attempt id that no longer matches the live socket are
//! dropped, which is what keeps at most one socket alive per session.
//!
//! `send` does not go through the driver: it locks the session, writes to the
//! socket if the open has been processed, and queues otherwise.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use super::config::ManagerConfig;
use super::endpoint::SocketEndpoint;
use super::error::RealtimeError;
use super::lifecycle::AppLifecycle;
use super::messages::{encode_frame, InboundMessage, OutboundMessage};
use super::session::{lock, ConnectionState, LiveSocket, Session};
use super::token::TokenProvider;
use super::transport::{EventSink, SocketEvent, Transport, NORMAL_CLOSURE};

enum Event {
    Authenticated(bool),
    Lifecycle(AppLifecycle),
    TokenFetched {
        attempt: u64,
        result: Result<String, RealtimeError>,
    },
    Socket {
        attempt: u64,
        event: SocketEvent,
    },
    Shutdown,
}

enum Wake {
    Event(Option<Event>),
    Reconnect,
    Refresh,
    Heartbeat,
}

/// Handle to the job notification connection of one user session.
#[derive(Clone)]
pub struct ConnectionManager {
    session: Arc<Mutex<Session>>,
    events: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<ConnectionState>,
    message_rx: watch::Receiver<Option<InboundMessage>>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Starts the driver task. Must be called inside a tokio runtime.
    ///
    /// The manager stays idle until `set_authenticated(true)`. Dropping every
    /// handle tears the session down just like `shutdown`.
    pub fn spawn<P, T>(config: ManagerConfig, tokens: P, transport: T) -> Self
    where
        P: TokenProvider,
        T: Transport,
    {
        let session = Arc::new(Mutex::new(Session::default()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (message_tx, message_rx) = watch::channel(None);

        let driver = Driver {
            config,
            tokens: Arc::new(tokens),
            transport: Arc::new(transport),
            session: Arc::clone(&session),
            events: events_tx.downgrade(),
            state_tx,
            message_tx,
            lifecycle: AppLifecycle::Active,
            attempt_seq: 0,
            connecting: false,
            token_task: None,
            reconnect_at: None,
            refresh_at: None,
            heartbeat: None,
        };
        let handle = tokio::spawn(driver.run(events_rx));

        Self {
            session,
            events: events_tx,
            state_rx,
            message_rx,
            driver: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Feeds the Auth Oracle's verdict. `false` tears the session down.
    pub fn set_authenticated(&self, authenticated: bool) {
        let _ = self.events.send(Event::Authenticated(authenticated));
    }

    /// Feeds an App Lifecycle Source transition.
    pub fn app_state_changed(&self, state: AppLifecycle) {
        let _ = self.events.send(Event::Lifecycle(state));
    }

    /// Sends or queues `message`.
    ///
    /// A string (`&str`, `String`) is taken as an already serialized frame
    /// and goes out verbatim; anything else is serialized to JSON first.
    /// Returns `true` only when the frame was written to an open socket.
    /// A value that cannot be serialized is logged and dropped.
    pub fn send<M: Serialize + ?Sized>(&self, message: &M) -> bool {
        match encode_frame(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                log::error!("Dropping outbound message that failed to serialize: {}", e);
                false
            }
        }
    }

    /// Sends or queues an already serialized frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        lock(&self.session).send_or_queue(text.into())
    }

    /// Job id attached to subsequent heartbeats.
    pub fn set_active_job_id(&self, job_id: Option<String>) {
        log::info!("Active job ID updated: {:?}", job_id);
        lock(&self.session).active_job_id = job_id;
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn last_message(&self) -> Option<InboundMessage> {
        self.message_rx.borrow().clone()
    }

    /// Receiver that is notified on every decoded inbound frame.
    pub fn watch_messages(&self) -> watch::Receiver<Option<InboundMessage>> {
        self.message_rx.clone()
    }

    pub fn queue_size(&self) -> usize {
        lock(&self.session).queue_len()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        lock(&self.session).reconnect_attempt
    }

    /// Forwards the Auth Oracle's current value and every later change.
    ///
    /// The task ends when the oracle goes away or the manager is shut down.
    pub fn follow_auth(&self, mut auth: watch::Receiver<bool>) -> JoinHandle<()> {
        let events = self.events.downgrade();
        tokio::spawn(async move {
            loop {
                let authenticated = *auth.borrow_and_update();
                let delivered = events
                    .upgrade()
                    .map(|tx| tx.send(Event::Authenticated(authenticated)).is_ok())
                    .unwrap_or(false);
                if !delivered || auth.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Forwards App Lifecycle Source transitions until the source closes.
    pub fn follow_lifecycle(&self, mut states: mpsc::UnboundedReceiver<AppLifecycle>) -> JoinHandle<()> {
        let events = self.events.downgrade();
        tokio::spawn(async move {
            while let Some(state) = states.recv().await {
                let delivered = events
                    .upgrade()
                    .map(|tx| tx.send(Event::Lifecycle(state)).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    break;
                }
            }
        })
    }

    /// Tears the session down and waits for the driver to exit.
    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Connection driver ended abnormally: {}", e);
            }
        }
    }
}

struct Driver<P, T> {
    config: ManagerConfig,
    tokens: Arc<P>,
    transport: Arc<T>,
    session: Arc<Mutex<Session>>,
    events: mpsc::WeakUnboundedSender<Event>,
    state_tx: watch::Sender<ConnectionState>,
    message_tx: watch::Sender<Option<InboundMessage>>,
    lifecycle: AppLifecycle,
    /// Id of the most recent connect attempt.
    attempt_seq: u64,
    /// A token fetch for `attempt_seq` is in flight.
    connecting: bool,
    token_task: Option<AbortHandle>,
    /// Pending backoff or planned-refresh reconnect.
    reconnect_at: Option<Instant>,
    refresh_at: Option<Instant>,
    heartbeat: Option<Interval>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<P: TokenProvider, T: Transport> Driver<P, T> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        loop {
            let wake = tokio::select! {
                biased;
                event = events.recv() => Wake::Event(event),
                _ = sleep_until_opt(self.reconnect_at) => Wake::Reconnect,
                _ = sleep_until_opt(self.refresh_at) => Wake::Refresh,
                _ = tick_opt(self.heartbeat.as_mut()) => Wake::Heartbeat,
            };

            match wake {
                Wake::Event(Some(Event::Shutdown)) | Wake::Event(None) => {
                    self.teardown("Provider unmounted");
                    let mut session = lock(&self.session);
                    session.stopped = true;
                    session.clear_queue();
                    break;
                }
                Wake::Event(Some(event)) => self.handle(event),
                Wake::Reconnect => self.on_reconnect_due(),
                Wake::Refresh => self.on_refresh_due(),
                Wake::Heartbeat => self.on_heartbeat(),
            }
        }
        log::debug!("Connection driver stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Authenticated(true) => {
                let newly = !std::mem::replace(&mut lock(&self.session).authenticated, true);
                if newly {
                    log::info!("Session authenticated");
                }
                self.connect();
            }
            Event::Authenticated(false) => self.teardown("User logged out"),
            Event::Lifecycle(next) => self.on_lifecycle(next),
            Event::TokenFetched { attempt, result } => self.on_token(attempt, result),
            Event::Socket { attempt, event } => self.on_socket_event(attempt, event),
            Event::Shutdown => {}
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::debug!("Connection state {:?} -> {:?}", *current, next);
            *current = next;
            true
        });
    }

    fn connect(&mut self) {
        {
            let session = lock(&self.session);
            if !session.authenticated {
                log::debug!("Not authenticated. Skipping connection.");
                return;
            }
            if self.connecting || session.has_live_socket() {
                log::debug!("Already connected or connecting.");
                return;
            }
            log::info!(
                "Starting connection (attempt {})",
                session.reconnect_attempt + 1
            );
        }

        self.attempt_seq += 1;
        self.connecting = true;
        self.set_state(ConnectionState::Connecting);

        let attempt = self.attempt_seq;
        let fetch = self.tokens.fetch_token();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = fetch.await;
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Event::TokenFetched { attempt, result });
            }
        });
        self.token_task = Some(task.abort_handle());
    }

    fn on_token(&mut self, attempt: u64, result: Result<String, RealtimeError>) {
        if !self.connecting || attempt != self.attempt_seq {
            log::debug!("Ignoring token for superseded attempt {}", attempt);
            return;
        }
        self.connecting = false;
        self.token_task = None;

        let endpoint = result.and_then(|token| {
            SocketEndpoint::derive(
                &self.config.api_base_url,
                &self.config.notification_path,
                &token,
            )
        });
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::error!("Connection setup failed: {}", e);
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect();
                return;
            }
        };

        log::info!(
            "Connecting to {}://{}{}",
            endpoint.url.scheme(),
            endpoint.url.host_str().unwrap_or_default(),
            endpoint.url.path()
        );
        let socket = self.transport.open(&endpoint, self.socket_sink(attempt));

        let mut session = lock(&self.session);
        if let Some(previous) = session.socket.take() {
            previous.handle.close(NORMAL_CLOSURE, "Superseded");
        }
        session.socket = Some(LiveSocket::new(attempt, socket));
    }

    fn socket_sink(&self, attempt: u64) -> EventSink {
        let events = self.events.clone();
        EventSink::new(move |event| {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Event::Socket { attempt, event });
            }
        })
    }

    fn on_socket_event(&mut self, attempt: u64, event: SocketEvent) {
        let current = lock(&self.session)
            .socket
            .as_ref()
            .map(|s| s.attempt == attempt)
            .unwrap_or(false);
        if !current {
            log::trace!("Ignoring {:?} from released socket {}", event, attempt);
            return;
        }

        match event {
            SocketEvent::Open => self.on_open(),
            SocketEvent::Message(text) => self.on_message(&text),
            SocketEvent::Close { code, reason } => self.on_close(code, &reason),
            SocketEvent::Error(message) => self.on_error(&message),
        }
    }

    fn on_open(&mut self) {
        log::info!("Connection successful");

        self.reconnect_at = None;
        let period = self.config.heartbeat_interval;
        // A zero period disables the heartbeat (interval_at rejects it).
        self.heartbeat = (!period.is_zero()).then(|| {
            let mut heartbeat = time::interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat
        });
        self.refresh_at = Some(Instant::now() + self.config.refresh_interval);

        // Held across the state change so no send() can overtake the backlog.
        let mut session = lock(&self.session);
        self.set_state(ConnectionState::Connected);
        session.reconnect_attempt = 0;
        if let Some(socket) = session.socket.as_mut() {
            socket.acknowledged = true;
        }
        if session.queue_len() > 0 {
            log::info!("Flushing {} queued messages...", session.queue_len());
            let report = session.flush();
            if report.requeued > 0 {
                log::warn!("{} queued messages could not be sent and were re-queued", report.requeued);
            }
        }
    }

    fn on_message(&mut self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(message) => {
                log::info!(
                    "Message received: type={} request_id={:?} job_id={:?}",
                    message.type_name().unwrap_or("?"),
                    message.request_id(),
                    message.job_id()
                );
                self.message_tx.send_replace(Some(message));
            }
            Err(e) => log::warn!("Received non-JSON message ({}): {}", e, text),
        }
    }

    fn on_close(&mut self, code: Option<u16>, reason: &str) {
        log::warn!("Disconnected. Code: {:?}, Reason: {}", code, reason);
        lock(&self.session).socket = None;
        self.stop_socket_timers();
        self.set_state(ConnectionState::Disconnected);

        if code != Some(NORMAL_CLOSURE) {
            self.schedule_reconnect();
        }
    }

    fn on_error(&mut self, message: &str) {
        log::error!("An error occurred: {}", message);
        if let Some(socket) = lock(&self.session).socket.take() {
            socket.handle.close(NORMAL_CLOSURE, "Transport error");
        }
        self.stop_socket_timers();
        self.set_state(ConnectionState::Error);
        self.schedule_reconnect();
    }

    fn stop_socket_timers(&mut self) {
        self.heartbeat = None;
        self.refresh_at = None;
    }

    /// Arms the backoff timer unless one is already pending.
    fn schedule_reconnect(&mut self) {
        let mut session = lock(&self.session);
        if !session.authenticated {
            return;
        }
        if self.reconnect_at.is_some() {
            log::debug!("Reconnect already pending");
            return;
        }
        let delay = self.config.backoff_delay(session.reconnect_attempt);
        session.reconnect_attempt = session.reconnect_attempt.saturating_add(1);
        log::info!(
            "Scheduling reconnect attempt {} in {}ms...",
            session.reconnect_attempt,
            delay.as_millis()
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        self.connect();
    }

    fn on_refresh_due(&mut self) {
        self.refresh_at = None;
        log::info!("Auto-reconnecting to refresh session...");

        if let Some(socket) = lock(&self.session).socket.take() {
            socket.handle.close(NORMAL_CLOSURE, "refresh");
        }
        self.heartbeat = None;
        lock(&self.session).reconnect_attempt = 0;
        self.set_state(ConnectionState::Disconnected);
        self.reconnect_at = Some(Instant::now() + self.config.refresh_delay);
    }

    fn on_heartbeat(&mut self) {
        let session = lock(&self.session);
        let Some(socket) = session.socket.as_ref().filter(|s| s.acknowledged) else {
            return;
        };
        let frame = OutboundMessage::heartbeat(session.active_job_id.clone());
        match serde_json::to_string(&frame) {
            Ok(text) => match socket.handle.send(&text) {
                Ok(()) => log::debug!("Heartbeat sent (job_id: {:?})", session.active_job_id),
                Err(e) => log::error!("Failed to send heartbeat: {}", e),
            },
            Err(e) => log::error!("Failed to encode heartbeat: {}", e),
        }
    }

    fn on_lifecycle(&mut self, next: AppLifecycle) {
        let previous = std::mem::replace(&mut self.lifecycle, next);
        if !AppLifecycle::is_foregrounding(previous, next) {
            return;
        }
        log::info!("App came to foreground. Reconnecting if needed...");

        {
            let mut session = lock(&self.session);
            if !session.authenticated || self.connecting || !session.socket_absent_or_closed() {
                return;
            }
            session.reconnect_attempt = 0;
            session.socket = None;
        }
        self.reconnect_at = None;
        self.stop_socket_timers();
        self.connect();
    }

    /// Cancels every timer and in-flight attempt, closes the socket and
    /// forgets the session's queue and counters.
    fn teardown(&mut self, reason: &str) {
        if let Some(task) = self.token_task.take() {
            task.abort();
        }
        self.connecting = false;
        self.attempt_seq += 1;
        self.reconnect_at = None;
        self.stop_socket_timers();

        let mut session = lock(&self.session);
        session.authenticated = false;
        if let Some(socket) = session.socket.take() {
            log::info!("Closing WebSocket: {}", reason);
            socket.handle.close(NORMAL_CLOSURE, reason);
        }
        let dropped = session.clear_queue();
        if dropped > 0 {
            log::info!("Clearing {} queued messages ({}).", dropped, reason);
        }
        session.reconnect_attempt = 0;
        session.active_job_id = None;
        drop(session);

        self.set_state(ConnectionState::Disconnected);
    }
}
