//! # WebSocket Transport
//!
//! `tokio-tungstenite` implementation of the transport seam. Each socket runs
//! in its own task; the handle talks to it over an unbounded channel so that
//! `send` never blocks the caller.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, ORIGIN};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use super::endpoint::SocketEndpoint;
use super::error::RealtimeError;
use super::transport::{EventSink, ReadyState, Socket, SocketEvent, Transport};

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

fn decode_state(raw: u8) -> ReadyState {
    match raw {
        CONNECTING => ReadyState::Connecting,
        OPEN => ReadyState::Open,
        CLOSING => ReadyState::Closing,
        _ => ReadyState::Closed,
    }
}

enum WriterCommand {
    Text(String),
    Close(u16, String),
}

/// Opens real websocket connections. Requires a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn open(&self, endpoint: &SocketEndpoint, events: EventSink) -> Box<dyn Socket> {
        let state = Arc::new(AtomicU8::new(CONNECTING));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(endpoint.clone(), events, Arc::clone(&state), rx));
        Box::new(WsSocket {
            state,
            tx,
            task: task.abort_handle(),
        })
    }
}

struct WsSocket {
    state: Arc<AtomicU8>,
    tx: mpsc::UnboundedSender<WriterCommand>,
    task: AbortHandle,
}

impl Socket for WsSocket {
    fn ready_state(&self) -> ReadyState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    fn send(&self, text: &str) -> Result<(), RealtimeError> {
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err(RealtimeError::NotOpen);
        }
        self.tx
            .send(WriterCommand::Text(text.to_string()))
            .map_err(|_| RealtimeError::Transport("socket writer has stopped".to_string()))
    }

    fn close(&self, code: u16, reason: &str) {
        match self.state.load(Ordering::Acquire) {
            CONNECTING => {
                self.state.store(CLOSED, Ordering::Release);
                self.task.abort();
            }
            OPEN => {
                self.state.store(CLOSING, Ordering::Release);
                let _ = self.tx.send(WriterCommand::Close(code, reason.to_string()));
            }
            _ => {}
        }
    }
}

impl Drop for WsSocket {
    fn drop(&mut self) {
        // An open socket shuts down on its own once the command channel closes.
        if self.state.load(Ordering::Acquire) == CONNECTING {
            self.task.abort();
        }
    }
}

fn build_request(endpoint: &SocketEndpoint) -> Result<Request, RealtimeError> {
    let mut request = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| RealtimeError::Transport(e.to_string()))?;
    let origin = HeaderValue::from_str(&endpoint.origin)
        .map_err(|e| RealtimeError::Transport(format!("bad Origin header: {}", e)))?;
    request.headers_mut().insert(ORIGIN, origin);
    Ok(request)
}

async fn run_socket(
    endpoint: SocketEndpoint,
    events: EventSink,
    state: Arc<AtomicU8>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let fail = |state: &AtomicU8, message: String| {
        state.store(CLOSED, Ordering::Release);
        events.emit(SocketEvent::Error(message));
    };

    let request = match build_request(&endpoint) {
        Ok(r) => r,
        Err(e) => return fail(&state, e.to_string()),
    };

    let ws_stream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            log::warn!("WebSocket handshake with {} failed: {}", endpoint.url.host_str().unwrap_or("?"), e);
            return fail(&state, e.to_string());
        }
    };

    // close() may have won the race against the handshake.
    if state
        .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    events.emit(SocketEvent::Open);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(WriterCommand::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            return fail(&state, e.to_string());
                        }
                    }
                    Some(WriterCommand::Close(code, reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        state.store(CLOSED, Ordering::Release);
                        events.emit(SocketEvent::Close { code: Some(code), reason });
                        return;
                    }
                    None => {
                        // Handle dropped by its owner: leave quietly.
                        let _ = write.close().await;
                        state.store(CLOSED, Ordering::Release);
                        return;
                    }
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        events.emit(SocketEvent::Message(text.as_str().to_string()));
                    }
                    Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin.to_vec()) {
                        Ok(text) => events.emit(SocketEvent::Message(text)),
                        Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", bin.len()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_string()),
                            None => (None, String::new()),
                        };
                        state.store(CLOSED, Ordering::Release);
                        events.emit(SocketEvent::Close { code, reason });
                        return;
                    }
                    // Ping/pong are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return fail(&state, e.to_string()),
                    None => {
                        state.store(CLOSED, Ordering::Release);
                        events.emit(SocketEvent::Close { code: None, reason: String::new() });
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_origin_header() {
        let ep = SocketEndpoint::derive("http://127.0.0.1:9/api", "/ws/job_notifications/", "tok")
            .unwrap();
        let req = build_request(&ep).unwrap();
        assert_eq!(req.headers()[ORIGIN], "http://127.0.0.1:9");
        assert_eq!(req.uri().path(), "/ws/job_notifications/");
        assert_eq!(req.uri().query(), Some("token=tok"));
    }

    #[tokio::test]
    async fn unreachable_host_reports_error_and_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(move |ev| {
            let _ = tx.send(ev);
        });
        // Port 9 (discard) is closed on CI hosts.
        let ep = SocketEndpoint::derive("http://127.0.0.1:9/api", "/ws/job_notifications/", "tok")
            .unwrap();
        let socket = WsTransport.open(&ep, sink);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SocketEvent::Error(_)));
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert_eq!(socket.send("x"), Err(RealtimeError::NotOpen));
    }
}
