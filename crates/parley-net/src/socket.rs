//! Push channel task with tokio mpsc command/notification channels.
//!
//! The WebSocket lives in a dedicated tokio task. The rest of the client
//! talks to it through a typed command sender and notification receiver,
//! so the connection layer never touches the socket directly and
//! reconnection stays invisible to it apart from state notifications.

use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message as Frame};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use parley_shared::constants::{
    CHANNEL_CAPACITY, RECONNECT_BACKOFF_INITIAL_MS, RECONNECT_BACKOFF_MAX_MS,
};
use parley_shared::{ClientEvent, ServerEvent, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the socket task.
#[derive(Debug)]
pub enum SocketCommand {
    /// Write an event to the socket. Dropped if currently disconnected.
    Emit(ClientEvent),
    /// Close the socket and end the task.
    Shutdown,
}

/// Notifications sent *from* the socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketNotification {
    /// The handshake succeeded (first connect or reconnect).
    Connected,
    /// The socket dropped or a connect attempt failed; a retry is scheduled.
    Disconnected { reason: String },
    /// The handshake was refused. The task has stopped.
    Rejected(TransportError),
    /// A decoded server event.
    Event(ServerEvent),
}

/// Command sender and notification receiver of one socket task.
pub type ChannelPair = (
    mpsc::Sender<SocketCommand>,
    mpsc::Receiver<SocketNotification>,
);

/// Configuration for spawning the socket task.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// `ws://` or `wss://` endpoint of the push channel.
    pub url: String,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Capacity of both channels.
    pub capacity: usize,
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff_initial: Duration::from_millis(RECONNECT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(RECONNECT_BACKOFF_MAX_MS),
            capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Exponential reconnect delay: `initial`, doubling, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Spawn the push channel in a background tokio task.
///
/// Returns `(command_tx, notification_rx)`. The task ends on
/// [`SocketCommand::Shutdown`], when every command sender is dropped, when
/// the notification receiver is dropped, or after a rejected handshake.
pub fn spawn_socket(config: SocketConfig, token: String) -> ChannelPair {
    let (cmd_tx, cmd_rx) = mpsc::channel::<SocketCommand>(config.capacity);
    let (notif_tx, notif_rx) = mpsc::channel::<SocketNotification>(config.capacity);

    tokio::spawn(run_socket(config, token, cmd_rx, notif_tx));

    (cmd_tx, notif_rx)
}

enum ConnectFailure {
    /// Not worth retrying with the same token.
    Fatal(TransportError),
    Retry(String),
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

async fn run_socket(
    config: SocketConfig,
    token: String,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
    notif_tx: mpsc::Sender<SocketNotification>,
) {
    let mut backoff = Backoff::new(config.backoff_initial, config.backoff_max);

    loop {
        let attempt = tokio::select! {
            result = connect(&config.url, &token) => result,
            _ = wait_for_shutdown(&mut cmd_rx) => break,
        };

        let reason = match attempt {
            Ok(stream) => {
                backoff.reset();
                info!(url = %config.url, "Push channel connected");
                if notif_tx.send(SocketNotification::Connected).await.is_err() {
                    break;
                }
                match pump(stream, &mut cmd_rx, &notif_tx).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(ConnectFailure::Fatal(err)) => {
                warn!(url = %config.url, error = %err, "Push channel handshake rejected");
                let _ = notif_tx.send(SocketNotification::Rejected(err)).await;
                break;
            }
            Err(ConnectFailure::Retry(reason)) => reason,
        };

        let delay = backoff.next_delay();
        warn!(reason = %reason, retry_in_ms = delay.as_millis() as u64, "Push channel down");
        if notif_tx
            .send(SocketNotification::Disconnected { reason })
            .await
            .is_err()
        {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(&mut cmd_rx) => break,
        }
    }

    info!(url = %config.url, "Push channel task terminated");
}

async fn connect(url: &str, token: &str) -> Result<WsStream, ConnectFailure> {
    let request = build_request(url, token)
        .map_err(|e| ConnectFailure::Fatal(TransportError::Handshake(format!("{e:#}"))))?;

    match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => Ok(stream),
        Err(tungstenite::Error::Http(response)) if is_auth_status(response.status()) => {
            Err(ConnectFailure::Fatal(TransportError::Unauthorized))
        }
        Err(e) => Err(ConnectFailure::Retry(e.to_string())),
    }
}

/// Handshake request carrying the bearer token.
pub(crate) fn build_request(url: &str, token: &str) -> anyhow::Result<Request> {
    let mut request = url
        .into_client_request()
        .context("invalid push channel url")?;
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .context("token is not a valid header value")?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Drain commands until a shutdown is requested. Emits issued while no
/// socket is open are dropped.
async fn wait_for_shutdown(cmd_rx: &mut mpsc::Receiver<SocketCommand>) {
    loop {
        match cmd_rx.recv().await {
            Some(SocketCommand::Emit(event)) => {
                debug!(receiver = %event.receiver(), "Dropping emit while disconnected");
            }
            Some(SocketCommand::Shutdown) | None => return,
        }
    }
}

async fn pump(
    stream: WsStream,
    cmd_rx: &mut mpsc::Receiver<SocketCommand>,
    notif_tx: &mpsc::Sender<SocketNotification>,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            // --- Outgoing commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SocketCommand::Emit(event)) => match event.to_json() {
                        Ok(json) => {
                            if let Err(e) = write.send(Frame::Text(json.into())).await {
                                return SessionEnd::Lost(e.to_string());
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode client event"),
                    },
                    Some(SocketCommand::Shutdown) | None => {
                        let _ = write.send(Frame::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                }
            }

            // --- Incoming frames ---
            frame = read.next() => {
                match frame {
                    Some(Ok(Frame::Text(text))) => match ServerEvent::from_json(text.as_str()) {
                        Ok(event) => {
                            if notif_tx.send(SocketNotification::Event(event)).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(e) => debug!(error = %e, "Skipping unrecognised frame"),
                    },
                    Some(Ok(Frame::Close(close))) => {
                        return SessionEnd::Lost(format!("closed by server: {close:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".into()),
                }
            }
        }
    }
}
