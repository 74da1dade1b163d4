//! How a [`Connection`](crate::Connection) reaches its push channel.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;

use parley_shared::constants::CHANNEL_CAPACITY;
use parley_shared::observe::lock;

use crate::socket::{spawn_socket, ChannelPair, SocketCommand, SocketConfig, SocketNotification};

/// Opens the channel pair behind a connection.
///
/// Implementations must not block: the production connector spawns the
/// socket task and returns immediately.
pub trait Connector: Send + Sync {
    fn open(&self, token: &str) -> ChannelPair;
}

/// Connector backed by the WebSocket task.
pub struct WebSocketConnector {
    config: SocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, token: &str) -> ChannelPair {
        spawn_socket(self.config.clone(), token.to_string())
    }
}

/// The far end of a channel pair opened by a [`LoopbackConnector`].
pub struct RemoteEnd {
    pub token: String,
    pub commands: mpsc::Receiver<SocketCommand>,
    pub notifications: mpsc::Sender<SocketNotification>,
}

impl RemoteEnd {
    /// Push a notification as if it came from the socket task.
    pub async fn push(&self, notification: SocketNotification) -> bool {
        self.notifications.send(notification).await.is_ok()
    }
}

/// In-process connector: every `open` queues its far end so the caller can
/// play the server.
#[derive(Default)]
pub struct LoopbackConnector {
    remotes: Mutex<VecDeque<RemoteEnd>>,
    opened: Mutex<usize>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest far end not yet taken.
    pub fn take_remote(&self) -> Option<RemoteEnd> {
        lock(&self.remotes).pop_front()
    }

    /// Number of channel pairs opened so far.
    pub fn opened(&self) -> usize {
        *lock(&self.opened)
    }
}

impl Connector for LoopbackConnector {
    fn open(&self, token: &str) -> ChannelPair {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (notif_tx, notif_rx) = mpsc::channel(CHANNEL_CAPACITY);

        lock(&self.remotes).push_back(RemoteEnd {
            token: token.to_string(),
            commands: cmd_rx,
            notifications: notif_tx,
        });
        *lock(&self.opened) += 1;

        (cmd_tx, notif_rx)
    }
}
