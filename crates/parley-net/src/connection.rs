//! A push channel connection and the manager that keeps at most one alive.
//!
//! A [`Connection`] is created inactive. Handlers are registered with
//! [`Connection::subscribe`] and [`Connection::activate`] then starts the
//! dispatcher task, so no notification can be delivered before its handlers
//! exist. [`Connection::close`] detaches every handler, stops the dispatcher
//! and shuts the socket task down; nothing fires afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::observe::lock;
use parley_shared::{
    ClientEvent, ConnectionState, Message, Observers, ServerEvent, TransportError, Unsubscribe,
    UserId,
};

use crate::connector::Connector;
use crate::socket::{ChannelPair, SocketCommand, SocketNotification};

/// Names under which handlers can be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    ConnectError,
    ReceiveMessage,
    Typing,
    StopTyping,
    OnlineUsers,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::ConnectError,
        EventKind::ReceiveMessage,
        EventKind::Typing,
        EventKind::StopTyping,
        EventKind::OnlineUsers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::ConnectError => "connect_error",
            EventKind::ReceiveMessage => "receiveMessage",
            EventKind::Typing => "typing",
            EventKind::StopTyping => "stopTyping",
            EventKind::OnlineUsers => "onlineUsers",
        }
    }

    /// Parse a wire event name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler receives.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError(TransportError),
    ReceiveMessage(Message),
    Typing(UserId),
    StopTyping(UserId),
    OnlineUsers(Vec<UserId>),
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Connected => EventKind::Connect,
            TransportEvent::Disconnected { .. } => EventKind::Disconnect,
            TransportEvent::ConnectError(_) => EventKind::ConnectError,
            TransportEvent::ReceiveMessage(_) => EventKind::ReceiveMessage,
            TransportEvent::Typing(_) => EventKind::Typing,
            TransportEvent::StopTyping(_) => EventKind::StopTyping,
            TransportEvent::OnlineUsers(_) => EventKind::OnlineUsers,
        }
    }
}

impl From<SocketNotification> for TransportEvent {
    fn from(notification: SocketNotification) -> Self {
        match notification {
            SocketNotification::Connected => TransportEvent::Connected,
            SocketNotification::Disconnected { reason } => TransportEvent::Disconnected { reason },
            SocketNotification::Rejected(err) => TransportEvent::ConnectError(err),
            SocketNotification::Event(event) => match event {
                ServerEvent::ReceiveMessage(wire) => TransportEvent::ReceiveMessage(wire.into()),
                ServerEvent::Typing { sender_id } => TransportEvent::Typing(sender_id),
                ServerEvent::StopTyping { sender_id } => TransportEvent::StopTyping(sender_id),
                ServerEvent::OnlineUsers(ids) => TransportEvent::OnlineUsers(ids),
            },
        }
    }
}

pub struct Connection {
    id: u64,
    commands: mpsc::Sender<SocketCommand>,
    inbox: Mutex<Option<mpsc::Receiver<SocketNotification>>>,
    handlers: HashMap<EventKind, Observers<TransportEvent>>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(id: u64, (commands, notifications): ChannelPair) -> Arc<Self> {
        Arc::new(Self {
            id,
            commands,
            inbox: Mutex::new(Some(notifications)),
            handlers: EventKind::ALL
                .into_iter()
                .map(|kind| (kind, Observers::new()))
                .collect(),
            state: Mutex::new(ConnectionState::Disconnected),
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Register `handler` for `kind`. A no-op on a closed connection.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Unsubscribe
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        match self.handlers.get(&kind) {
            Some(observers) => observers.subscribe(handler),
            None => Unsubscribe::noop(),
        }
    }

    /// Start delivering notifications to handlers. Later calls are no-ops.
    pub fn activate(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let Some(mut inbox) = lock(&self.inbox).take() else {
            return;
        };

        self.set_state(ConnectionState::Connecting);

        // The task only holds a weak handle so dropping the last strong
        // reference tears the connection down.
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(notification) = inbox.recv().await {
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                if conn.is_closed() {
                    break;
                }
                conn.dispatch(notification);
            }
            debug!("Connection dispatcher stopped");
        });

        *lock(&self.dispatcher) = Some(handle);

        // close() may have run between the check above and storing the handle.
        if self.is_closed() {
            if let Some(handle) = lock(&self.dispatcher).take() {
                handle.abort();
            }
        }
    }

    fn dispatch(&self, notification: SocketNotification) {
        let event = TransportEvent::from(notification);

        match &event {
            TransportEvent::Connected => self.set_state(ConnectionState::Connected),
            TransportEvent::Disconnected { reason } => {
                debug!(conn = self.id, reason = %reason, "Connection lost");
                let mut state = lock(&self.state);
                if *state != ConnectionState::Unavailable {
                    *state = ConnectionState::Disconnected;
                }
            }
            TransportEvent::ConnectError(err) => {
                warn!(conn = self.id, error = %err, "Connection unavailable");
                self.set_state(ConnectionState::Unavailable);
            }
            _ => {}
        }

        if let Some(observers) = self.handlers.get(&event.kind()) {
            observers.notify(&event);
        }
    }

    /// Hand `event` to the socket task without waiting.
    pub fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.state().can_send() {
            return Err(TransportError::Unavailable);
        }

        match self.commands.try_send(SocketCommand::Emit(event)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ConnectionState) {
        *lock(&self.state) = next;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Detach every handler, stop dispatching and shut the socket down.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for observers in self.handlers.values() {
            observers.close();
        }
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        lock(&self.inbox).take();
        let _ = self.commands.try_send(SocketCommand::Shutdown);
        self.set_state(ConnectionState::Disconnected);

        info!(conn = self.id, "Connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the single live connection of a session.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    current: Mutex<Option<Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a new inactive connection, closing the previous one first.
    pub fn connect(&self, token: &str) -> Arc<Connection> {
        let mut current = lock(&self.current);
        if let Some(previous) = current.take() {
            info!(conn = previous.id(), "Replacing live connection");
            previous.close();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(id, self.connector.open(token));
        *current = Some(Arc::clone(&conn));
        debug!(conn = id, "Connection opened");
        conn
    }

    /// Close the live connection. Returns whether there was one.
    pub fn disconnect(&self) -> bool {
        match lock(&self.current).take() {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<Arc<Connection>> {
        lock(&self.current).clone()
    }
}
