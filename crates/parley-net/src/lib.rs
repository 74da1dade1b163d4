//! # parley-net
//!
//! Network collaborators of the Parley client: the WebSocket push channel,
//! the [`Connection`] wrapper that dispatches its events to handlers, the
//! [`ConnectionManager`] enforcing one live connection per session, and the
//! REST client used for auth, directory and history calls.

pub mod connection;
pub mod connector;
pub mod http;
pub mod socket;

pub use connection::{Connection, ConnectionManager, EventKind, TransportEvent};
pub use connector::{Connector, LoopbackConnector, RemoteEnd, WebSocketConnector};
pub use http::{HttpApi, HttpSetupError};
pub use socket::{spawn_socket, ChannelPair, SocketCommand, SocketConfig, SocketNotification};
