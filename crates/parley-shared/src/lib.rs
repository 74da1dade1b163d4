//! Types shared by every Parley crate: identifiers, the wire protocol,
//! the error taxonomy, collaborator traits and the observer registry.

pub mod api;
pub mod constants;
pub mod error;
pub mod observe;
pub mod protocol;
pub mod session;
pub mod types;

pub use api::{AuthApi, DirectoryApi, HistoryApi, SessionStore};
pub use error::{ApiError, AuthError, NetworkError, ParleyError, SessionError, TransportError};
pub use observe::{Observers, Unsubscribe};
pub use protocol::{ClientEvent, OutgoingMessage, ServerEvent, WireMessage};
pub use session::Session;
pub use types::{ConnectionState, Identity, Message, MessageId, Peer, UserId};
