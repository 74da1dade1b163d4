use parley_shared::{ConnectionState, Message, UserId};

/// Derived-state changes published by the synchronization core and the
/// client facade. Payloads are small; observers read the current state back
/// through the core's accessors.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// The materialized conversation with `peer` changed.
    MessagesChanged { peer: UserId },
    /// A stream message arrived, whichever conversation it belongs to.
    MessageReceived(Message),
    /// The sorted peer list was recomputed.
    PeersReordered,
    PresenceChanged(Vec<UserId>),
    TypingChanged { peer: UserId, typing: bool },
    ConnectionChanged(ConnectionState),
    ActivePeerChanged(Option<UserId>),
    /// The token was rejected; the session has been torn down.
    SessionExpired,
    LoggedOut,
}
