//! # parley-store
//!
//! State owned by the synchronization core and the persistence behind the
//! session store.
//!
//! The in-memory structures ([`MessageStore`], [`LastMessageCache`],
//! [`PresenceRoster`]) are plain single-owner values; the client wraps them
//! in the locks it needs. The SQLite [`Database`] only persists the current
//! session so it can be resumed on the next start.

pub mod database;
pub mod last_message;
pub mod messages;
pub mod migrations;
pub mod presence;
pub mod sessions;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use last_message::LastMessageCache;
pub use messages::{IngestOutcome, MessageStore};
pub use presence::PresenceRoster;
pub use sessions::{MemorySessionStore, SqliteSessionStore};
