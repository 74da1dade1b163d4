//! # parley-client
//!
//! Client-side synchronization core for Parley: keeps a local view of
//! conversations, presence and typing consistent with the backend's REST
//! history and its push channel.
//!
//! The entry point is [`Client`], which owns at most one [`SessionContext`]
//! at a time. Each context holds the connection manager and a [`SyncCore`].

pub mod client;
pub mod config;
pub mod events;
pub mod presence;
pub mod session;
pub mod sync;
pub mod typing;

use tracing_subscriber::{fmt, EnvFilter};

pub use client::{Client, Collaborators};
pub use config::ClientConfig;
pub use events::CoreEvent;
pub use presence::PresenceTracker;
pub use session::SessionContext;
pub use sync::{CoreSettings, SyncCore};
pub use typing::{TypingChange, TypingCoordinator};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parley=info,parley_client=debug,parley_net=debug,parley_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
