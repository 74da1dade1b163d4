//! Session context: one authenticated identity, its connection and its core.

use std::sync::Arc;

use tracing::info;

use parley_net::{ConnectionManager, Connector};
use parley_shared::{DirectoryApi, HistoryApi, Identity};

use crate::sync::{CoreSettings, SyncCore};

/// Owns the connection manager and the synchronization core for a logged-in
/// identity. Built in two steps so callers can subscribe to the core before
/// any transport event can reach it.
pub struct SessionContext {
    identity: Identity,
    core: Arc<SyncCore>,
    connections: ConnectionManager,
}

impl SessionContext {
    pub fn new(
        identity: Identity,
        connector: Arc<dyn Connector>,
        history: Arc<dyn HistoryApi>,
        directory: Arc<dyn DirectoryApi>,
        settings: CoreSettings,
    ) -> Self {
        let core = SyncCore::new(identity.clone(), history, directory, settings);
        Self {
            identity,
            core,
            connections: ConnectionManager::new(connector),
        }
    }

    /// Open the push channel with the session token and attach the core.
    pub fn open(&self) {
        let connection = self.connections.connect(&self.identity.token);
        info!(
            user = %self.identity.id,
            conn = connection.id(),
            "Session context opened"
        );
        self.core.attach(connection);
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn core(&self) -> &Arc<SyncCore> {
        &self.core
    }

    /// Tear the core down and close the connection. Idempotent.
    pub fn destroy(&self) {
        self.core.teardown();
        if self.connections.disconnect() {
            info!(user = %self.identity.id, "Session context destroyed");
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.destroy();
    }
}
