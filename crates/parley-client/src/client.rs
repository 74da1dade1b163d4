//! Client facade: authentication and the session lifecycle around the core.

use std::sync::{Arc, Mutex, Weak};

use tracing::{info, warn};

use parley_net::Connector;
use parley_shared::observe::lock;
use parley_shared::{
    AuthApi, DirectoryApi, HistoryApi, Identity, Observers, ParleyError, Session, SessionError,
    SessionStore, Unsubscribe, UserId,
};

use crate::events::CoreEvent;
use crate::session::SessionContext;
use crate::sync::{CoreSettings, SyncCore};

/// External services the client depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthApi>,
    pub history: Arc<dyn HistoryApi>,
    pub directory: Arc<dyn DirectoryApi>,
    pub sessions: Arc<dyn SessionStore>,
    pub connector: Arc<dyn Connector>,
}

pub struct Client {
    me: Weak<Client>,
    services: Collaborators,
    settings: CoreSettings,
    context: Mutex<Option<Arc<SessionContext>>>,
    observers: Observers<CoreEvent>,
}

impl Client {
    pub fn new(services: Collaborators, settings: CoreSettings) -> Arc<Self> {
        Arc::new_cyclic(|me| Client {
            me: me.clone(),
            services,
            settings,
            context: Mutex::new(None),
            observers: Observers::new(),
        })
    }

    /// Create an account. No session is started.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Identity, ParleyError> {
        let identity = self.services.auth.register(name, email, password).await?;
        info!(user = %identity.id, "Registered");
        Ok(identity)
    }

    /// Authenticate, persist the session, open the push channel and load
    /// the peer list.
    pub async fn login(&self, email: &str, password: &str) -> Result<Identity, ParleyError> {
        let identity = self.services.auth.login(email, password).await?;
        info!(user = %identity.id, "Logged in");

        self.services.sessions.save(&Session::new(identity.clone()))?;
        let core = self.establish(identity.clone());
        fatal_on_auth(core.load_peers().await)?;
        Ok(identity)
    }

    /// Re-establish the stored session, if any.
    ///
    /// An unreadable or outdated blob is cleared and treated as absent. The
    /// previously active peer is selected again.
    pub async fn resume(&self) -> Result<Option<Identity>, ParleyError> {
        let session = match self.services.sessions.load() {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(None),
            Err(SessionError::Storage(e)) => return Err(SessionError::Storage(e).into()),
            Err(e) => {
                warn!(error = %e, "Ignoring stored session");
                self.services.sessions.clear()?;
                return Ok(None);
            }
        };

        let identity = session.identity;
        info!(user = %identity.id, "Resuming session");
        let core = self.establish(identity.clone());

        fatal_on_auth(core.load_peers().await)?;
        if let Some(peer) = session.active_peer {
            fatal_on_auth(core.select_peer(peer).await)?;
        }
        Ok(Some(identity))
    }

    /// Tear the session down and forget it.
    pub fn logout(&self) -> Result<(), ParleyError> {
        let was_active = self.end_session();
        self.services.sessions.clear()?;
        if was_active {
            self.observers.notify(&CoreEvent::LoggedOut);
        }
        Ok(())
    }

    fn establish(&self, identity: Identity) -> Arc<SyncCore> {
        self.end_session();

        let context = Arc::new(SessionContext::new(
            identity,
            Arc::clone(&self.services.connector),
            Arc::clone(&self.services.history),
            Arc::clone(&self.services.directory),
            self.settings.clone(),
        ));

        // Closed together with the core on teardown.
        let me = self.me.clone();
        context.core().subscribe(move |event| {
            if let Some(client) = me.upgrade() {
                client.on_core_event(event);
            }
        });

        *lock(&self.context) = Some(Arc::clone(&context));
        context.open();
        Arc::clone(context.core())
    }

    fn end_session(&self) -> bool {
        let previous = lock(&self.context).take();
        match previous {
            Some(context) => {
                context.destroy();
                true
            }
            None => false,
        }
    }

    fn on_core_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::SessionExpired => {
                self.force_logout();
                return;
            }
            CoreEvent::ActivePeerChanged(peer) => self.persist_active_peer(peer.clone()),
            _ => {}
        }
        self.observers.notify(event);
    }

    fn force_logout(&self) {
        if !self.end_session() {
            return;
        }
        warn!("Session expired, logging out");
        if let Err(e) = self.services.sessions.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }
        self.observers.notify(&CoreEvent::SessionExpired);
    }

    fn persist_active_peer(&self, peer: Option<UserId>) {
        let Some(identity) = self.identity() else {
            return;
        };
        let session = Session::new(identity).with_active_peer(peer);
        if let Err(e) = self.services.sessions.save(&session) {
            warn!(error = %e, "Failed to persist active peer");
        }
    }

    pub fn core(&self) -> Option<Arc<SyncCore>> {
        lock(&self.context)
            .as_ref()
            .map(|context| Arc::clone(context.core()))
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.context)
            .as_ref()
            .map(|context| context.identity().clone())
    }

    pub fn is_logged_in(&self) -> bool {
        lock(&self.context).is_some()
    }

    /// Core events of every session, plus `LoggedOut`/`SessionExpired`.
    pub fn subscribe<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }
}

/// Only auth failures abort login and resume; the rest is logged by the core.
fn fatal_on_auth<T>(result: Result<T, ParleyError>) -> Result<(), ParleyError> {
    match result {
        Err(e @ ParleyError::Auth(_)) => Err(e),
        _ => Ok(()),
    }
}
