//! The synchronization core.
//!
//! Owns the message store, the last-message cache and the sorted peer list
//! for one session, and fans push channel events out to them, to the
//! presence tracker and to the typing coordinator. All mutable state sits
//! behind one `std::sync::Mutex` that is never held across an `.await` or
//! while observers run.
//!
//! History fetches race with peer switches: every switch bumps a view epoch,
//! and a fetch only applies if the epoch is unchanged when it resolves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_net::{Connection, EventKind, TransportEvent};
use parley_shared::constants::{
    HISTORY_FANOUT, RECONCILE_WINDOW_SECS, STOP_TYPING_DELAY_MS,
};
use parley_shared::observe::lock;
use parley_shared::{
    ApiError, ClientEvent, ConnectionState, DirectoryApi, HistoryApi, Identity, Message,
    Observers, OutgoingMessage, ParleyError, Peer, TransportError, Unsubscribe, UserId,
};
use parley_store::{IngestOutcome, LastMessageCache, MessageStore};

use crate::config::ClientConfig;
use crate::events::CoreEvent;
use crate::presence::PresenceTracker;
use crate::typing::{Outbox, TypingCoordinator};

/// Tunables of the core.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub typing_delay: Duration,
    pub remote_typing_expiry: Option<Duration>,
    pub reconcile_window: Duration,
    pub history_fanout: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            typing_delay: Duration::from_millis(STOP_TYPING_DELAY_MS),
            remote_typing_expiry: None,
            reconcile_window: Duration::from_secs(RECONCILE_WINDOW_SECS as u64),
            history_fanout: HISTORY_FANOUT,
        }
    }
}

impl From<&ClientConfig> for CoreSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            typing_delay: config.typing_delay,
            remote_typing_expiry: config.remote_typing_expiry,
            reconcile_window: config.reconcile_window,
            history_fanout: config.history_fanout,
        }
    }
}

struct CoreState {
    store: MessageStore,
    last: LastMessageCache,
    peers: Vec<Peer>,
    sorted: Vec<Peer>,
    view_epoch: u64,
    connection: ConnectionState,
    ever_connected: bool,
}

impl CoreState {
    fn resort(&mut self) {
        self.sorted = self.last.sorted_peers(&self.peers);
    }

    fn clear(&mut self) {
        self.view_epoch += 1;
        self.store.clear();
        self.last.clear();
        self.peers.clear();
        self.sorted.clear();
        self.connection = ConnectionState::Disconnected;
    }
}

pub struct SyncCore {
    identity: Identity,
    history: Arc<dyn HistoryApi>,
    directory: Arc<dyn DirectoryApi>,
    settings: CoreSettings,
    state: Mutex<CoreState>,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    observers: Observers<CoreEvent>,
    connection: Mutex<Option<Arc<Connection>>>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
    torn_down: AtomicBool,
    expired: AtomicBool,
}

impl SyncCore {
    pub fn new(
        identity: Identity,
        history: Arc<dyn HistoryApi>,
        directory: Arc<dyn DirectoryApi>,
        settings: CoreSettings,
    ) -> Arc<Self> {
        let window = chrono::Duration::from_std(settings.reconcile_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(RECONCILE_WINDOW_SECS));
        let store = MessageStore::new(identity.id.clone()).with_reconcile_window(window);

        Arc::new_cyclic(|weak: &Weak<SyncCore>| {
            let core = weak.clone();
            let outbox: Outbox = Arc::new(move |event| {
                if let Some(core) = core.upgrade() {
                    core.emit_signal(event);
                }
            });

            let observers: Observers<CoreEvent> = Observers::new();

            // Both stay attached until their owner shuts down.
            let presence = PresenceTracker::new();
            let forward = observers.clone();
            presence.subscribe(move |online| {
                forward.notify(&CoreEvent::PresenceChanged(online.clone()));
            });

            let typing = TypingCoordinator::new(
                outbox,
                settings.typing_delay,
                settings.remote_typing_expiry,
            );
            let forward = observers.clone();
            typing.subscribe(move |change| {
                forward.notify(&CoreEvent::TypingChanged {
                    peer: change.peer.clone(),
                    typing: change.typing,
                });
            });

            SyncCore {
                identity,
                history,
                directory,
                settings,
                state: Mutex::new(CoreState {
                    store,
                    last: LastMessageCache::new(),
                    peers: Vec::new(),
                    sorted: Vec::new(),
                    view_epoch: 0,
                    connection: ConnectionState::Disconnected,
                    ever_connected: false,
                }),
                presence,
                typing,
                observers,
                connection: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
                torn_down: AtomicBool::new(false),
                expired: AtomicBool::new(false),
            }
        })
    }

    /// Register handlers for every event kind on `connection`, then
    /// activate it. Handlers hold a weak reference to the core.
    pub fn attach(self: &Arc<Self>, connection: Arc<Connection>) {
        if self.is_torn_down() {
            return;
        }

        let subscriptions: Vec<Unsubscribe> = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let core = Arc::downgrade(self);
                connection.subscribe(kind, move |event| {
                    if let Some(core) = core.upgrade() {
                        core.on_transport(event);
                    }
                })
            })
            .collect();

        let previous = std::mem::replace(&mut *lock(&self.subscriptions), subscriptions);
        for unsubscribe in previous {
            unsubscribe.unsubscribe();
        }
        *lock(&self.connection) = Some(Arc::clone(&connection));

        connection.activate();
        lock(&self.state).connection = connection.state();
        debug!(conn = connection.id(), "Core attached to connection");
    }

    fn on_transport(self: &Arc<Self>, event: &TransportEvent) {
        if self.is_torn_down() {
            return;
        }

        match event {
            TransportEvent::Connected => {
                let refetch = {
                    let mut state = lock(&self.state);
                    let reconnect = state.ever_connected;
                    state.ever_connected = true;
                    state.connection = ConnectionState::Connected;
                    if reconnect {
                        state.store.active_peer().cloned()
                    } else {
                        None
                    }
                };
                self.observers
                    .notify(&CoreEvent::ConnectionChanged(ConnectionState::Connected));

                if let Some(peer) = refetch {
                    info!(peer = %peer, "Reconnected, refreshing conversation");
                    let core = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = core.refresh_conversation(peer).await {
                            debug!(error = %e, "Conversation refresh after reconnect failed");
                        }
                    });
                }
            }
            TransportEvent::Disconnected { .. } => {
                let next = {
                    let mut state = lock(&self.state);
                    if state.connection != ConnectionState::Unavailable {
                        state.connection = ConnectionState::Disconnected;
                    }
                    state.connection
                };
                self.observers.notify(&CoreEvent::ConnectionChanged(next));
            }
            TransportEvent::ConnectError(err) => {
                lock(&self.state).connection = ConnectionState::Unavailable;
                self.observers
                    .notify(&CoreEvent::ConnectionChanged(ConnectionState::Unavailable));
                if *err == TransportError::Unauthorized {
                    self.expire("push channel rejected the token");
                }
            }
            TransportEvent::ReceiveMessage(message) => self.ingest(message.clone()),
            TransportEvent::Typing(peer) => self.typing.on_remote(peer.clone(), true),
            TransportEvent::StopTyping(peer) => self.typing.on_remote(peer.clone(), false),
            TransportEvent::OnlineUsers(online) => self.presence.apply_snapshot(online.clone()),
        }
    }

    fn ingest(&self, message: Message) {
        let me = &self.identity.id;
        if &message.sender_id != me && &message.receiver_id != me {
            debug!(sender = %message.sender_id, "Ignoring message not addressed to us");
            return;
        }
        let other = message.counterpart(me).clone();

        let outcome = {
            let mut state = lock(&self.state);
            if self.is_torn_down() {
                return;
            }
            let outcome = state.store.ingest(message.clone());
            state.last.record(other.clone(), message.clone());
            state.resort();
            outcome
        };

        debug!(peer = %other, outcome = ?outcome, "Stream message");
        if outcome.changed() {
            self.observers
                .notify(&CoreEvent::MessagesChanged { peer: other });
        }
        if outcome != IngestOutcome::Duplicate {
            self.observers.notify(&CoreEvent::MessageReceived(message));
        }
        self.observers.notify(&CoreEvent::PeersReordered);
    }

    /// Make `peer` the active conversation and seed it from history.
    ///
    /// Returns `Ok(false)` when the fetch resolved after another switch and
    /// was discarded.
    pub async fn select_peer(&self, peer: UserId) -> Result<bool, ParleyError> {
        if self.is_torn_down() {
            return Ok(false);
        }

        let epoch = {
            let mut state = lock(&self.state);
            state.view_epoch += 1;
            state.store.activate(peer.clone());
            state.view_epoch
        };
        self.typing.set_active_peer(Some(peer.clone()));

        info!(peer = %peer, "Active peer changed");
        self.observers
            .notify(&CoreEvent::ActivePeerChanged(Some(peer.clone())));
        self.observers.notify(&CoreEvent::MessagesChanged {
            peer: peer.clone(),
        });

        self.load_conversation(peer, epoch).await
    }

    /// Close the active conversation.
    pub fn clear_active_peer(&self) {
        if self.is_torn_down() {
            return;
        }
        let had_peer = {
            let mut state = lock(&self.state);
            state.view_epoch += 1;
            let had_peer = state.store.active_peer().is_some();
            state.store.clear();
            had_peer
        };
        self.typing.set_active_peer(None);
        if had_peer {
            self.observers.notify(&CoreEvent::ActivePeerChanged(None));
        }
    }

    /// Re-seed `peer` without switching, if it is still the active peer.
    pub async fn refresh_conversation(&self, peer: UserId) -> Result<bool, ParleyError> {
        let epoch = {
            let state = lock(&self.state);
            if state.store.active_peer() != Some(&peer) {
                return Ok(false);
            }
            state.view_epoch
        };
        self.load_conversation(peer, epoch).await
    }

    async fn load_conversation(&self, peer: UserId, epoch: u64) -> Result<bool, ParleyError> {
        let history = match self.history.get_history(&peer, &self.identity.token).await {
            Ok(history) => history,
            Err(e) => return Err(self.api_failure(e, "History fetch failed")),
        };

        let applied = {
            let mut state = lock(&self.state);
            if self.is_torn_down() || state.view_epoch != epoch {
                false
            } else {
                if let Some(last) = history.last() {
                    state.last.record_if_newer(peer.clone(), last.clone());
                    state.resort();
                }
                state.store.seed(peer.clone(), history);
                true
            }
        };

        if applied {
            self.observers
                .notify(&CoreEvent::MessagesChanged { peer });
            self.observers.notify(&CoreEvent::PeersReordered);
        } else {
            debug!(peer = %peer, "Discarding stale history");
        }
        Ok(applied)
    }

    /// Send `body` to the active peer.
    ///
    /// A blank body or no active peer is a no-op. The message is inserted as
    /// pending before it is handed to the push channel.
    pub fn send_message(&self, body: &str) -> Result<Option<Message>, ParleyError> {
        if self.is_torn_down() {
            return Err(TransportError::Closed.into());
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        let Some(peer) = self.active_peer() else {
            return Ok(None);
        };

        let connection = lock(&self.connection)
            .clone()
            .filter(|conn| conn.state().can_send())
            .ok_or(TransportError::Unavailable)?;

        let message = {
            let mut state = lock(&self.state);
            let message = state.store.send_optimistic(body, &peer, Utc::now());
            state.last.record(peer.clone(), message.clone());
            state.resort();
            message
        };

        self.observers.notify(&CoreEvent::MessagesChanged {
            peer: peer.clone(),
        });
        self.observers.notify(&CoreEvent::PeersReordered);

        let outgoing = OutgoingMessage {
            sender: self.identity.id.clone(),
            receiver_id: peer.clone(),
            message: body.to_string(),
            client_ref: message.client_ref.unwrap_or_else(Uuid::new_v4),
        };
        if let Err(e) = connection.emit(ClientEvent::SendMessage(outgoing)) {
            warn!(peer = %peer, error = %e, "Send failed, message stays pending");
            return Err(e.into());
        }
        Ok(Some(message))
    }

    /// Forward a compose keystroke to the typing coordinator.
    pub fn compose_keystroke(&self) -> bool {
        !self.is_torn_down() && self.typing.keystroke()
    }

    fn emit_signal(&self, event: ClientEvent) {
        let Some(connection) = lock(&self.connection).clone() else {
            return;
        };
        if let Err(e) = connection.emit(event) {
            debug!(error = %e, "Typing signal dropped");
        }
    }

    /// Fetch the directory, then populate the last-message cache.
    ///
    /// The logged-in user is never listed. Returns the number of peers.
    pub async fn load_peers(&self) -> Result<usize, ParleyError> {
        let listed = match self.directory.list_peers(&self.identity.token).await {
            Ok(peers) => peers,
            Err(e) => return Err(self.api_failure(e, "Directory listing failed")),
        };

        let peers: Vec<Peer> = listed
            .into_iter()
            .filter(|peer| peer.id != self.identity.id)
            .collect();
        let ids: Vec<UserId> = peers.iter().map(|peer| peer.id.clone()).collect();

        {
            let mut state = lock(&self.state);
            if self.is_torn_down() {
                return Ok(0);
            }
            state.peers = peers;
            state.resort();
        }
        info!(count = ids.len(), "Peers loaded");
        self.observers.notify(&CoreEvent::PeersReordered);

        self.populate_last_messages(&ids).await?;
        Ok(ids.len())
    }

    async fn populate_last_messages(&self, ids: &[UserId]) -> Result<(), ParleyError> {
        let found = match self
            .history
            .last_messages(ids, &self.identity.token, self.settings.history_fanout)
            .await
        {
            Ok(found) => found,
            Err(e) => return Err(self.api_failure(e, "Last message population failed")),
        };

        let updated = {
            let mut state = lock(&self.state);
            if self.is_torn_down() {
                return Ok(());
            }
            let updated = found
                .into_iter()
                .filter(|(peer, message)| state.last.record_if_newer(peer.clone(), message.clone()))
                .count();
            state.resort();
            updated
        };

        debug!(updated, "Last-message cache populated");
        self.observers.notify(&CoreEvent::PeersReordered);
        Ok(())
    }

    /// Peers whose display name contains `term`, case-insensitively, in
    /// sorted order. A blank term matches everyone.
    pub fn search_peers(&self, term: &str) -> Vec<Peer> {
        let needle = term.trim().to_lowercase();
        lock(&self.state)
            .sorted
            .iter()
            .filter(|peer| needle.is_empty() || peer.display_name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub async fn peer_profile(&self, id: &UserId) -> Result<Peer, ParleyError> {
        self.directory
            .get_peer(id, &self.identity.token)
            .await
            .map_err(|e| self.api_failure(e, "Profile lookup failed"))
    }

    fn api_failure(&self, err: ApiError, what: &str) -> ParleyError {
        if err.is_auth() {
            self.expire(what);
        } else {
            warn!(error = %err, "{what}");
        }
        err.into()
    }

    /// Report the session as rejected, once.
    fn expire(&self, reason: &str) {
        if self.is_torn_down() || self.expired.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(user = %self.identity.id, reason, "Session rejected by backend");
        self.observers.notify(&CoreEvent::SessionExpired);
    }

    // -- Read-only derived state --

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn active_peer(&self) -> Option<UserId> {
        lock(&self.state).store.active_peer().cloned()
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.state).store.messages().to_vec()
    }

    pub fn sorted_peers(&self) -> Vec<Peer> {
        lock(&self.state).sorted.clone()
    }

    pub fn last_message(&self, peer: &UserId) -> Option<Message> {
        lock(&self.state).last.get(peer).cloned()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    pub fn is_online(&self, peer: &UserId) -> bool {
        self.presence.is_online(peer)
    }

    pub fn online_peers(&self) -> Vec<UserId> {
        self.presence.online_peers()
    }

    pub fn is_typing(&self, peer: &UserId) -> bool {
        self.typing.is_typing(peer)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }

    /// Detach from the connection, cancel timers and clear per-session
    /// state. Idempotent; the core is unusable afterwards.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscriptions = std::mem::take(&mut *lock(&self.subscriptions));
        for unsubscribe in subscriptions {
            unsubscribe.unsubscribe();
        }
        lock(&self.connection).take();

        self.typing.shutdown();
        self.presence.shutdown();
        lock(&self.state).clear();
        self.observers.close();

        info!(user = %self.identity.id, "Sync core torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::{mpsc, Notify};

    use parley_net::{
        ConnectionManager, LoopbackConnector, RemoteEnd, SocketCommand, SocketNotification,
    };
    use parley_shared::{AuthError, MessageId, ServerEvent, WireMessage};

    #[derive(Default)]
    struct FakeHistory {
        conversations: Mutex<HashMap<UserId, Vec<Message>>>,
        gates: Mutex<HashMap<UserId, Arc<Notify>>>,
        calls: Mutex<Vec<UserId>>,
        expired: AtomicBool,
    }

    impl FakeHistory {
        fn with(self, peer: &str, messages: Vec<Message>) -> Self {
            lock(&self.conversations).insert(UserId::new(peer), messages);
            self
        }

        fn gate(&self, peer: &str) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            lock(&self.gates).insert(UserId::new(peer), gate.clone());
            gate
        }

        fn calls_for(&self, peer: &str) -> usize {
            lock(&self.calls).iter().filter(|p| p.as_str() == peer).count()
        }
    }

    #[async_trait]
    impl HistoryApi for FakeHistory {
        async fn get_history(&self, peer: &UserId, _token: &str) -> Result<Vec<Message>, ApiError> {
            lock(&self.calls).push(peer.clone());
            if self.expired.load(Ordering::SeqCst) {
                return Err(AuthError::TokenExpired.into());
            }
            let gate = lock(&self.gates).get(peer).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(lock(&self.conversations)
                .get(peer)
                .cloned()
                .unwrap_or_default())
        }
    }

    struct FakeDirectory(Vec<Peer>);

    #[async_trait]
    impl DirectoryApi for FakeDirectory {
        async fn list_peers(&self, _token: &str) -> Result<Vec<Peer>, ApiError> {
            Ok(self.0.clone())
        }

        async fn get_peer(&self, id: &UserId, _token: &str) -> Result<Peer, ApiError> {
            self.0
                .iter()
                .find(|p| &p.id == id)
                .cloned()
                .ok_or_else(|| ApiError::NotFound(format!("user {id}")))
        }
    }

    struct Harness {
        core: Arc<SyncCore>,
        history: Arc<FakeHistory>,
        manager: ConnectionManager,
        remote: RemoteEnd,
    }

    fn identity() -> Identity {
        Identity {
            id: UserId::new("me"),
            display_name: "Me".into(),
            email: None,
            token: "tok".into(),
        }
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, from: &str, to: &str, secs: i64) -> Message {
        Message {
            id: Some(MessageId::new(id)),
            sender_id: UserId::new(from),
            receiver_id: UserId::new(to),
            body: format!("body {id}"),
            created_at: at(secs),
            pending: false,
            client_ref: None,
        }
    }

    fn harness(history: FakeHistory, peers: Vec<Peer>) -> Harness {
        let history = Arc::new(history);
        let core = SyncCore::new(
            identity(),
            history.clone(),
            Arc::new(FakeDirectory(peers)),
            CoreSettings::default(),
        );
        let connector = Arc::new(LoopbackConnector::new());
        let manager = ConnectionManager::new(connector.clone());
        core.attach(manager.connect("tok"));
        let remote = connector.take_remote().unwrap();
        Harness {
            core,
            history,
            manager,
            remote,
        }
    }

    fn events(core: &SyncCore) -> (Unsubscribe, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let unsub = core.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (unsub, rx)
    }

    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not met");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn push_message(remote: &RemoteEnd, wire: WireMessage) {
        remote
            .push(SocketNotification::Event(ServerEvent::ReceiveMessage(wire)))
            .await;
    }

    async fn connect(h: &Harness) {
        h.remote.push(SocketNotification::Connected).await;
        let core = h.core.clone();
        eventually(move || core.connection_state() == ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_stale_history_is_discarded_after_switch() {
        let history = FakeHistory::default()
            .with("x", vec![msg("x1", "x", "me", 1)])
            .with("y", vec![msg("y1", "y", "me", 2)]);
        let gate = history.gate("x");
        let h = harness(history, Vec::new());

        let core = h.core.clone();
        let slow = tokio::spawn(async move { core.select_peer(UserId::new("x")).await });
        let watch = h.core.clone();
        eventually(move || watch.active_peer() == Some(UserId::new("x"))).await;

        assert!(h.core.select_peer(UserId::new("y")).await.unwrap());
        let before = h.core.messages();

        gate.notify_one();
        assert!(!slow.await.unwrap().unwrap());

        assert_eq!(h.core.messages(), before);
        assert_eq!(h.core.messages()[0].id, Some(MessageId::new("y1")));
        assert_eq!(h.core.active_peer(), Some(UserId::new("y")));
    }

    #[tokio::test]
    async fn test_live_message_during_history_fetch_survives() {
        let history = FakeHistory::default().with("bob", vec![msg("b1", "bob", "me", 1)]);
        let gate = history.gate("bob");
        let h = harness(history, Vec::new());
        connect(&h).await;

        let core = h.core.clone();
        let slow = tokio::spawn(async move { core.select_peer(UserId::new("bob")).await });
        let watch = h.core.clone();
        eventually(move || watch.active_peer() == Some(UserId::new("bob"))).await;

        push_message(&h.remote, (&msg("live", "bob", "me", 5)).into()).await;
        let watch = h.core.clone();
        eventually(move || !watch.messages().is_empty()).await;

        gate.notify_one();
        assert!(slow.await.unwrap().unwrap());

        let ids: Vec<_> = h.core.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(
            ids,
            vec![Some(MessageId::new("b1")), Some(MessageId::new("live"))]
        );
        assert_eq!(
            h.core.last_message(&UserId::new("bob")).and_then(|m| m.id),
            Some(MessageId::new("live"))
        );
    }

    #[tokio::test]
    async fn test_stream_message_fans_out() {
        let h = harness(FakeHistory::default(), vec![Peer::new("bob", "Bob"), Peer::new("carol", "Carol")]);
        h.core.load_peers().await.unwrap();
        h.core.select_peer(UserId::new("bob")).await.unwrap();
        connect(&h).await;

        push_message(&h.remote, (&msg("m1", "bob", "me", 5)).into()).await;
        push_message(&h.remote, (&msg("m2", "carol", "me", 9)).into()).await;

        let core = h.core.clone();
        eventually(move || core.last_message(&UserId::new("carol")).is_some()).await;

        let messages = h.core.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, UserId::new("bob"));

        let order: Vec<_> = h.core.sorted_peers().into_iter().map(|p| p.id).collect();
        assert_eq!(order, vec![UserId::new("carol"), UserId::new("bob")]);
    }

    #[tokio::test]
    async fn test_no_ingest_after_disconnect() {
        let h = harness(FakeHistory::default(), Vec::new());
        h.core.select_peer(UserId::new("bob")).await.unwrap();
        connect(&h).await;

        push_message(&h.remote, (&msg("m1", "bob", "me", 1)).into()).await;
        let core = h.core.clone();
        eventually(move || core.messages().len() == 1).await;

        h.manager.disconnect();
        push_message(&h.remote, (&msg("m2", "bob", "me", 2)).into()).await;
        settle().await;

        assert_eq!(h.core.messages().len(), 1);
        assert!(h.core.last_message(&UserId::new("bob")).unwrap().id == Some(MessageId::new("m1")));
    }

    #[tokio::test]
    async fn test_send_and_reconcile_by_client_ref() {
        let mut h = harness(FakeHistory::default(), Vec::new());
        h.core.select_peer(UserId::new("bob")).await.unwrap();

        assert!(matches!(
            h.core.send_message("hello"),
            Err(ParleyError::Transport(TransportError::Unavailable))
        ));

        connect(&h).await;
        let sent = h.core.send_message("hello").unwrap().unwrap();
        assert!(sent.pending);
        assert_eq!(h.core.messages().len(), 1);

        let client_ref = match h.remote.commands.recv().await {
            Some(SocketCommand::Emit(ClientEvent::SendMessage(out))) => {
                assert_eq!(out.receiver_id, UserId::new("bob"));
                assert_eq!(out.message, "hello");
                out.client_ref
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(Some(client_ref), sent.client_ref);

        let mut echo: WireMessage = (&msg("srv1", "me", "bob", 0)).into();
        echo.message = "hello".into();
        echo.created_at = Utc::now();
        echo.client_ref = Some(client_ref);
        push_message(&h.remote, echo).await;

        let core = h.core.clone();
        eventually(move || core.messages().iter().all(|m| !m.pending)).await;
        assert_eq!(h.core.messages().len(), 1);
        assert_eq!(h.core.messages()[0].id, Some(MessageId::new("srv1")));
    }

    #[tokio::test]
    async fn test_blank_send_and_no_peer_are_noops() {
        let h = harness(FakeHistory::default(), Vec::new());
        connect(&h).await;

        assert_eq!(h.core.send_message("hi").unwrap(), None);
        h.core.select_peer(UserId::new("bob")).await.unwrap();
        assert_eq!(h.core.send_message("   ").unwrap(), None);
        assert!(h.core.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_handshake_expires_session() {
        let h = harness(FakeHistory::default(), Vec::new());
        let (_u, mut rx) = events(&h.core);

        h.remote
            .push(SocketNotification::Rejected(TransportError::Unauthorized))
            .await;

        let mut saw_expired = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
        {
            if event == CoreEvent::SessionExpired {
                saw_expired = true;
                break;
            }
        }
        assert!(saw_expired);
        assert_eq!(h.core.connection_state(), ConnectionState::Unavailable);
    }

    #[tokio::test]
    async fn test_history_auth_error_expires_session() {
        let history = FakeHistory::default();
        history.expired.store(true, Ordering::SeqCst);
        let h = harness(history, Vec::new());
        let (_u, mut rx) = events(&h.core);

        let err = h.core.select_peer(UserId::new("bob")).await.unwrap_err();
        assert!(matches!(err, ParleyError::Auth(AuthError::TokenExpired)));

        let mut expired = 0;
        while let Ok(event) = rx.try_recv() {
            if event == CoreEvent::SessionExpired {
                expired += 1;
            }
        }
        assert_eq!(expired, 1);
    }

    #[tokio::test]
    async fn test_peers_exclude_self_and_sort_by_recency() {
        let history = FakeHistory::default()
            .with("a", vec![msg("a1", "a", "me", 10)])
            .with("c", vec![msg("c0", "me", "c", 1), msg("c1", "c", "me", 20)]);
        let peers = vec![
            Peer::new("me", "Me"),
            Peer::new("a", "Alice"),
            Peer::new("b", "bob"),
            Peer::new("c", "Carla"),
        ];
        let h = harness(history, peers);

        assert_eq!(h.core.load_peers().await.unwrap(), 3);

        let order: Vec<_> = h.core.sorted_peers().into_iter().map(|p| p.id.0).collect();
        assert_eq!(order, ["c", "a", "b"]);

        let hits: Vec<_> = h.core.search_peers("CAR").into_iter().map(|p| p.id.0).collect();
        assert_eq!(hits, ["c"]);
        assert_eq!(h.core.search_peers("").len(), 3);
        assert_eq!(h.core.search_peers("a").len(), 2);
    }

    #[tokio::test]
    async fn test_population_keeps_newer_live_entry() {
        let history = FakeHistory::default().with("a", vec![msg("a1", "a", "me", 10)]);
        let h = harness(history, vec![Peer::new("a", "Alice")]);
        connect(&h).await;

        push_message(&h.remote, (&msg("live", "a", "me", 100)).into()).await;
        let core = h.core.clone();
        eventually(move || core.last_message(&UserId::new("a")).is_some()).await;

        h.core.load_peers().await.unwrap();
        assert_eq!(
            h.core.last_message(&UserId::new("a")).unwrap().id,
            Some(MessageId::new("live"))
        );
    }

    #[tokio::test]
    async fn test_reconnect_refetches_active_conversation() {
        let history = FakeHistory::default().with("bob", vec![msg("b1", "bob", "me", 1)]);
        let h = harness(history, Vec::new());
        connect(&h).await;
        h.core.select_peer(UserId::new("bob")).await.unwrap();
        assert_eq!(h.history.calls_for("bob"), 1);

        h.remote
            .push(SocketNotification::Disconnected {
                reason: "reset".into(),
            })
            .await;
        h.remote.push(SocketNotification::Connected).await;

        let history = h.history.clone();
        eventually(move || history.calls_for("bob") == 2).await;
    }

    #[tokio::test]
    async fn test_typing_signals_route_through_connection() {
        let mut h = harness(FakeHistory::default(), Vec::new());
        connect(&h).await;
        h.core.select_peer(UserId::new("bob")).await.unwrap();

        assert!(h.core.compose_keystroke());
        match h.remote.commands.recv().await {
            Some(SocketCommand::Emit(ClientEvent::Typing { receiver_id })) => {
                assert_eq!(receiver_id, UserId::new("bob"))
            }
            other => panic!("unexpected {other:?}"),
        }

        h.remote
            .push(SocketNotification::Event(ServerEvent::Typing {
                sender_id: UserId::new("bob"),
            }))
            .await;
        let core = h.core.clone();
        eventually(move || core.is_typing(&UserId::new("bob"))).await;
    }

    #[tokio::test]
    async fn test_teardown_clears_state() {
        let h = harness(FakeHistory::default(), vec![Peer::new("a", "Alice")]);
        h.core.load_peers().await.unwrap();
        h.core.select_peer(UserId::new("a")).await.unwrap();
        h.remote
            .push(SocketNotification::Event(ServerEvent::OnlineUsers(vec![
                UserId::new("a"),
            ])))
            .await;
        let core = h.core.clone();
        eventually(move || core.is_online(&UserId::new("a"))).await;

        h.core.teardown();

        assert!(h.core.active_peer().is_none());
        assert!(h.core.sorted_peers().is_empty());
        assert!(h.core.online_peers().is_empty());
        assert!(!h.core.compose_keystroke());
        assert!(!h.core.select_peer(UserId::new("a")).await.unwrap());
    }
}
