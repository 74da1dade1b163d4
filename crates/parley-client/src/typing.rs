//! Typing signals in both directions.
//!
//! Local side: every keystroke sends `typing` to the active peer and
//! re-arms a single stop timer. Only the timer armed by the latest keystroke
//! may fire, so a quiet period produces exactly one `stopTyping`. Changing
//! the active peer flushes the pending stop to the peer it was armed for.
//!
//! Remote side: a per-peer flag driven by the peer's own signals, with an
//! optional expiry for peers that never send `stopTyping`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use parley_shared::observe::lock;
use parley_shared::{ClientEvent, Observers, Unsubscribe, UserId};

/// Where outgoing typing signals go.
pub type Outbox = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// A remote peer started or stopped typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingChange {
    pub peer: UserId,
    pub typing: bool,
}

struct PendingStop {
    peer: UserId,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct LocalState {
    active_peer: Option<UserId>,
    pending: Option<PendingStop>,
    generation: u64,
}

#[derive(Default)]
struct RemoteState {
    typing: HashMap<UserId, bool>,
    expiries: HashMap<UserId, (u64, JoinHandle<()>)>,
    generation: u64,
}

struct Inner {
    outbox: Outbox,
    delay: Duration,
    remote_expiry: Option<Duration>,
    local: Mutex<LocalState>,
    remote: Mutex<RemoteState>,
    observers: Observers<TypingChange>,
    shut: AtomicBool,
}

pub struct TypingCoordinator {
    inner: Arc<Inner>,
}

impl TypingCoordinator {
    pub fn new(outbox: Outbox, delay: Duration, remote_expiry: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                outbox,
                delay,
                remote_expiry,
                local: Mutex::new(LocalState::default()),
                remote: Mutex::new(RemoteState::default()),
                observers: Observers::new(),
                shut: AtomicBool::new(false),
            }),
        }
    }

    /// Record a compose keystroke. Returns `false` when there is nobody to
    /// signal (no active peer, or shut down).
    pub fn keystroke(&self) -> bool {
        if self.inner.is_shut() {
            return false;
        }

        let peer = {
            let mut local = lock(&self.inner.local);
            let Some(peer) = local.active_peer.clone() else {
                return false;
            };

            local.generation += 1;
            let generation = local.generation;
            if let Some(previous) = local.pending.take() {
                previous.timer.abort();
            }

            let weak = Arc::downgrade(&self.inner);
            let delay = self.inner.delay;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.fire_stop(generation);
                }
            });

            local.pending = Some(PendingStop {
                peer: peer.clone(),
                generation,
                timer,
            });
            peer
        };

        (self.inner.outbox)(ClientEvent::Typing { receiver_id: peer });
        true
    }

    /// Change the peer local signals are addressed to.
    ///
    /// A pending stop is cancelled and sent right away to the peer it was
    /// armed for. Remote typing flags are reset.
    pub fn set_active_peer(&self, peer: Option<UserId>) {
        let flushed = {
            let mut local = lock(&self.inner.local);
            if local.active_peer == peer {
                return;
            }
            local.active_peer = peer;
            local.generation += 1;
            local.pending.take()
        };

        if let Some(pending) = flushed {
            pending.timer.abort();
            if !self.inner.is_shut() {
                debug!(peer = %pending.peer, "Flushing stopTyping on peer switch");
                (self.inner.outbox)(ClientEvent::StopTyping {
                    receiver_id: pending.peer,
                });
            }
        }

        self.inner.reset_remote();
    }

    pub fn active_peer(&self) -> Option<UserId> {
        lock(&self.inner.local).active_peer.clone()
    }

    /// Apply a `typing`/`stopTyping` signal received from `peer`.
    pub fn on_remote(&self, peer: UserId, typing: bool) {
        if self.inner.is_shut() {
            return;
        }

        let changed = {
            let mut remote = lock(&self.inner.remote);
            let previous = remote.typing.insert(peer.clone(), typing).unwrap_or(false);
            if let Some((_, timer)) = remote.expiries.remove(&peer) {
                timer.abort();
            }

            if let (true, Some(expiry)) = (typing, self.inner.remote_expiry) {
                remote.generation += 1;
                let generation = remote.generation;
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                let target = peer.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(expiry).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.expire_remote(target, generation);
                    }
                });
                remote.expiries.insert(peer.clone(), (generation, timer));
            }

            previous != typing
        };

        if changed {
            self.inner.observers.notify(&TypingChange { peer, typing });
        }
    }

    pub fn is_typing(&self, peer: &UserId) -> bool {
        lock(&self.inner.remote)
            .typing
            .get(peer)
            .copied()
            .unwrap_or(false)
    }

    pub fn subscribe<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&TypingChange) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(handler)
    }

    /// Cancel every timer without emitting, clear remote flags and detach
    /// subscribers. Later calls into the coordinator are no-ops.
    pub fn shutdown(&self) {
        if self.inner.shut.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut local = lock(&self.inner.local);
            local.active_peer = None;
            local.generation += 1;
            if let Some(pending) = local.pending.take() {
                pending.timer.abort();
            }
        }
        {
            let mut remote = lock(&self.inner.remote);
            for (_, (_, timer)) in remote.expiries.drain() {
                timer.abort();
            }
            remote.typing.clear();
        }
        self.inner.observers.close();
    }
}

impl Inner {
    fn is_shut(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }

    fn fire_stop(&self, generation: u64) {
        let peer = {
            let mut local = lock(&self.local);
            match &local.pending {
                Some(pending) if pending.generation == generation => {
                    local.pending.take().map(|p| p.peer)
                }
                _ => None,
            }
        };

        if let Some(peer) = peer {
            if !self.is_shut() {
                (self.outbox)(ClientEvent::StopTyping { receiver_id: peer });
            }
        }
    }

    fn expire_remote(&self, peer: UserId, generation: u64) {
        let expired = {
            let mut remote = lock(&self.remote);
            match remote.expiries.get(&peer) {
                Some((armed, _)) if *armed == generation => {
                    remote.expiries.remove(&peer);
                    remote.typing.insert(peer.clone(), false).unwrap_or(false)
                }
                _ => false,
            }
        };

        if expired && !self.is_shut() {
            debug!(peer = %peer, "Remote typing expired");
            self.observers.notify(&TypingChange {
                peer,
                typing: false,
            });
        }
    }

    fn reset_remote(&self) {
        let cleared: Vec<UserId> = {
            let mut remote = lock(&self.remote);
            for (_, (_, timer)) in remote.expiries.drain() {
                timer.abort();
            }
            remote
                .typing
                .drain()
                .filter_map(|(peer, typing)| typing.then_some(peer))
                .collect()
        };

        for peer in cleared {
            self.observers.notify(&TypingChange {
                peer,
                typing: false,
            });
        }
    }
}
