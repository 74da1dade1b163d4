//! Explicit handler registration.
//!
//! [`Observers`] is the registry behind every `subscribe(handler) ->
//! Unsubscribe` capability in Parley (connection events, presence, typing,
//! core state changes). Handlers are invoked outside the registry lock, and
//! a handler detached (or a registry closed) while a notification is in
//! progress is not invoked for the remainder of that notification.

use std::sync::{Arc, Mutex, MutexGuard};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
    closed: bool,
}

impl<T> Registry<T> {
    fn is_live(&self, id: u64) -> bool {
        !self.closed && self.entries.iter().any(|(entry, _)| *entry == id)
    }
}

pub struct Observers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Register `handler`. On a closed registry this is a no-op.
    pub fn subscribe<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner);
        if registry.closed {
            return Unsubscribe::noop();
        }

        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(handler)));

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<(u64, Callback<T>)> = {
            let registry = lock(&self.inner);
            if registry.closed {
                return;
            }
            registry.entries.clone()
        };

        for (id, handler) in snapshot {
            if lock(&self.inner).is_live(id) {
                handler(value);
            }
        }
    }

    /// Detach every handler and refuse new ones.
    pub fn close(&self) {
        let mut registry = lock(&self.inner);
        registry.closed = true;
        registry.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Capability returned by `subscribe`. Calling [`Unsubscribe::unsubscribe`]
/// detaches the handler; dropping it leaves the handler attached.
pub struct Unsubscribe {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn noop() -> Self {
        Self { detach: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
