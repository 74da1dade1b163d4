//! Online roster.
//!
//! The server pushes the full list of online users on every change, so the
//! roster is replaced wholesale rather than patched.

use std::collections::HashSet;

use tracing::debug;

use parley_shared::UserId;

/// The set of users the server last reported as online.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    online: HashSet<UserId>,
}

impl PresenceRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with `snapshot`.
    ///
    /// Returns `true` if the set of online users actually changed.
    pub fn apply_snapshot(&mut self, snapshot: impl IntoIterator<Item = UserId>) -> bool {
        let next: HashSet<UserId> = snapshot.into_iter().collect();
        if next == self.online {
            return false;
        }

        debug!(
            before = self.online.len(),
            after = next.len(),
            "Presence snapshot applied"
        );
        self.online = next;
        true
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.contains(user)
    }

    /// Online users in id order.
    pub fn online_peers(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.online.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    /// Forget everyone, e.g. when the push channel drops.
    pub fn clear(&mut self) -> bool {
        let changed = !self.online.is_empty();
        self.online.clear();
        changed
    }
}
