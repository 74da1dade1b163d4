//! Presence tracker: the online roster plus change notification.

use std::sync::Mutex;

use parley_shared::observe::lock;
use parley_shared::{Observers, Unsubscribe, UserId};
use parley_store::PresenceRoster;

pub struct PresenceTracker {
    roster: Mutex<Roster>,
    observers: Observers<Vec<UserId>>,
}

#[derive(Default)]
struct Roster {
    online: PresenceRoster,
    shut_down: bool,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            roster: Mutex::new(Roster::default()),
            observers: Observers::new(),
        }
    }

    /// Replace the roster and notify subscribers with the new online set.
    /// Ignored after [`shutdown`](Self::shutdown).
    pub fn apply_snapshot(&self, snapshot: Vec<UserId>) {
        let online = {
            let mut roster = lock(&self.roster);
            if roster.shut_down {
                return;
            }
            roster.online.apply_snapshot(snapshot);
            roster.online.online_peers()
        };
        self.observers.notify(&online);
    }

    pub fn is_online(&self, peer: &UserId) -> bool {
        lock(&self.roster).online.is_online(peer)
    }

    pub fn online_peers(&self) -> Vec<UserId> {
        lock(&self.roster).online.online_peers()
    }

    pub fn subscribe<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&Vec<UserId>) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }

    /// Forget the roster and detach every subscriber.
    pub fn shutdown(&self) {
        {
            let mut roster = lock(&self.roster);
            roster.shut_down = true;
            roster.online.clear();
        }
        self.observers.close();
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_every_snapshot_is_published() {
        let tracker = PresenceTracker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _u = tracker.subscribe(move |online| lock(&sink).push(online.clone()));

        tracker.apply_snapshot(vec![UserId::new("a"), UserId::new("b")]);
        tracker.apply_snapshot(vec![UserId::new("b")]);

        assert!(!tracker.is_online(&UserId::new("a")));
        assert!(tracker.is_online(&UserId::new("b")));
        assert_eq!(
            *lock(&seen),
            vec![
                vec![UserId::new("a"), UserId::new("b")],
                vec![UserId::new("b")]
            ]
        );
    }

    #[test]
    fn test_shutdown_clears_and_silences() {
        let tracker = PresenceTracker::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let _u = tracker.subscribe(move |_| *lock(&counter) += 1);

        tracker.apply_snapshot(vec![UserId::new("a")]);
        tracker.shutdown();
        tracker.apply_snapshot(vec![UserId::new("a")]);

        assert_eq!(*lock(&hits), 1);
        assert!(tracker.online_peers().is_empty());
    }

    #[test]
    fn test_snapshot_racing_shutdown_leaves_roster_empty() {
        let tracker = Arc::new(PresenceTracker::new());

        let writers: Vec<_> = (0..4)
            .map(|n| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        tracker.apply_snapshot(vec![UserId::new(format!("u{n}-{i}"))]);
                    }
                })
            })
            .collect();

        std::thread::yield_now();
        tracker.shutdown();
        for writer in writers {
            writer.join().unwrap();
        }

        assert!(tracker.online_peers().is_empty());
        tracker.apply_snapshot(vec![UserId::new("late")]);
        assert!(!tracker.is_online(&UserId::new("late")));
    }
}
