//! Newest known message per conversation, used to order the peer list.

use std::collections::HashMap;

use parley_shared::{Message, Peer, UserId};

#[derive(Debug, Clone, Default)]
pub struct LastMessageCache {
    entries: HashMap<UserId, Message>,
}

impl LastMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry for `peer`, replacing whatever was there.
    pub fn record(&mut self, peer: UserId, message: Message) {
        self.entries.insert(peer, message);
    }

    /// Set the entry for `peer` unless the current one is strictly newer.
    ///
    /// Returns whether the entry was written. Background population uses
    /// this so a slow history fetch cannot clobber a live message.
    pub fn record_if_newer(&mut self, peer: UserId, message: Message) -> bool {
        match self.entries.get(&peer) {
            Some(existing) if existing.created_at > message.created_at => false,
            _ => {
                self.entries.insert(peer, message);
                true
            }
        }
    }

    pub fn get(&self, peer: &UserId) -> Option<&Message> {
        self.entries.get(peer)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Order `ids` for display.
    ///
    /// Peers with a cached message come first, newest first. Peers without
    /// one follow in their original relative order.
    pub fn sort_ids(&self, ids: &[UserId]) -> Vec<UserId> {
        let mut out = ids.to_vec();
        out.sort_by(|a, b| {
            let ka = self.entries.get(a).map(|m| m.created_at);
            let kb = self.entries.get(b).map(|m| m.created_at);
            // None < Some, so reversing puts dated peers first, newest first.
            kb.cmp(&ka)
        });
        out
    }

    /// Same ordering as [`sort_ids`](Self::sort_ids), applied to full peers.
    pub fn sorted_peers(&self, peers: &[Peer]) -> Vec<Peer> {
        let mut out = peers.to_vec();
        out.sort_by(|a, b| {
            let ka = self.entries.get(&a.id).map(|m| m.created_at);
            let kb = self.entries.get(&b.id).map(|m| m.created_at);
            kb.cmp(&ka)
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parley_shared::MessageId;

    fn msg_at(secs: i64) -> Message {
        Message {
            id: Some(MessageId::new(format!("m{secs}"))),
            sender_id: UserId::new("x"),
            receiver_id: UserId::new("me"),
            body: String::new(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            pending: false,
            client_ref: None,
        }
    }

    fn ids(list: &[&str]) -> Vec<UserId> {
        list.iter().map(|s| UserId::new(*s)).collect()
    }

    #[test]
    fn test_sort_newest_first_then_undated() {
        let mut cache = LastMessageCache::new();
        cache.record(UserId::new("A"), msg_at(10));
        cache.record(UserId::new("C"), msg_at(20));

        assert_eq!(cache.sort_ids(&ids(&["A", "B", "C"])), ids(&["C", "A", "B"]));
    }

    #[test]
    fn test_undated_peers_keep_relative_order() {
        let mut cache = LastMessageCache::new();
        cache.record(UserId::new("d"), msg_at(5));

        assert_eq!(
            cache.sort_ids(&ids(&["z", "a", "d", "m"])),
            ids(&["d", "z", "a", "m"])
        );
    }

    #[test]
    fn test_sorted_peers_matches_ids() {
        let mut cache = LastMessageCache::new();
        cache.record(UserId::new("2"), msg_at(1));
        let peers = vec![Peer::new("1", "One"), Peer::new("2", "Two")];

        let sorted = cache.sorted_peers(&peers);
        assert_eq!(sorted[0].display_name, "Two");
        assert_eq!(sorted[1].display_name, "One");
    }

    #[test]
    fn test_record_if_newer_keeps_live_entry() {
        let mut cache = LastMessageCache::new();
        cache.record(UserId::new("a"), msg_at(50));

        assert!(!cache.record_if_newer(UserId::new("a"), msg_at(40)));
        assert_eq!(cache.get(&UserId::new("a")).unwrap().created_at.timestamp(), 50);

        assert!(cache.record_if_newer(UserId::new("a"), msg_at(60)));
        assert!(cache.record_if_newer(UserId::new("b"), msg_at(1)));
        assert_eq!(cache.len(), 2);
    }
}
