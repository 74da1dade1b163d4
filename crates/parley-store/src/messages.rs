//! The conversation with the active peer.
//!
//! Only one conversation is materialized at a time; every other peer is
//! represented by its entry in the [`LastMessageCache`](crate::LastMessageCache).
//! The list is kept unique by server id and sorted by `(created_at, id)`, so
//! seeding from history and ingesting from the push channel can interleave
//! in any order.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use parley_shared::constants::RECONCILE_WINDOW_SECS;
use parley_shared::{Message, MessageId, UserId};

/// What [`MessageStore::ingest`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Appended as a new entry.
    Inserted,
    /// Same server id already present; nothing changed.
    Duplicate,
    /// Replaced a pending optimistic entry.
    Reconciled,
    /// Belongs to a conversation that is not materialized.
    Inactive,
}

impl IngestOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, IngestOutcome::Inserted | IngestOutcome::Reconciled)
    }
}

pub struct MessageStore {
    owner: UserId,
    peer: Option<UserId>,
    messages: Vec<Message>,
    /// Ids the push channel added since the last `activate`/`seed`.
    live: HashSet<MessageId>,
    reconcile_window: Duration,
}

impl MessageStore {
    /// Create an empty store for the conversations of `owner`.
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            peer: None,
            messages: Vec::new(),
            live: HashSet::new(),
            reconcile_window: Duration::seconds(RECONCILE_WINDOW_SECS),
        }
    }

    pub fn with_reconcile_window(mut self, window: Duration) -> Self {
        self.reconcile_window = window;
        self
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Peer whose conversation is materialized.
    pub fn active_peer(&self) -> Option<&UserId> {
        self.peer.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Entries still waiting for their server echo.
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.pending)
    }

    /// Switch the materialized conversation to `peer`, starting empty.
    pub fn activate(&mut self, peer: UserId) {
        self.peer = Some(peer);
        self.messages.clear();
        self.live.clear();
    }

    /// Drop the materialized conversation.
    pub fn clear(&mut self) {
        self.peer = None;
        self.messages.clear();
        self.live.clear();
    }

    /// Replace the conversation with `peer` by `history`.
    ///
    /// Messages the push channel delivered for `peer` while the history was
    /// being fetched are carried over when the history lacks them. Duplicate
    /// ids keep their first occurrence and the result is sorted, so the list
    /// invariants hold whatever order the history arrives in.
    pub fn seed(&mut self, peer: UserId, history: Vec<Message>) {
        let carried: Vec<Message> = if self.peer.as_ref() == Some(&peer) {
            let live = std::mem::take(&mut self.live);
            std::mem::take(&mut self.messages)
                .into_iter()
                .filter(|m| !m.pending && m.id.as_ref().is_some_and(|id| live.contains(id)))
                .collect()
        } else {
            Vec::new()
        };

        let mut seen = HashSet::new();
        let mut list: Vec<Message> = history
            .into_iter()
            .chain(carried)
            .filter(|m| match &m.id {
                Some(id) => seen.insert(id.clone()),
                None => true,
            })
            .collect();
        list.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        debug!(peer = %peer, count = list.len(), "Seeded conversation");
        self.peer = Some(peer);
        self.messages = list;
        self.live.clear();
    }

    /// Idempotently add a message from the push channel.
    pub fn ingest(&mut self, message: Message) -> IngestOutcome {
        if !self.belongs_to_active(&message) {
            return IngestOutcome::Inactive;
        }

        if let Some(id) = &message.id {
            if self.messages.iter().any(|m| m.id.as_ref() == Some(id)) {
                return IngestOutcome::Duplicate;
            }
            self.live.insert(id.clone());
        }

        if let Some(idx) = self.find_pending_match(&message) {
            self.messages.remove(idx);
            self.insert_sorted(message);
            return IngestOutcome::Reconciled;
        }

        self.insert_sorted(message);
        IngestOutcome::Inserted
    }

    /// Insert an unacknowledged outbound message stamped with `now`.
    ///
    /// The message is returned whether or not `peer` is the materialized
    /// conversation; it is only inserted if it is.
    pub fn send_optimistic(&mut self, body: &str, peer: &UserId, now: DateTime<Utc>) -> Message {
        let message = Message::pending(self.owner.clone(), peer.clone(), body, now);
        if self.peer.as_ref() == Some(peer) {
            self.insert_sorted(message.clone());
        }
        message
    }

    fn belongs_to_active(&self, message: &Message) -> bool {
        let Some(peer) = &self.peer else {
            return false;
        };
        let involves_owner = message.sender_id == self.owner || message.receiver_id == self.owner;
        involves_owner && message.counterpart(&self.owner) == peer
    }

    /// Index of the pending entry `echo` acknowledges.
    ///
    /// A shared `client_ref` is an exact match. Otherwise the oldest pending
    /// entry with the same sender, receiver and body within the reconcile
    /// window wins, unless both sides carry different refs.
    fn find_pending_match(&self, echo: &Message) -> Option<usize> {
        if echo.client_ref.is_some() {
            let exact = self
                .messages
                .iter()
                .position(|m| m.pending && m.client_ref == echo.client_ref);
            if exact.is_some() {
                return exact;
            }
        }

        self.messages.iter().position(|m| {
            let refs_conflict =
                matches!((m.client_ref, echo.client_ref), (Some(a), Some(b)) if a != b);
            m.pending
                && !refs_conflict
                && m.sender_id == echo.sender_id
                && m.receiver_id == echo.receiver_id
                && m.body == echo.body
                && (echo.created_at - m.created_at).abs() <= self.reconcile_window
        })
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = message.sort_key();
        let pos = self.messages.partition_point(|m| m.sort_key() <= key);
        self.messages.insert(pos, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, from: &str, to: &str, body: &str, secs: i64) -> Message {
        Message {
            id: Some(MessageId::new(id)),
            sender_id: UserId::new(from),
            receiver_id: UserId::new(to),
            body: body.into(),
            created_at: at(secs),
            pending: false,
            client_ref: None,
        }
    }

    fn store_with_bob() -> MessageStore {
        let mut store = MessageStore::new(UserId::new("me"));
        store.activate(UserId::new("bob"));
        store
    }

    fn assert_sorted(store: &MessageStore) {
        assert!(store
            .messages()
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_ingest_same_id_twice_is_noop() {
        let mut store = store_with_bob();
        let m = msg("m1", "bob", "me", "hi", 1);

        assert_eq!(store.ingest(m.clone()), IngestOutcome::Inserted);
        let before = store.messages().to_vec();
        assert_eq!(store.ingest(m), IngestOutcome::Duplicate);

        assert_eq!(store.messages(), before.as_slice());
    }

    #[test]
    fn test_seeded_message_redelivered_live_is_single_entry() {
        let mut store = MessageStore::new(UserId::new("me"));
        store.seed(
            UserId::new("bob"),
            vec![msg("m1", "bob", "me", "a", 1), msg("m2", "me", "bob", "b", 2)],
        );

        assert_eq!(store.ingest(msg("m2", "me", "bob", "b", 2)), IngestOutcome::Duplicate);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_out_of_order_arrival_stays_sorted() {
        let mut store = MessageStore::new(UserId::new("me"));
        store.seed(
            UserId::new("bob"),
            vec![msg("m3", "bob", "me", "c", 30), msg("m1", "bob", "me", "a", 10)],
        );
        store.ingest(msg("m2", "me", "bob", "b", 20));
        store.ingest(msg("m0", "bob", "me", "z", 5));
        store.ingest(msg("m4", "bob", "me", "d", 40));

        assert_sorted(&store);
        let ids: Vec<_> = store
            .messages()
            .iter()
            .map(|m| m.id.clone().unwrap().0)
            .collect();
        assert_eq!(ids, ["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_equal_timestamps_order_by_id() {
        let mut store = store_with_bob();
        store.ingest(msg("b", "bob", "me", "2", 1));
        store.ingest(msg("a", "bob", "me", "1", 1));

        assert_eq!(store.messages()[0].body, "1");
        assert_eq!(store.messages()[1].body, "2");
    }

    #[test]
    fn test_seed_dedups_and_sorts_history() {
        let mut store = MessageStore::new(UserId::new("me"));
        store.seed(
            UserId::new("bob"),
            vec![
                msg("m2", "bob", "me", "b", 2),
                msg("m1", "bob", "me", "a", 1),
                msg("m2", "bob", "me", "b", 2),
            ],
        );
        assert_eq!(store.len(), 2);
        assert_sorted(&store);
    }

    #[test]
    fn test_seed_replaces_wholesale() {
        let mut store = store_with_bob();
        store.seed(UserId::new("bob"), vec![msg("m1", "bob", "me", "old", 1)]);
        store.seed(UserId::new("bob"), vec![msg("m9", "bob", "me", "new", 9)]);

        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].body, "new");
    }

    #[test]
    fn test_seed_keeps_live_messages_missing_from_history() {
        let mut store = store_with_bob();
        store.ingest(msg("live", "bob", "me", "just now", 5));
        store.send_optimistic("unsent", &UserId::new("bob"), at(6));

        store.seed(
            UserId::new("bob"),
            vec![msg("m1", "bob", "me", "old", 1), msg("live", "bob", "me", "just now", 5)],
        );

        let ids: Vec<_> = store.messages().iter().map(|m| m.id.clone()).collect();
        assert_eq!(
            ids,
            vec![Some(MessageId::new("m1")), Some(MessageId::new("live"))]
        );

        // A later seed is authoritative again.
        store.seed(UserId::new("bob"), vec![msg("m9", "bob", "me", "new", 9)]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_seed_for_other_peer_carries_nothing() {
        let mut store = store_with_bob();
        store.ingest(msg("live", "bob", "me", "hi", 5));
        store.seed(UserId::new("carol"), vec![msg("c1", "carol", "me", "yo", 1)]);

        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].id, Some(MessageId::new("c1")));
    }

    #[test]
    fn test_message_for_other_peer_is_inactive() {
        let mut store = store_with_bob();
        assert_eq!(
            store.ingest(msg("m1", "carol", "me", "hey", 1)),
            IngestOutcome::Inactive
        );
        assert!(store.is_empty());

        let mut idle = MessageStore::new(UserId::new("me"));
        assert_eq!(idle.ingest(msg("m1", "bob", "me", "hey", 1)), IngestOutcome::Inactive);
    }

    #[test]
    fn test_optimistic_send_reconciled_by_echo() {
        let mut store = store_with_bob();
        let pending = store.send_optimistic("hello", &UserId::new("bob"), at(100));
        assert!(pending.pending);
        assert_eq!(store.pending().count(), 1);

        let echo = msg("srv1", "me", "bob", "hello", 102);
        assert_eq!(store.ingest(echo.clone()), IngestOutcome::Reconciled);

        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0], echo);
        assert_eq!(store.pending().count(), 0);
    }

    #[test]
    fn test_echo_outside_window_leaves_pending() {
        let mut store = store_with_bob();
        store.send_optimistic("hello", &UserId::new("bob"), at(0));

        let late = msg("srv1", "me", "bob", "hello", 60);
        assert_eq!(store.ingest(late), IngestOutcome::Inserted);

        assert_eq!(store.len(), 2);
        assert_eq!(store.pending().count(), 1);
    }

    #[test]
    fn test_echo_with_client_ref_matches_exactly() {
        let mut store = store_with_bob();
        let first = store.send_optimistic("same", &UserId::new("bob"), at(0));
        let second = store.send_optimistic("same", &UserId::new("bob"), at(1));

        let mut echo = msg("srv2", "me", "bob", "same", 300);
        echo.client_ref = second.client_ref;
        assert_eq!(store.ingest(echo), IngestOutcome::Reconciled);

        let remaining: Vec<_> = store.pending().collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_ref, first.client_ref);
    }

    #[test]
    fn test_conflicting_client_refs_do_not_match() {
        let mut store = store_with_bob();
        store.send_optimistic("same", &UserId::new("bob"), at(0));

        let mut echo = msg("srv1", "me", "bob", "same", 1);
        echo.client_ref = Some(uuid::Uuid::new_v4());
        assert_eq!(store.ingest(echo), IngestOutcome::Inserted);
        assert_eq!(store.pending().count(), 1);
    }

    #[test]
    fn test_optimistic_send_to_other_peer_not_inserted() {
        let mut store = store_with_bob();
        let m = store.send_optimistic("psst", &UserId::new("carol"), at(0));
        assert_eq!(m.receiver_id.as_str(), "carol");
        assert!(store.is_empty());
    }
}
