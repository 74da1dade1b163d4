//! Collaborator seams: the request/response backend and session persistence.
//!
//! The core only ever talks to these traits; `parley-net` provides the HTTP
//! implementation and `parley-store` the persistent session store.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::error::{ApiError, SessionError};
use crate::session::Session;
use crate::types::{Identity, Message, Peer, UserId};

#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Create an account. Does not start a session.
    async fn register(&self, name: &str, email: &str, password: &str)
        -> Result<Identity, ApiError>;

    /// Exchange credentials for an identity carrying a bearer token.
    async fn login(&self, email: &str, password: &str) -> Result<Identity, ApiError>;
}

#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Full conversation with `peer`, oldest first.
    async fn get_history(&self, peer: &UserId, token: &str) -> Result<Vec<Message>, ApiError>;

    /// Most recent message per peer.
    ///
    /// The default implementation fetches every history with at most
    /// `fanout` requests in flight and keeps the final entry of each. A peer
    /// whose fetch fails is skipped; an auth failure aborts the whole call.
    async fn last_messages(
        &self,
        peers: &[UserId],
        token: &str,
        fanout: usize,
    ) -> Result<HashMap<UserId, Message>, ApiError> {
        let results: Vec<(UserId, Result<Vec<Message>, ApiError>)> =
            stream::iter(peers.iter().cloned())
                .map(|peer| async move {
                    let history = self.get_history(&peer, token).await;
                    (peer, history)
                })
                .buffer_unordered(fanout.max(1))
                .collect()
                .await;

        let mut last = HashMap::with_capacity(results.len());
        for (peer, result) in results {
            match result {
                Ok(mut history) => {
                    if let Some(msg) = history.pop() {
                        last.insert(peer, msg);
                    }
                }
                Err(ApiError::Auth(e)) => return Err(ApiError::Auth(e)),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Skipping last message for peer");
                }
            }
        }
        Ok(last)
    }
}

#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn list_peers(&self, token: &str) -> Result<Vec<Peer>, ApiError>;

    /// Fails with [`ApiError::NotFound`] for unknown ids.
    async fn get_peer(&self, id: &UserId, token: &str) -> Result<Peer, ApiError>;
}

/// Persistence of the current session between runs.
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> Result<(), SessionError>;

    /// `Ok(None)` when nothing is stored. Invalid blobs are reported as errors.
    fn load(&self) -> Result<Option<Session>, SessionError>;

    fn clear(&self) -> Result<(), SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, NetworkError};
    use chrono::{TimeZone, Utc};

    struct FixedHistory;

    #[async_trait]
    impl HistoryApi for FixedHistory {
        async fn get_history(&self, peer: &UserId, _token: &str) -> Result<Vec<Message>, ApiError> {
            let at = |secs| Utc.timestamp_opt(secs, 0).unwrap();
            match peer.as_str() {
                "a" => Ok(vec![
                    Message::pending("me".into(), "a".into(), "first", at(1)),
                    Message::pending("a".into(), "me".into(), "last", at(2)),
                ]),
                "empty" => Ok(Vec::new()),
                "expired" => Err(AuthError::TokenExpired.into()),
                _ => Err(NetworkError::Request("boom".into()).into()),
            }
        }
    }

    #[tokio::test]
    async fn test_last_messages_takes_final_entry() {
        let peers = vec![UserId::new("a"), UserId::new("empty"), UserId::new("broken")];
        let last = FixedHistory.last_messages(&peers, "tok", 2).await.unwrap();

        assert_eq!(last.len(), 1);
        assert_eq!(last[&UserId::new("a")].body, "last");
    }

    #[tokio::test]
    async fn test_last_messages_aborts_on_auth_failure() {
        let peers = vec![UserId::new("a"), UserId::new("expired")];
        let result = FixedHistory.last_messages(&peers, "tok", 1).await;
        assert_eq!(result, Err(ApiError::Auth(AuthError::TokenExpired)));
    }
}
