//! Versioned session value persisted between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SESSION_VERSION;
use crate::error::SessionError;
use crate::types::{Identity, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub version: u32,
    pub identity: Identity,
    /// Conversation that was open when the session was last saved.
    #[serde(default)]
    pub active_peer: Option<UserId>,
    pub saved_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        Self {
            version: SESSION_VERSION,
            identity,
            active_peer: None,
            saved_at: Utc::now(),
        }
    }

    pub fn with_active_peer(mut self, peer: Option<UserId>) -> Self {
        self.active_peer = peer;
        self.saved_at = Utc::now();
        self
    }

    /// Reject blobs written by another schema version or missing credentials.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.version != SESSION_VERSION {
            return Err(SessionError::UnsupportedVersion {
                found: self.version,
                expected: SESSION_VERSION,
            });
        }
        if self.identity.id.is_empty() {
            return Err(SessionError::Invalid("empty user id".into()));
        }
        if self.identity.token.trim().is_empty() {
            return Err(SessionError::Invalid("empty auth token".into()));
        }
        if matches!(&self.active_peer, Some(peer) if peer.is_empty()) {
            return Err(SessionError::Invalid("empty active peer id".into()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    /// Parse and validate a persisted blob.
    pub fn from_json(data: &str) -> Result<Self, SessionError> {
        let session: Session =
            serde_json::from_str(data).map_err(|e| SessionError::Serialization(e.to_string()))?;
        session.validate()?;
        Ok(session)
    }
}
