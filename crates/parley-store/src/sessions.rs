//! Session persistence: the SQLite-backed store used by the binary and an
//! in-memory store for tests and ephemeral runs.

use std::sync::Mutex;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use parley_shared::constants::SESSION_VERSION;
use parley_shared::observe::lock;
use parley_shared::{Session, SessionError, SessionStore};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Replace the stored session.
    pub fn save_session(&self, session: &Session) -> Result<()> {
        let payload = serde_json::to_string(session)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO sessions (id, version, payload, saved_at)
             VALUES (1, ?1, ?2, ?3)",
            params![session.version, payload, session.saved_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Raw `(version, payload)` of the stored session, if any.
    pub fn load_session_payload(&self) -> Result<Option<(u32, String)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT version, payload FROM sessions WHERE id = 1",
                [],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Delete the stored session. Returns whether one existed.
    pub fn clear_session(&self) -> Result<bool> {
        let affected = self.conn().execute("DELETE FROM sessions WHERE id = 1", [])?;
        Ok(affected > 0)
    }
}

/// [`SessionStore`] persisted in the local SQLite database.
pub struct SqliteSessionStore {
    db: Mutex<Database>,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, session: &Session) -> std::result::Result<(), SessionError> {
        session.validate()?;
        lock(&self.db)
            .save_session(session)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        debug!(user = %session.identity.id, "Session saved");
        Ok(())
    }

    fn load(&self) -> std::result::Result<Option<Session>, SessionError> {
        let db = lock(&self.db);
        let Some((version, payload)) = db
            .load_session_payload()
            .map_err(|e| SessionError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };

        let parsed = if version != SESSION_VERSION {
            Err(SessionError::UnsupportedVersion {
                found: version,
                expected: SESSION_VERSION,
            })
        } else {
            Session::from_json(&payload)
        };

        match parsed {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "Discarding invalid stored session");
                if let Err(clear_err) = db.clear_session() {
                    warn!(error = %clear_err, "Failed to clear invalid session");
                }
                Err(e)
            }
        }
    }

    fn clear(&self) -> std::result::Result<(), SessionError> {
        lock(&self.db)
            .clear_session()
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// [`SessionStore`] that keeps the serialized blob in memory.
///
/// Blobs go through the same JSON encoding and validation as the SQLite
/// store.
#[derive(Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw blob as-is, bypassing validation.
    pub fn put_raw(&self, blob: impl Into<String>) {
        *lock(&self.slot) = Some(blob.into());
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slot).is_none()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &Session) -> std::result::Result<(), SessionError> {
        session.validate()?;
        *lock(&self.slot) = Some(session.to_json()?);
        Ok(())
    }

    fn load(&self) -> std::result::Result<Option<Session>, SessionError> {
        let mut slot = lock(&self.slot);
        let Some(blob) = slot.as_deref() else {
            return Ok(None);
        };
        match Session::from_json(blob) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }

    fn clear(&self) -> std::result::Result<(), SessionError> {
        *lock(&self.slot) = None;
        Ok(())
    }
}
