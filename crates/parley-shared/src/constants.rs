/// Version stamped on every persisted session blob
pub const SESSION_VERSION: u32 = 1;

/// Quiet interval after the last keystroke before "stopTyping" is sent
pub const STOP_TYPING_DELAY_MS: u64 = 1_000;

/// Window within which a stream echo may reconcile a pending message
pub const RECONCILE_WINDOW_SECS: i64 = 10;

/// Concurrent history fetches while populating the last-message cache
pub const HISTORY_FANOUT: usize = 4;

/// Push channel reconnect backoff
pub const RECONNECT_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const RECONNECT_BACKOFF_MAX_MS: u64 = 30_000;

/// Capacity of the command and notification channels of the push channel task
pub const CHANNEL_CAPACITY: usize = 256;

/// Default REST endpoint of the backend
pub const DEFAULT_API_URL: &str = "http://localhost:5000";

/// Path of the push channel endpoint, relative to the backend host
pub const SOCKET_PATH: &str = "/ws";
