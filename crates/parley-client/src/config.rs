//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client starts against a local backend
//! with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use url::Url;

use parley_shared::constants::{
    DEFAULT_API_URL, HISTORY_FANOUT, RECONCILE_WINDOW_SECS, RECONNECT_BACKOFF_INITIAL_MS,
    RECONNECT_BACKOFF_MAX_MS, SOCKET_PATH, STOP_TYPING_DELAY_MS,
};

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// REST endpoint of the backend.
    /// Env: `PARLEY_API_URL`
    /// Default: `http://localhost:5000`
    pub api_url: String,

    /// Push channel endpoint.
    /// Env: `PARLEY_SOCKET_URL`
    /// Default: the API host with a `ws`/`wss` scheme and `/ws` path.
    pub socket_url: String,

    /// SQLite file holding the saved session.
    /// Env: `PARLEY_SESSION_DB`
    /// Default: `None` (platform data directory).
    pub session_db: Option<PathBuf>,

    /// Quiet interval before `stopTyping` is sent.
    /// Env: `PARLEY_TYPING_DELAY_MS`
    pub typing_delay: Duration,

    /// How far apart a pending message and its echo may be stamped.
    /// Env: `PARLEY_RECONCILE_WINDOW_SECS`
    pub reconcile_window: Duration,

    /// Revert a remote "typing" that is never followed by "stopTyping".
    /// Env: `PARLEY_REMOTE_TYPING_EXPIRY_MS`
    /// Default: off.
    pub remote_typing_expiry: Option<Duration>,

    /// Concurrent history fetches while populating last messages.
    /// Env: `PARLEY_HISTORY_FANOUT`
    pub history_fanout: usize,

    /// Env: `PARLEY_BACKOFF_INITIAL_MS`
    pub backoff_initial: Duration,

    /// Env: `PARLEY_BACKOFF_MAX_MS`
    pub backoff_max: Duration,

    // -- Headless login --
    /// Env: `PARLEY_EMAIL`
    pub email: Option<String>,

    /// Env: `PARLEY_PASSWORD`
    pub password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: derive_socket_url(DEFAULT_API_URL),
            session_db: None,
            typing_delay: Duration::from_millis(STOP_TYPING_DELAY_MS),
            reconcile_window: Duration::from_secs(RECONCILE_WINDOW_SECS as u64),
            remote_typing_expiry: None,
            history_fanout: HISTORY_FANOUT,
            backoff_initial: Duration::from_millis(RECONNECT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(RECONNECT_BACKOFF_MAX_MS),
            email: None,
            password: None,
        }
    }
}

// Keep the password out of logs.
impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field("socket_url", &self.socket_url)
            .field("session_db", &self.session_db)
            .field("typing_delay", &self.typing_delay)
            .field("reconcile_window", &self.reconcile_window)
            .field("remote_typing_expiry", &self.remote_typing_expiry)
            .field("history_fanout", &self.history_fanout)
            .field("backoff_initial", &self.backoff_initial)
            .field("backoff_max", &self.backoff_max)
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_API_URL") {
            if Url::parse(&url).is_ok() {
                config.api_url = url;
            } else {
                warn!(value = %url, "Invalid PARLEY_API_URL, using default");
            }
        }

        config.socket_url = match lookup("PARLEY_SOCKET_URL") {
            Some(url) if Url::parse(&url).is_ok() => url,
            Some(url) => {
                warn!(value = %url, "Invalid PARLEY_SOCKET_URL, deriving from API url");
                derive_socket_url(&config.api_url)
            }
            None => derive_socket_url(&config.api_url),
        };

        if let Some(path) = lookup("PARLEY_SESSION_DB") {
            if !path.is_empty() {
                config.session_db = Some(PathBuf::from(path));
            }
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_TYPING_DELAY_MS") {
            config.typing_delay = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "PARLEY_RECONCILE_WINDOW_SECS") {
            config.reconcile_window = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_REMOTE_TYPING_EXPIRY_MS") {
            config.remote_typing_expiry = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_HISTORY_FANOUT") {
            if n > 0 {
                config.history_fanout = n;
            } else {
                warn!("PARLEY_HISTORY_FANOUT must be positive, using default");
            }
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_BACKOFF_INITIAL_MS") {
            config.backoff_initial = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_BACKOFF_MAX_MS") {
            config.backoff_max = Duration::from_millis(ms);
        }
        if config.backoff_max < config.backoff_initial {
            warn!("PARLEY_BACKOFF_MAX_MS below initial backoff, clamping");
            config.backoff_max = config.backoff_initial;
        }

        config.email = lookup("PARLEY_EMAIL").filter(|s| !s.is_empty());
        config.password = lookup("PARLEY_PASSWORD").filter(|s| !s.is_empty());

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Unparsable value, using default");
            None
        }
    }
}

/// Push channel url for a backend: same host, `ws`/`wss` scheme, `/ws` path.
pub fn derive_socket_url(api_url: &str) -> String {
    let Ok(mut url) = Url::parse(api_url) else {
        return format!("ws://localhost:5000{SOCKET_PATH}");
    };
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    if url.set_scheme(scheme).is_err() {
        return format!("ws://localhost:5000{SOCKET_PATH}");
    }
    url.set_path(SOCKET_PATH);
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}
