use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Bad credentials or an expired token. Forces a new login.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Session token expired or revoked")]
    TokenExpired,

    #[error("Rejected by server: {0}")]
    Rejected(String),
}

/// Failure of a request/response call (history, directory).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

/// Failure of the push channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable")]
    Unavailable,

    #[error("Handshake rejected: token invalid or expired")]
    Unauthorized,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Outbound queue full")]
    Backpressure,

    #[error("Connection closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unsupported session version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Invalid session: {0}")]
    Invalid(String),

    #[error("Session serialization error: {0}")]
    Serialization(String),

    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Error returned by the REST collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth(_))
    }
}

impl From<ApiError> for ParleyError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Auth(e) => ParleyError::Auth(e),
            ApiError::Network(e) => ParleyError::Network(e),
            ApiError::NotFound(what) => ParleyError::NotFound(what),
        }
    }
}
