//! REST client for the backend: auth, directory and history endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use parley_shared::{
    ApiError, AuthApi, AuthError, DirectoryApi, HistoryApi, Identity, Message, NetworkError, Peer,
    UserId, WireMessage,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum HttpSetupError {
    #[error("Invalid base url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Base url cannot carry a path: {0}")]
    CannotBeABase(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// A user as returned by `/users`.
#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(rename = "_id")]
    id: UserId,
    name: String,
    #[serde(default)]
    email: Option<String>,
}

impl From<WireUser> for Peer {
    fn from(user: WireUser) -> Self {
        Peer {
            id: user.id,
            display_name: user.name,
            email: user.email,
        }
    }
}

/// Body of the login and register responses.
#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "_id")]
    id: UserId,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

impl From<AuthResponse> for Identity {
    fn from(res: AuthResponse) -> Self {
        Identity {
            id: res.id,
            display_name: res.name,
            email: res.email,
            token: res.token.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Which auth failure a 401/403 means for a given endpoint.
#[derive(Clone, Copy)]
enum AuthContext {
    Credentials,
    Token,
}

/// `reqwest` implementation of every request/response collaborator.
pub struct HttpApi {
    client: Client,
    base: Url,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self, HttpSetupError> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(HttpSetupError::CannotBeABase(base_url.to_string()));
        }
        let client = Client::builder()
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Base url with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: AuthContext,
    ) -> Result<T, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| NetworkError::Request(e.to_string()))?;
        let response = check_status(response, context).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| NetworkError::Decode(e.to_string()).into())
    }
}

async fn check_status(response: Response, context: AuthContext) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    debug!(status = status.as_u16(), url = %url, message = %message, "Request failed");

    Err(map_status(status, message, context))
}

fn map_status(status: StatusCode, message: String, context: AuthContext) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => match context {
            AuthContext::Credentials => AuthError::InvalidCredentials.into(),
            AuthContext::Token => AuthError::TokenExpired.into(),
        },
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT
            if matches!(context, AuthContext::Credentials) =>
        {
            AuthError::Rejected(message).into()
        }
        _ => NetworkError::Status {
            status: status.as_u16(),
            message,
        }
        .into(),
    }
}

#[async_trait]
impl AuthApi for HttpApi {
    async fn register(&self, name: &str, email: &str, password: &str) -> Result<Identity, ApiError> {
        let request = self
            .client
            .post(self.endpoint(&["api", "auth", "register"]))
            .json(&RegisterRequest {
                name,
                email,
                password,
            });
        let res: AuthResponse = self.send(request, AuthContext::Credentials).await?;
        Ok(res.into())
    }

    async fn login(&self, email: &str, password: &str) -> Result<Identity, ApiError> {
        let request = self
            .client
            .post(self.endpoint(&["api", "auth", "login"]))
            .json(&LoginRequest { email, password });
        let res: AuthResponse = self.send(request, AuthContext::Credentials).await?;
        if res.token.as_deref().map_or(true, str::is_empty) {
            return Err(NetworkError::Decode("login response carries no token".into()).into());
        }
        Ok(res.into())
    }
}

#[async_trait]
impl DirectoryApi for HttpApi {
    async fn list_peers(&self, token: &str) -> Result<Vec<Peer>, ApiError> {
        let request = self.client.get(self.endpoint(&["users"])).bearer_auth(token);
        let users: Vec<WireUser> = self.send(request, AuthContext::Token).await?;
        Ok(users.into_iter().map(Peer::from).collect())
    }

    async fn get_peer(&self, id: &UserId, token: &str) -> Result<Peer, ApiError> {
        let request = self
            .client
            .get(self.endpoint(&["users", id.as_str()]))
            .bearer_auth(token);
        let user: WireUser = self.send(request, AuthContext::Token).await?;
        Ok(user.into())
    }
}

#[async_trait]
impl HistoryApi for HttpApi {
    async fn get_history(&self, peer: &UserId, token: &str) -> Result<Vec<Message>, ApiError> {
        let request = self
            .client
            .get(self.endpoint(&["api", "messages", peer.as_str()]))
            .bearer_auth(token);
        let history: Vec<WireMessage> = self.send(request, AuthContext::Token).await?;
        Ok(history.into_iter().map(Message::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_segments() {
        let api = HttpApi::new("http://localhost:5000").unwrap();
        assert_eq!(
            api.endpoint(&["api", "messages", "65a1"]).as_str(),
            "http://localhost:5000/api/messages/65a1"
        );

        let prefixed = HttpApi::new("https://chat.example.com/backend/").unwrap();
        assert_eq!(
            prefixed.endpoint(&["users"]).as_str(),
            "https://chat.example.com/backend/users"
        );
    }

    #[test]
    fn test_endpoint_escapes_ids() {
        let api = HttpApi::new("http://localhost:5000").unwrap();
        assert_eq!(
            api.endpoint(&["users", "a/b"]).as_str(),
            "http://localhost:5000/users/a%2Fb"
        );
    }

    #[test]
    fn test_rejects_bad_base() {
        assert!(HttpApi::new("not a url").is_err());
        assert!(HttpApi::new("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_status_mapping() {
        let auth = map_status(StatusCode::UNAUTHORIZED, String::new(), AuthContext::Token);
        assert_eq!(auth, ApiError::Auth(AuthError::TokenExpired));

        let login = map_status(StatusCode::UNAUTHORIZED, String::new(), AuthContext::Credentials);
        assert_eq!(login, ApiError::Auth(AuthError::InvalidCredentials));

        let missing = map_status(StatusCode::NOT_FOUND, "User not found".into(), AuthContext::Token);
        assert_eq!(missing, ApiError::NotFound("User not found".into()));

        let taken = map_status(StatusCode::BAD_REQUEST, "Email taken".into(), AuthContext::Credentials);
        assert_eq!(taken, ApiError::Auth(AuthError::Rejected("Email taken".into())));

        let down = map_status(StatusCode::BAD_GATEWAY, "down".into(), AuthContext::Token);
        assert!(matches!(
            down,
            ApiError::Network(NetworkError::Status { status: 502, .. })
        ));
    }

    #[test]
    fn test_decode_backend_shapes() {
        let users: Vec<WireUser> =
            serde_json::from_str(r#"[{"_id":"u1","name":"Ada","email":"ada@x.io"},{"_id":"u2","name":"Bo"}]"#)
                .unwrap();
        let peers: Vec<Peer> = users.into_iter().map(Peer::from).collect();
        assert_eq!(peers[0].email.as_deref(), Some("ada@x.io"));
        assert_eq!(peers[1].display_name, "Bo");

        let login: AuthResponse =
            serde_json::from_str(r#"{"_id":"u1","name":"Ada","email":"ada@x.io","token":"t"}"#)
                .unwrap();
        let identity = Identity::from(login);
        assert_eq!(identity.token, "t");
        assert_eq!(identity.id, UserId::new("u1"));
    }
}
