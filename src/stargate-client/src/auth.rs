//! Token exchange against the gateway's table-based auth endpoint.

use std::fmt;
use std::time::Duration;

use harness::BootstrapError;
use serde::{Deserialize, Serialize};
use tonic::metadata::{AsciiMetadataValue, errors::InvalidMetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// Metadata key carrying the auth token on every gRPC call.
pub const TOKEN_HEADER: &str = "x-cassandra-token";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("cassandra", "cassandra")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque token issued by the auth endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Auth endpoint {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("Credentials rejected by {url} with status {status}")]
    Rejected { url: String, status: u16 },
    #[error("Auth endpoint {url} answered with status {status}")]
    Unavailable { url: String, status: u16 },
    #[error("Malformed auth response from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("Failed to build auth client: {0}")]
    Client(String),
}

impl AuthError {
    /// Whether a later attempt may succeed without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::Unreachable { .. } | AuthError::Unavailable { .. } | AuthError::Malformed { .. }
        )
    }

    fn from_status(url: &str, status: u16) -> Self {
        match status {
            // The route may not be registered yet while the gateway boots.
            404 | 408 | 429 => AuthError::Unavailable {
                url: url.to_string(),
                status,
            },
            400..=499 => AuthError::Rejected {
                url: url.to_string(),
                status,
            },
            _ => AuthError::Unavailable {
                url: url.to_string(),
                status,
            },
        }
    }
}

impl From<AuthError> for BootstrapError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Rejected { .. } => BootstrapError::Unauthorized(err.to_string()),
            AuthError::Client(reason) => BootstrapError::InvalidTarget(reason),
            AuthError::Unreachable { url, reason } => BootstrapError::Connect { address: url, reason },
            AuthError::Unavailable { ref url, .. } | AuthError::Malformed { ref url, .. } => {
                BootstrapError::Protocol {
                    address: url.clone(),
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    auth_token: String,
}

/// Exchanges a username and password for a token at `POST /v1/auth`.
#[derive(Debug, Clone)]
pub struct TableAuthProvider {
    url: String,
    credentials: Credentials,
    http: reqwest::Client,
}

impl TableAuthProvider {
    pub fn new(url: impl Into<String>, credentials: Credentials, timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Client(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            credentials,
            http,
        })
    }

    /// Provider for the auth service published at `address` (`host:port`).
    pub fn for_address(address: &str, credentials: Credentials, timeout: Duration) -> Result<Self, AuthError> {
        Self::new(format!("http://{address}/v1/auth"), credentials, timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch_token(&self) -> Result<AuthToken, AuthError> {
        tracing::debug!(url = %self.url, username = %self.credentials.username, "requesting auth token");

        let response = self
            .http
            .post(&self.url)
            .json(&AuthRequest {
                username: &self.credentials.username,
                password: &self.credentials.password,
            })
            .send()
            .await
            .map_err(|e| AuthError::Unreachable {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::from_status(&self.url, status.as_u16()));
        }

        let body: AuthResponse = response.json().await.map_err(|e| AuthError::Malformed {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if body.auth_token.is_empty() {
            return Err(AuthError::Malformed {
                url: self.url.clone(),
                reason: "empty authToken".to_string(),
            });
        }

        Ok(AuthToken(body.auth_token))
    }
}

/// Adds the auth token to the metadata of every outgoing request.
#[derive(Clone)]
pub struct TokenInterceptor {
    token: AsciiMetadataValue,
}

impl TokenInterceptor {
    pub fn new(token: &AuthToken) -> Result<Self, InvalidMetadataValue> {
        let mut token = AsciiMetadataValue::try_from(token.as_str())?;
        token.set_sensitive(true);
        Ok(Self { token })
    }
}

impl Interceptor for TokenInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request.metadata_mut().insert(TOKEN_HEADER, self.token.clone());
        Ok(request)
    }
}
