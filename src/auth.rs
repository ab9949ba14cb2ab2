//! Session credentials and the REST login flow.
//!
//! The stream client never talks to the login endpoint itself; it reads
//! whatever [`SessionStore`] the host application hands it at connection time.

use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ClientConfig, ConfigError};
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const LOGIN_PATH: &str = "/auth/login";
pub const DEFAULT_TOKEN_TYPE: &str = "bearer";

/// Bearer-style credentials issued by the backend.
#[derive(Clone)]
pub struct Credentials {
    pub access_token: SecretString,
    pub token_type: String,
}

impl Credentials {
    pub fn new(access_token: SecretString, token_type: impl Into<String>) -> Self {
        Self {
            access_token,
            token_type: token_type.into(),
        }
    }

    pub fn bearer(access_token: SecretString) -> Self {
        Self::new(access_token, DEFAULT_TOKEN_TYPE)
    }

    /// `"<token_type> <token>"`, the value carried in the stream `token`
    /// query parameter.
    pub fn token_param(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.expose_secret())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Where the host application keeps the current session.
pub trait SessionStore: Send + Sync + 'static {
    fn credentials(&self) -> Option<Credentials>;
    fn store(&self, credentials: Credentials);
    fn clear(&self);
}

/// In-process session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: RwLock<Option<Credentials>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(Some(credentials)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn credentials(&self) -> Option<Credentials> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }

    fn store(&self, credentials: Credentials) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(credentials);
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = None;
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthApiDefaults;

impl AuthApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct AuthApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for AuthApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: AuthApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: AuthApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::interactive(),
        }
    }
}

/// Client for the backend's login endpoint.
#[derive(Clone)]
pub struct AuthApiClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl AuthApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, AuthError> {
        Self::with_options(config, AuthApiClientOptions::default())
    }

    pub fn with_options(
        config: &ClientConfig,
        options: AuthApiClientOptions,
    ) -> Result<Self, AuthError> {
        let base_url = config.api_url()?.as_str().trim_end_matches('/').to_string();
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(AuthError::Transport)?;

        Ok(Self {
            http,
            base_url,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Exchanges email and password for session credentials.
    pub async fn login(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Credentials, AuthError> {
        let endpoint = self.endpoint(LOGIN_PATH);
        let request = LoginRequest {
            email,
            password: password.expose_secret(),
        };

        let response: LoginResponse = retry_async(
            &self.retry_policy,
            |_| self.post_attempt(&endpoint, &request),
            AuthError::is_retryable,
        )
        .await?;

        let token_type = response
            .token_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());
        Ok(Credentials::new(
            SecretString::new(response.access_token),
            token_type,
        ))
    }

    /// Logs in and persists the credentials into `store`.
    pub async fn login_into(
        &self,
        store: &dyn SessionStore,
        email: &str,
        password: &SecretString,
    ) -> Result<(), AuthError> {
        let credentials = self.login(email, password).await?;
        store.store(credentials);
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_attempt<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<LoginResponse, AuthError> {
        let response = self
            .http
            .post(endpoint)
            .timeout(self.attempt_timeout)
            .json(body)
            .send()
            .await
            .map_err(AuthError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(AuthError::Transport)?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::Rejected {
                detail: summarize_error_body(&text),
            });
        }
        if !status.is_success() {
            return Err(AuthError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        serde_json::from_str(&text).map_err(|err| AuthError::Parse(err.to_string()))
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("credentials rejected: {detail}")]
    Rejected { detail: String },

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Config(_) | Self::Rejected { .. } | Self::Parse(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let detail = parsed.detail.map(|value| match value {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        });
        if let Some(message) = detail.or(parsed.message).or(parsed.error) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use secrecy::SecretString;

    use super::{
        summarize_error_body, AuthError, Credentials, MemorySessionStore, SessionStore,
    };

    #[test]
    fn token_param_joins_type_and_token() {
        let credentials = Credentials::bearer(SecretString::new("abc123".to_string()));
        assert_eq!(credentials.token_param(), "bearer abc123");
    }

    #[test]
    fn debug_output_redacts_token() {
        let credentials = Credentials::bearer(SecretString::new("very-secret".to_string()));
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySessionStore::new();
        assert!(store.credentials().is_none());

        store.store(Credentials::new(SecretString::new("t".to_string()), "Bearer"));
        assert_eq!(
            store.credentials().map(|c| c.token_param()),
            Some("Bearer t".to_string())
        );

        store.clear();
        assert!(store.credentials().is_none());
    }

    #[test]
    fn fastapi_detail_is_extracted() {
        assert_eq!(
            summarize_error_body(r#"{"detail":"Incorrect email or password"}"#),
            "Incorrect email or password"
        );
    }

    #[test]
    fn plain_body_is_truncated() {
        let body = "x".repeat(500);
        assert_eq!(summarize_error_body(&body).len(), 220);
    }

    #[test]
    fn retry_classification() {
        let server = AuthError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        let throttled = AuthError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let rejected = AuthError::Rejected {
            detail: "nope".to_string(),
        };
        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!rejected.is_retryable());
    }
}
