//! Client configuration.
//!
//! Defaults match a local backend. [`ClientConfig::from_env`] applies
//! `COMPARELY_*` overrides on top of them.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::retry::ReconnectPolicy;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
/// Path of the stream endpoint, relative to the WebSocket base URL.
pub const WEBSOCKET_PATH: &str = "/websocket";

pub const ENV_API_URL: &str = "COMPARELY_API_URL";
pub const ENV_WS_URL: &str = "COMPARELY_WS_URL";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "COMPARELY_WS_MAX_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_BASE_DELAY_MS: &str = "COMPARELY_WS_RECONNECT_BASE_DELAY_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "COMPARELY_WS_CONNECT_TIMEOUT_MS";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// 1008 is the standard policy-violation code; 4001/4003 are the
    /// backend's unauthorized/forbidden codes.
    pub const AUTH_CLOSE_CODES: [u16; 3] = [1008, 4001, 4003];
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url in {name}: {source}")]
    InvalidUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported url scheme `{scheme}` in {name}")]
    UnsupportedScheme { name: &'static str, scheme: String },

    #[error("invalid number in {name}: {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the REST backend.
    pub api_base_url: String,
    /// Explicit WebSocket base URL. Derived from `api_base_url` when unset.
    pub ws_base_url: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    /// Close codes that mean the server rejected the credentials.
    pub auth_close_codes: Vec<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_base_url: None,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            auth_close_codes: StreamDefaults::AUTH_CLOSE_CODES.to_vec(),
        }
    }
}

impl ClientConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(api_url) = read(ENV_API_URL) {
            config.api_base_url = api_url;
        }
        if let Some(ws_url) = read(ENV_WS_URL) {
            config.ws_base_url = Some(ws_url);
        }
        if let Some(raw) = read(ENV_MAX_RECONNECT_ATTEMPTS) {
            config.reconnect.max_attempts = parse_number(ENV_MAX_RECONNECT_ATTEMPTS, &raw)?;
        }
        if let Some(raw) = read(ENV_RECONNECT_BASE_DELAY_MS) {
            config.reconnect.base_delay =
                Duration::from_millis(parse_number(ENV_RECONNECT_BASE_DELAY_MS, &raw)?);
        }
        if let Some(raw) = read(ENV_CONNECT_TIMEOUT_MS) {
            config.connect_timeout =
                Duration::from_millis(parse_number(ENV_CONNECT_TIMEOUT_MS, &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end().to_string();
        self
    }

    pub fn with_ws_base_url(mut self, url: impl Into<String>) -> Self {
        self.ws_base_url = Some(url.into().trim_end().to_string());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Checks that both endpoints resolve to usable URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api_url()?;
        self.stream_url()?;
        Ok(())
    }

    /// REST base URL.
    pub fn api_url(&self) -> Result<Url, ConfigError> {
        let url = parse_url(ENV_API_URL, &self.api_base_url)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme {
                name: ENV_API_URL,
                scheme: other.to_string(),
            }),
        }
    }

    /// Stream endpoint without credentials: `<ws base>/websocket`.
    pub fn stream_url(&self) -> Result<Url, ConfigError> {
        let mut url = match self.ws_base_url.as_deref() {
            Some(raw) => parse_url(ENV_WS_URL, raw)?,
            None => parse_url(ENV_API_URL, &self.api_base_url)?,
        };

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ConfigError::UnsupportedScheme {
                    name: ENV_WS_URL,
                    scheme: other.to_string(),
                })
            }
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(ConfigError::UnsupportedScheme {
                name: ENV_WS_URL,
                scheme: url.scheme().to_string(),
            });
        }

        let path = format!("{}{}", url.path().trim_end_matches('/'), WEBSOCKET_PATH);
        url.set_path(&path);
        url.set_query(None);
        Ok(url)
    }
}

fn parse_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl { name, source })
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: raw.to_string(),
    })
}
