//! Client SDK for the Comparely shopping-comparison backend.
//!
//! The crate is organized by transport surface:
//! - `stream`: reconnecting websocket client for live assistant and
//!   notification events.
//! - `auth`: session credentials and the REST login flow.
//! - `config`: endpoints, reconnect policy and environment overrides.
//! - `retry`: shared backoff and timeout utilities.

/// Session credentials, session stores and the login client.
pub mod auth;
/// Client configuration.
pub mod config;
/// Backoff and retry helpers used across the SDK.
pub mod retry;
/// Realtime stream client, protocol types and notices.
pub mod stream;

pub use auth::{AuthApiClient, AuthError, Credentials, MemorySessionStore, SessionStore};
pub use config::{ClientConfig, ConfigError};
pub use stream::{ConnectionState, Message, Notice, WebSocketClient};
