//! Realtime stream modules.
//!
//! - `client`: reconnecting websocket client, outbound queue and subscribers.
//! - `proto`: the tagged message type and close-code handling.
//! - `notify`: user-facing notices emitted by the connection worker.

/// Websocket connection worker and client handle.
pub mod client;
/// Notices and notifier implementations.
pub mod notify;
/// Stream protocol messages.
pub mod proto;

pub use client::{ConnectionState, StreamClientError, Subscription, WebSocketClient};
pub use notify::{ChannelNotifier, LogNotifier, Notice, Notifier};
pub use proto::Message;
