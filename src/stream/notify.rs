//! User-facing connection notices.
//!
//! Lifecycle problems never surface as errors from `send_message`; the worker
//! reports them here and the host application decides how to render them.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// The connection dropped or could not be established. Reported once per
    /// outage.
    ConnectionIssue { detail: String },
    /// An automatic retry is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic reconnects stopped; the user should reload.
    ReconnectExhausted { attempts: u32 },
    /// The server rejected the session; the user must log in again.
    ReauthenticationRequired,
    /// The client stopped with `count` messages still waiting for a
    /// connection; they were not delivered.
    MessagesDiscarded { count: usize },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::ConnectionIssue { .. } => {
                write!(f, "Connection issue. Trying to reconnect...")
            }
            Notice::Reconnecting { delay, .. } => {
                write!(f, "Reconnecting in {:.1}s", delay.as_secs_f64())
            }
            Notice::ReconnectExhausted { .. } => {
                write!(f, "Unable to reconnect. Please refresh the page.")
            }
            Notice::ReauthenticationRequired => {
                write!(f, "Your session has expired. Please log in again.")
            }
            Notice::MessagesDiscarded { count: 1 } => {
                write!(f, "1 message could not be delivered.")
            }
            Notice::MessagesDiscarded { count } => {
                write!(f, "{count} messages could not be delivered.")
            }
        }
    }
}

/// Sink for [`Notice`]s. Called from the connection worker; must not block.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notice: Notice);
}

impl<F> Notifier for F
where
    F: Fn(Notice) + Send + Sync + 'static,
{
    fn notify(&self, notice: Notice) {
        self(notice)
    }
}

/// Writes notices to the `tracing` log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match &notice {
            Notice::ConnectionIssue { detail } => {
                warn!(event = "stream_connection_issue", %detail, "{notice}");
            }
            Notice::Reconnecting { attempt, delay } => {
                debug!(
                    event = "stream_reconnect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
            }
            Notice::ReconnectExhausted { attempts } => {
                error!(event = "stream_reconnect_exhausted", attempts, "{notice}");
            }
            Notice::ReauthenticationRequired => {
                warn!(event = "stream_auth_rejected", "{notice}");
            }
            Notice::MessagesDiscarded { count } => {
                warn!(event = "stream_messages_discarded", count, "{notice}");
            }
        }
    }
}

/// Forwards notices into an unbounded channel, for UIs that poll.
#[derive(Clone, Debug)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }
}
