use async_trait::async_trait;
use tokio::sync::mpsc;

use super::message::{ConnectionState, OutboundContent, Platform, SendOptions, SendReceipt, UnifiedMessage};
use super::telegram_user::AuthState;
use crate::error::{ChannelError, SendError};

/// Everything a client reports to the dispatcher.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(UnifiedMessage),
    StatusChange {
        account_id: String,
        old: ConnectionState,
        new: ConnectionState,
    },
    Error {
        account_id: String,
        detail: String,
    },
    /// Interactive auth progress (Telegram user accounts only).
    Auth {
        account_id: String,
        state: AuthState,
        detail: Option<String>,
    },
}

/// Observer handed to every client; replaces per-client event emitters.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChannelEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ChannelEvent>) -> Self {
        Self { tx }
    }

    /// Convenience for tests and embedders.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Deliver an event. A dropped receiver means the bridge is shutting
    /// down, so the event is discarded with a debug log.
    pub async fn emit(&self, event: ChannelEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("event sink closed; dropping channel event");
        }
    }

    pub async fn message(&self, message: UnifiedMessage) {
        self.emit(ChannelEvent::Message(message)).await;
    }

    pub async fn error(&self, account_id: &str, detail: impl Into<String>) {
        self.emit(ChannelEvent::Error {
            account_id: account_id.to_string(),
            detail: detail.into(),
        })
        .await;
    }
}

/// Capability contract every platform variant implements.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn account_id(&self) -> &str;

    fn platform(&self) -> Platform;

    /// Open the transport. Calling this while already connecting or connected
    /// returns the current state without opening a second transport.
    async fn connect(&self) -> Result<ConnectionState, ChannelError>;

    /// Tear down the transport, cancelling every timer, loop and keep-alive.
    /// Safe from any state.
    async fn disconnect(&self);

    async fn send(
        &self,
        recipient: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> Result<SendReceipt, SendError>;

    fn status(&self) -> ConnectionState;

    /// Feed an externally supplied auth value (phone, code, password).
    /// Only interactive-auth transports accept this.
    fn provide_auth_input(&self, _value: &str) -> Result<(), ChannelError> {
        Err(ChannelError::Config(format!(
            "{} accounts do not take interactive auth input",
            self.platform()
        )))
    }
}
