pub mod email_channel;
pub mod lifecycle;
pub mod message;
pub mod normalize;
pub mod telegram;
pub mod telegram_user;
pub mod traits;
pub mod webhook;
pub mod whatsapp;
pub mod whatsapp_web;

pub use email_channel::EmailClient;
pub use lifecycle::{Lifecycle, ReconnectPolicy};
pub use message::{
    ConnectionState, ContentType, Direction, MediaReference, OutboundContent, ParsedCommand, Platform, SendOptions,
    SendReceipt, UnifiedMessage,
};
pub use telegram::TelegramBotClient;
pub use telegram_user::{AuthState, MtprotoFactory, MtprotoSession, TelegramUserClient};
pub use traits::{ChannelEvent, EventSink, PlatformClient};
pub use webhook::{WebhookOutcome, WebhookValidation};
pub use whatsapp::WhatsAppBusinessClient;
pub use whatsapp_web::{WebTransportFactory, WhatsAppWebClient, WhatsAppWebTransport};

use std::sync::Arc;

use crate::delivery::OutboundPipeline;
use crate::media::MediaCache;
use crate::status::AccountStatusStore;
use normalize::InboundGate;

/// Shared wiring a client is built from: where it reports, how it sends,
/// and which senders it admits.
#[derive(Clone)]
pub struct ClientContext {
    pub account_id: String,
    pub allowed_senders: Vec<String>,
    pub policy: ReconnectPolicy,
    pub events: EventSink,
    pub store: Arc<dyn AccountStatusStore>,
    pub pipeline: Arc<OutboundPipeline>,
    pub media: Option<Arc<MediaCache>>,
}

impl ClientContext {
    pub fn new(
        account_id: impl Into<String>,
        policy: ReconnectPolicy,
        events: EventSink,
        store: Arc<dyn AccountStatusStore>,
        pipeline: Arc<OutboundPipeline>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            allowed_senders: Vec::new(),
            policy,
            events,
            store,
            pipeline,
            media: None,
        }
    }

    pub fn with_allowed_senders(mut self, allowed: Vec<String>) -> Self {
        self.allowed_senders = allowed;
        self
    }

    pub fn with_media(mut self, media: Option<Arc<MediaCache>>) -> Self {
        self.media = media;
        self
    }

    pub(crate) fn lifecycle(&self, platform: Platform) -> Arc<Lifecycle> {
        Lifecycle::new(
            self.account_id.clone(),
            platform,
            self.policy,
            self.events.clone(),
            Arc::clone(&self.store),
        )
    }

    pub(crate) fn gate(&self) -> InboundGate {
        InboundGate::new(self.allowed_senders.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{ChannelEvent, ClientContext, EventSink, ReconnectPolicy};
    use crate::delivery::{CircuitConfig, OutboundPipeline, Quota, RateLimitConfig};
    use crate::status::InMemoryStatusStore;

    /// Context with a fast reconnect policy and quotas tests never hit.
    pub fn context(account_id: &str, allowed: Vec<String>) -> (ClientContext, mpsc::Receiver<ChannelEvent>) {
        let (events, rx) = EventSink::channel(64);
        let pipeline = OutboundPipeline::new(
            RateLimitConfig {
                per_recipient: Quota::per_minute(1000),
                per_account: Quota::per_minute(1000),
            },
            CircuitConfig::default(),
        );
        let ctx = ClientContext::new(
            account_id,
            ReconnectPolicy::fixed(3, Duration::from_secs(1)),
            events,
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(pipeline),
        )
        .with_allowed_senders(allowed);
        (ctx, rx)
    }
}
