//! WhatsApp Web (multi-device) client.
//!
//! The protocol driver (QR pairing, Signal sessions, the websocket) lives
//! behind [`WhatsAppWebTransport`] and is supplied by the embedding
//! application. This module owns everything above it: pairing progress,
//! normalization, keep-alive and reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::lifecycle::{ConnectTicket, Connector, KeepAliveMode, Lifecycle, LoopExit, OpenOutcome};
use super::message::{
    ConnectionState, ContentType, MediaReference, OutboundContent, Platform, SendOptions, SendReceipt,
    UnifiedMessage,
};
use super::normalize::{infer_group, resolve_sender_name, ContentProbe, InboundGate};
use super::traits::PlatformClient;
use super::ClientContext;
use crate::config::WhatsAppWebConfig;
use crate::delivery::{FloodWaitPolicy, OutboundPipeline, SendRequest};
use crate::error::{AuthFailure, ChannelError, SendError};
use crate::media::{HttpMediaFetcher, MediaCache, MediaFetcher};
use crate::status::ConnectionMetadata;

/// A message as the driver reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebMessage {
    pub id: String,
    /// `…@c.us` for direct chats, `…@g.us` for groups.
    pub chat_id: String,
    /// Author JID; equals `chat_id` in direct chats.
    pub sender_id: String,
    /// Saved contact name, if the address book has one.
    pub contact_name: Option<String>,
    /// Name the sender set on their own profile.
    pub push_name: Option<String>,
    /// Driver message type (`chat`, `image`, `ptt`, `vcard`, …).
    pub kind: String,
    pub body: Option<String>,
    pub caption: Option<String>,
    pub from_me: bool,
    /// Native group flag; unreliable on some driver versions.
    pub is_group: Option<bool>,
    pub timestamp: i64,
    pub media: Option<MediaReference>,
}

#[derive(Debug, Clone)]
pub enum WebEvent {
    /// A pairing code to render as QR.
    Qr(String),
    Authenticated,
    Ready { phone: Option<String> },
    Message(WebMessage),
    AuthFailure(String),
    Disconnected(String),
}

/// Protocol driver for one WhatsApp Web session.
#[async_trait]
pub trait WhatsAppWebTransport: Send + Sync {
    /// Start (or resume) the named session. Events arrive on the returned
    /// channel until the session ends.
    async fn start(&self, session_name: &str) -> Result<mpsc::Receiver<WebEvent>, ChannelError>;

    /// Returns the platform message id.
    async fn send(
        &self,
        chat_id: &str,
        content: &OutboundContent,
        reply_to: Option<&str>,
    ) -> Result<String, SendError>;

    /// Cheap round trip used as the keep-alive probe.
    async fn probe(&self) -> Result<(), ChannelError>;

    /// Stop the running session. Must be a no-op when nothing is running.
    async fn shutdown(&self);

    /// Media downloader, when the driver can fetch attachments.
    fn media_fetcher(&self) -> Option<Arc<dyn MediaFetcher>> {
        None
    }
}

/// Builds a driver per account.
pub type WebTransportFactory =
    Arc<dyn Fn(&str, &WhatsAppWebConfig) -> Arc<dyn WhatsAppWebTransport> + Send + Sync>;

pub struct WhatsAppWebClient {
    inner: Arc<WebInner>,
}

struct WebInner {
    config: WhatsAppWebConfig,
    transport: Arc<dyn WhatsAppWebTransport>,
    lifecycle: Arc<Lifecycle>,
    pipeline: Arc<OutboundPipeline>,
    gate: InboundGate,
    media: Option<Arc<MediaCache>>,
}

impl WhatsAppWebClient {
    pub fn new(config: WhatsAppWebConfig, transport: Arc<dyn WhatsAppWebTransport>, ctx: &ClientContext) -> Self {
        Self {
            inner: Arc::new(WebInner {
                config,
                transport,
                lifecycle: ctx.lifecycle(Platform::WhatsappWeb),
                pipeline: Arc::clone(&ctx.pipeline),
                gate: ctx.gate(),
                media: ctx.media.clone(),
            }),
        }
    }

    pub fn normalize(&self, message: &WebMessage) -> UnifiedMessage {
        self.inner.normalize(message)
    }
}

/// Strip the JID domain and add `+`.
fn phone_of(jid: &str) -> String {
    let user = jid.split_once('@').map_or(jid, |(user, _)| user);
    let user = user.split_once(':').map_or(user, |(user, _)| user);
    format!("+{}", user.trim_start_matches('+'))
}

/// Plain numbers become direct-chat JIDs.
fn to_jid(recipient: &str) -> String {
    let trimmed = recipient.trim();
    if trimmed.contains('@') {
        trimmed.to_string()
    } else {
        format!("{}@c.us", trimmed.trim_start_matches('+'))
    }
}

impl WebInner {
    fn account_id(&self) -> &str {
        self.lifecycle.account_id()
    }

    fn session_name(&self) -> &str {
        self.config
            .session_name
            .as_deref()
            .unwrap_or_else(|| self.lifecycle.account_id())
    }

    fn normalize(&self, m: &WebMessage) -> UnifiedMessage {
        let sender = if m.sender_id.is_empty() { &m.chat_id } else { &m.sender_id };
        let mut msg = UnifiedMessage::incoming(
            Platform::WhatsappWeb,
            self.account_id(),
            m.id.clone(),
            m.chat_id.clone(),
            sender.clone(),
        );
        msg.sender_name = resolve_sender_name(m.contact_name.as_deref(), m.push_name.as_deref(), sender);
        msg.is_group = infer_group(&m.chat_id, sender, m.is_group);
        if let Some(ts) = DateTime::<Utc>::from_timestamp(m.timestamp, 0).filter(|_| m.timestamp > 0) {
            msg.timestamp = ts;
        }

        let kind = m.kind.as_str();
        let probe = ContentProbe {
            text: kind == "chat",
            photo: kind == "image",
            audio: kind == "audio",
            voice: kind == "ptt",
            video: kind == "video" || kind == "gif",
            document: kind == "document",
            sticker: kind == "sticker",
            location: kind == "location",
            contact: kind == "vcard" || kind == "multi_vcard",
            poll: kind == "poll_creation",
        };
        msg.content_type = probe.classify();
        msg.text = m
            .body
            .clone()
            .filter(|_| msg.content_type == ContentType::Text)
            .or_else(|| m.caption.clone());
        msg.media = m.media.clone().filter(|_| msg.content_type.is_media());
        msg.raw = serde_json::to_value(m).unwrap_or_default();
        msg
    }

    async fn handle_message(&self, m: WebMessage) {
        if m.from_me {
            return;
        }
        let message = self.normalize(&m);
        let phone = phone_of(&message.sender_id);
        if !self.gate.admit(&message, &[phone.as_str()]) {
            return;
        }
        if let (Some(cache), Some(media)) = (&self.media, &message.media) {
            let fetcher = self
                .transport
                .media_fetcher()
                .or_else(|| HttpMediaFetcher::for_reference(media));
            if let Some(fetcher) = fetcher {
                cache.spawn_fetch(MediaCache::key_for(self.account_id(), media), media.clone(), fetcher);
            }
        }
        self.lifecycle.events().message(message).await;
    }

    async fn set_metadata(&self, qr_code: Option<String>, phone: Option<String>) {
        let metadata = ConnectionMetadata::WhatsappWeb { qr_code, phone };
        if let Err(e) = self
            .lifecycle
            .store()
            .update_connection_metadata(self.account_id(), &metadata)
            .await
        {
            warn!(account_id = %self.account_id(), "metadata update failed: {e:#}");
        }
    }

    async fn event_loop(self: Arc<Self>, ticket: ConnectTicket, mut events: mpsc::Receiver<WebEvent>) -> LoopExit {
        while let Some(event) = events.recv().await {
            match event {
                WebEvent::Qr(code) => {
                    info!(account_id = %self.account_id(), "WhatsApp Web waiting for QR scan");
                    self.set_metadata(Some(code), None).await;
                }
                WebEvent::Authenticated => {
                    debug!(account_id = %self.account_id(), "WhatsApp Web session authenticated");
                }
                WebEvent::Ready { phone } => {
                    self.set_metadata(None, phone).await;
                    if self.lifecycle.mark_connected(ticket.generation).await {
                        let transport = Arc::clone(&self.transport);
                        self.lifecycle.spawn_keepalive(
                            &ticket,
                            Duration::from_secs(self.config.keepalive_secs.max(1)),
                            KeepAliveMode::Probe,
                            self.clone(),
                            move || {
                                let transport = Arc::clone(&transport);
                                async move { transport.probe().await }
                            },
                        );
                    }
                }
                WebEvent::Message(message) => self.handle_message(message).await,
                WebEvent::AuthFailure(reason) => {
                    self.transport.shutdown().await;
                    return LoopExit::Terminal(ChannelError::auth(AuthFailure::ExpiredSession, reason).to_string());
                }
                WebEvent::Disconnected(reason) => {
                    self.transport.shutdown().await;
                    return LoopExit::Lost(reason);
                }
            }
        }
        LoopExit::Lost("driver event stream ended".into())
    }
}

#[async_trait]
impl Connector for WebInner {
    async fn open(self: Arc<Self>, ticket: &ConnectTicket) -> Result<OpenOutcome, ChannelError> {
        // A reconnect after a failed keep-alive still has the old session
        // running inside the driver.
        self.transport.shutdown().await;
        let events = self.transport.start(self.session_name()).await?;
        let task = Arc::clone(&self).event_loop(ticket.clone(), events);
        self.lifecycle.spawn_bound(ticket, self.clone(), task);
        // Stays `connecting` until the driver reports ready.
        Ok(OpenOutcome::Pending)
    }
}

#[async_trait]
impl PlatformClient for WhatsAppWebClient {
    fn account_id(&self) -> &str {
        self.inner.account_id()
    }

    fn platform(&self) -> Platform {
        Platform::WhatsappWeb
    }

    async fn connect(&self) -> Result<ConnectionState, ChannelError> {
        let connector: Arc<dyn Connector> = self.inner.clone();
        self.inner.lifecycle.run_connect(connector, true).await
    }

    async fn disconnect(&self) {
        self.inner.lifecycle.disconnect().await;
        self.inner.transport.shutdown().await;
    }

    async fn send(
        &self,
        recipient: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> Result<SendReceipt, SendError> {
        if self.status() != ConnectionState::Connected {
            return Err(SendError::Connection("WhatsApp Web session is not ready".into()));
        }
        if content.body().is_some_and(|b| b.trim().is_empty()) && matches!(content, OutboundContent::Text(_)) {
            return Err(SendError::validation("empty message text"));
        }
        let jid = to_jid(recipient);
        let request = SendRequest {
            platform: Platform::WhatsappWeb,
            account_id: self.account_id(),
            recipient: &jid,
            operation: content.operation(),
            flood_wait: FloodWaitPolicy::Propagate,
        };
        let transport = &self.inner.transport;
        let jid_ref = jid.as_str();
        let reply_to = options.reply_to.as_deref();
        self.inner
            .pipeline
            .execute(request, || async move {
                let id = transport.send(jid_ref, content, reply_to).await?;
                Ok(SendReceipt::now(id))
            })
            .await
    }

    fn status(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scriptable driver: tests push events through `events`.
    #[derive(Default)]
    pub struct FakeWebTransport {
        pub starts: AtomicU32,
        pub shutdowns: AtomicU32,
        /// `start` calls made while a previous session was still live.
        pub overlapping_starts: AtomicU32,
        pub events: Mutex<Option<mpsc::Sender<WebEvent>>>,
        pub sent: Mutex<Vec<(String, OutboundContent)>>,
        pub probe_fails: std::sync::atomic::AtomicBool,
    }

    impl FakeWebTransport {
        pub async fn push(&self, event: WebEvent) {
            let tx = self.events.lock().clone();
            if let Some(tx) = tx {
                let _ = tx.send(event).await;
            }
        }
    }

    #[async_trait]
    impl WhatsAppWebTransport for FakeWebTransport {
        async fn start(&self, _session_name: &str) -> Result<mpsc::Receiver<WebEvent>, ChannelError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            if self.events.lock().replace(tx).is_some() {
                self.overlapping_starts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(rx)
        }

        async fn send(
            &self,
            chat_id: &str,
            content: &OutboundContent,
            _reply_to: Option<&str>,
        ) -> Result<String, SendError> {
            self.sent.lock().push((chat_id.to_string(), content.clone()));
            Ok("true_123@c.us_ABC".into())
        }

        async fn probe(&self) -> Result<(), ChannelError> {
            if self.probe_fails.load(Ordering::SeqCst) {
                Err(ChannelError::connection("getState timed out"))
            } else {
                Ok(())
            }
        }

        async fn shutdown(&self) {
            if self.events.lock().take().is_some() {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}
