use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::lifecycle::{ConnectTicket, Connector, Lifecycle, OpenOutcome};
use super::message::{
    ConnectionState, ContentType, MediaReference, OutboundContent, Platform, SendOptions, SendReceipt,
    UnifiedMessage,
};
use super::normalize::{resolve_sender_name, ContentProbe, InboundGate};
use super::traits::PlatformClient;
use super::webhook::{verify_hmac_sha256, verify_subscription, WebhookOutcome, WebhookValidation};
use super::ClientContext;
use crate::config::WhatsAppBusinessConfig;
use crate::delivery::{FloodWaitPolicy, OutboundPipeline, SendRequest};
use crate::error::{AuthFailure, ChannelError, LimitType, SendError};
use crate::media::{FetchedMedia, MediaCache, MediaFetcher};
use crate::status::ConnectionMetadata;

/// Header carrying the Meta app signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}
#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}
#[derive(Debug, Deserialize)]
struct WebhookChange {
    value: WebhookValue,
}
#[derive(Debug, Deserialize)]
struct WebhookValue {
    #[serde(default)]
    contacts: Vec<WebhookContact>,
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    statuses: Vec<MessageStatus>,
}
#[derive(Debug, Deserialize)]
struct WebhookContact {
    wa_id: String,
    profile: Option<ContactProfile>,
}
#[derive(Debug, Deserialize)]
struct ContactProfile {
    name: Option<String>,
}
#[derive(Debug, Deserialize)]
struct MessageStatus {
    id: String,
    status: String,
    recipient_id: String,
}

/// WhatsApp Business Cloud API. Inbound traffic arrives only through the
/// webhook gateway; `connect` validates the credentials.
pub struct WhatsAppBusinessClient {
    inner: Arc<BusinessInner>,
}

struct BusinessInner {
    config: WhatsAppBusinessConfig,
    client: Client,
    lifecycle: Arc<Lifecycle>,
    pipeline: Arc<OutboundPipeline>,
    gate: InboundGate,
    media: Option<Arc<MediaCache>>,
}

impl WhatsAppBusinessClient {
    pub fn new(config: WhatsAppBusinessConfig, ctx: &ClientContext) -> Self {
        Self {
            inner: Arc::new(BusinessInner {
                config,
                client: Client::new(),
                lifecycle: ctx.lifecycle(Platform::WhatsappBusiness),
                pipeline: Arc::clone(&ctx.pipeline),
                gate: ctx.gate(),
                media: ctx.media.clone(),
            }),
        }
    }

    /// Subscription handshake: the challenge to echo, or `None` to answer 403.
    pub fn verify_webhook(&self, mode: &str, token: &str, challenge: &str) -> Option<String> {
        verify_subscription(&self.inner.config.verify_token, mode, token, challenge)
    }

    /// Validate the signature (when an app secret is configured) and
    /// normalize every message in the delivery. Admitted messages are
    /// returned for the gateway to forward.
    pub fn process_webhook(&self, raw_body: &[u8], signature: Option<&str>) -> WebhookOutcome {
        if let Some(secret) = self.inner.config.app_secret.as_deref() {
            let validation = verify_hmac_sha256(secret, raw_body, signature);
            if !validation.valid {
                warn!(
                    account_id = %self.account_id(),
                    reason = validation.reason.as_deref().unwrap_or_default(),
                    "rejecting WhatsApp webhook"
                );
                return WebhookOutcome {
                    messages: Vec::new(),
                    validation,
                };
            }
        }

        let payload: WebhookPayload = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(e) => return WebhookOutcome::rejected(format!("malformed payload: {e}")),
        };

        let mut messages = Vec::new();
        for change in payload.entry.into_iter().flat_map(|e| e.changes) {
            for status in &change.value.statuses {
                debug!("Status {}: {} for {}", status.id, status.status, status.recipient_id);
            }
            for raw in &change.value.messages {
                let Some(message) = self.inner.normalize(raw, &change.value.contacts) else {
                    continue;
                };
                if self.inner.gate.admit(&message, &[]) {
                    self.inner.prefetch(&message);
                    messages.push(message);
                }
            }
        }
        WebhookOutcome {
            messages,
            validation: WebhookValidation::ok(),
        }
    }
}

impl BusinessInner {
    fn account_id(&self) -> &str {
        self.lifecycle.account_id()
    }

    fn normalize(&self, raw: &Value, contacts: &[WebhookContact]) -> Option<UnifiedMessage> {
        let from = raw.get("from").and_then(Value::as_str)?;
        let id = raw.get("id").and_then(Value::as_str)?;
        let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();

        let mut msg = UnifiedMessage::incoming(Platform::WhatsappBusiness, self.account_id(), id, from, from);
        let profile_name = contacts
            .iter()
            .find(|c| c.wa_id == from)
            .and_then(|c| c.profile.as_ref())
            .and_then(|p| p.name.as_deref());
        msg.sender_name = resolve_sender_name(profile_name, None, from);
        msg.recipient_id = Some(self.config.phone_number_id.clone());

        if let Some(ts) = raw
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        {
            msg.timestamp = ts;
        }

        let is_voice_note = kind == "ptt"
            || (kind == "audio" && raw.pointer("/audio/voice").and_then(Value::as_bool) == Some(true));
        let probe = ContentProbe {
            text: kind == "text",
            photo: kind == "image",
            audio: kind == "audio" && !is_voice_note,
            voice: is_voice_note,
            video: kind == "video",
            document: kind == "document",
            sticker: kind == "sticker",
            location: kind == "location",
            contact: kind == "contacts",
            poll: false,
        };
        msg.content_type = probe.classify();
        msg.text = raw
            .pointer("/text/body")
            .or_else(|| raw.get(kind).and_then(|m| m.get("caption")))
            .and_then(Value::as_str)
            .map(str::to_string);
        if msg.content_type.is_media() {
            let node = raw.get(kind);
            msg.media = node
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
                .map(|media_id| {
                    let mut media = MediaReference::new(media_id);
                    media.mime_type = node
                        .and_then(|m| m.get("mime_type"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    media.file_name = node
                        .and_then(|m| m.get("filename"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    media
                });
        }
        msg.raw = raw.clone();
        Some(msg)
    }

    fn prefetch(&self, message: &UnifiedMessage) {
        let (Some(cache), Some(media)) = (&self.media, &message.media) else {
            return;
        };
        let fetcher = Arc::new(GraphMediaFetcher {
            client: self.client.clone(),
            api_base: self.config.api_base.clone(),
            access_token: self.config.access_token.clone(),
        });
        cache.spawn_fetch(MediaCache::key_for(self.account_id(), media), media.clone(), fetcher);
    }

    async fn post_message(&self, body: &Value) -> Result<SendReceipt, SendError> {
        let url = format!("{}/{}/messages", self.config.api_base, self.config.phone_number_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Connection(e.to_string()))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let data: Value = resp.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            let id = data
                .pointer("/messages/0/id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Ok(SendReceipt::now(id));
        }
        Err(graph_send_error(status.as_u16(), &data, retry_after))
    }
}

fn graph_error_message(data: &Value) -> String {
    data.pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("unknown Graph API error")
        .to_string()
}

fn graph_send_error(status: u16, data: &Value, retry_after: Option<u64>) -> SendError {
    let message = graph_error_message(data);
    let code = data.pointer("/error/code").and_then(Value::as_i64);
    match (status, code) {
        (401, _) | (_, Some(190)) => SendError::Auth {
            reason: AuthFailure::InvalidCredentials,
            message,
        },
        // 130429 and 131056 are Cloud API throughput/pair-rate codes.
        (429, _) | (_, Some(130_429 | 131_056 | 80_007)) => SendError::RateLimit {
            limit_type: LimitType::FloodWait,
            retry_after_ms: retry_after.unwrap_or(60).saturating_mul(1000),
        },
        (400, _) => SendError::validation(message),
        (status, code) => SendError::transport(
            Platform::WhatsappBusiness,
            code.map_or_else(|| status.to_string(), |c| c.to_string()),
            message,
        ),
    }
}

fn build_send(recipient: &str, content: &OutboundContent, options: &SendOptions) -> Result<Value, SendError> {
    let to = recipient.trim_start_matches('+');
    if to.is_empty() {
        return Err(SendError::validation("empty recipient"));
    }
    let mut body = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
    });
    match content {
        OutboundContent::Text(text) => {
            if text.trim().is_empty() {
                return Err(SendError::validation("empty message text"));
            }
            body["type"] = json!("text");
            body["text"] = json!({ "body": text, "preview_url": false });
        }
        OutboundContent::Media {
            kind,
            url,
            caption,
            file_name,
        } => {
            let field = match kind {
                ContentType::Photo => "image",
                ContentType::Audio | ContentType::Voice => "audio",
                ContentType::Video => "video",
                ContentType::Document => "document",
                ContentType::Sticker => "sticker",
                other => return Err(SendError::validation(format!("cannot send {other:?} as media"))),
            };
            let mut node = json!({ "link": url });
            if let Some(caption) = caption.as_ref().filter(|_| field != "audio" && field != "sticker") {
                node["caption"] = json!(caption);
            }
            if let Some(name) = file_name.as_ref().filter(|_| field == "document") {
                node["filename"] = json!(name);
            }
            body["type"] = json!(field);
            body[field] = node;
        }
    }
    if let Some(reply_to) = &options.reply_to {
        body["context"] = json!({ "message_id": reply_to });
    }
    Ok(body)
}

#[async_trait]
impl Connector for BusinessInner {
    async fn open(self: Arc<Self>, _ticket: &ConnectTicket) -> Result<OpenOutcome, ChannelError> {
        let url = format!(
            "{}/{}?fields=display_phone_number,verified_name",
            self.config.api_base, self.config.phone_number_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        let status = resp.status();
        let data: Value = resp.json().await.unwrap_or(Value::Null);
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ChannelError::auth(
                AuthFailure::InvalidCredentials,
                graph_error_message(&data),
            ));
        }
        if !status.is_success() {
            return Err(ChannelError::Transport {
                code: status.as_u16().to_string(),
                message: graph_error_message(&data),
            });
        }

        let display = data
            .get("display_phone_number")
            .and_then(Value::as_str)
            .map(str::to_string);
        let phone = display.as_deref().unwrap_or("?");
        info!(
            account_id = %self.account_id(),
            phone = phone,
            "WhatsApp Business credentials accepted"
        );
        let metadata = ConnectionMetadata::WhatsappBusiness {
            phone_number_id: self.config.phone_number_id.clone(),
            display_phone_number: display,
        };
        if let Err(e) = self
            .lifecycle
            .store()
            .update_connection_metadata(self.account_id(), &metadata)
            .await
        {
            warn!(account_id = %self.account_id(), "metadata update failed: {e:#}");
        }
        Ok(OpenOutcome::Ready)
    }
}

#[async_trait]
impl PlatformClient for WhatsAppBusinessClient {
    fn account_id(&self) -> &str {
        self.inner.account_id()
    }

    fn platform(&self) -> Platform {
        Platform::WhatsappBusiness
    }

    async fn connect(&self) -> Result<ConnectionState, ChannelError> {
        let connector: Arc<dyn Connector> = self.inner.clone();
        self.inner.lifecycle.run_connect(connector, true).await
    }

    async fn disconnect(&self) {
        self.inner.lifecycle.disconnect().await;
    }

    async fn send(
        &self,
        recipient: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> Result<SendReceipt, SendError> {
        let body = build_send(recipient, content, options)?;
        let request = SendRequest {
            platform: Platform::WhatsappBusiness,
            account_id: self.account_id(),
            recipient,
            operation: content.operation(),
            flood_wait: FloodWaitPolicy::Propagate,
        };
        let inner = &self.inner;
        let body = &body;
        let receipt = inner
            .pipeline
            .execute(request, || async move { inner.post_message(body).await })
            .await?;
        info!("WhatsApp sent to {}", recipient);
        Ok(receipt)
    }

    fn status(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }
}

/// Graph media ids resolve to a short-lived URL that also needs the token.
struct GraphMediaFetcher {
    client: Client,
    api_base: String,
    access_token: String,
}

#[async_trait]
impl MediaFetcher for GraphMediaFetcher {
    async fn fetch(&self, media: &MediaReference) -> anyhow::Result<FetchedMedia> {
        let info: Value = self
            .client
            .get(format!("{}/{}", self.api_base, media.reference))
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let url = info
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("media lookup returned no url"))?;
        let bytes = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec();
        Ok(FetchedMedia {
            bytes,
            mime_type: info
                .get("mime_type")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| media.mime_type.clone()),
        })
    }
}
