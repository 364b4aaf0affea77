use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};

use super::lifecycle::{ConnectTicket, Connector, Lifecycle, LoopExit, OpenOutcome};
use super::message::{
    ConnectionState, ContentType, MediaReference, OutboundContent, Platform, SendOptions, SendReceipt,
    UnifiedMessage,
};
use super::normalize::{parse_command, resolve_sender_name, CommandParse, ContentProbe, InboundGate};
use super::traits::PlatformClient;
use super::webhook::{constant_time_eq, WebhookOutcome, WebhookValidation};
use super::ClientContext;
use crate::config::{TelegramBotConfig, UpdateMode};
use crate::delivery::{FloodWaitPolicy, OutboundPipeline, SendRequest};
use crate::error::{AuthFailure, ChannelError, LimitType, SendError};
use crate::media::{FetchedMedia, MediaCache, MediaFetcher};
use crate::status::ConnectionMetadata;

/// Telegram Bot API client: long-polls `getUpdates`, or accepts pushed
/// updates through the webhook gateway.
pub struct TelegramBotClient {
    inner: Arc<BotInner>,
}

struct BotInner {
    config: TelegramBotConfig,
    client: reqwest::Client,
    lifecycle: Arc<Lifecycle>,
    pipeline: Arc<OutboundPipeline>,
    gate: InboundGate,
    media: Option<Arc<MediaCache>>,
    identity: RwLock<Option<BotIdentity>>,
}

#[derive(Debug, Clone)]
struct BotIdentity {
    id: i64,
    username: Option<String>,
}

impl TelegramBotClient {
    pub fn new(config: TelegramBotConfig, ctx: &ClientContext) -> Self {
        Self {
            inner: Arc::new(BotInner {
                config,
                client: reqwest::Client::new(),
                lifecycle: ctx.lifecycle(Platform::TelegramBot),
                pipeline: Arc::clone(&ctx.pipeline),
                gate: ctx.gate(),
                media: ctx.media.clone(),
                identity: RwLock::new(None),
            }),
        }
    }

    /// Username learned from `getMe`, once connected.
    pub fn bot_username(&self) -> Option<String> {
        self.inner.identity.read().as_ref().and_then(|i| i.username.clone())
    }

    /// Normalize one update without emitting it.
    pub fn normalize_update(&self, update: &Value) -> Option<UnifiedMessage> {
        self.inner.normalize_update(update)
    }

    /// Validate and normalize a pushed update. Accepted messages are returned,
    /// not emitted; the gateway forwards them.
    pub fn process_webhook(&self, raw_body: &[u8], secret_header: Option<&str>) -> WebhookOutcome {
        if let Some(expected) = self.inner.config.webhook_secret.as_deref() {
            let presented = secret_header.unwrap_or_default();
            if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                return WebhookOutcome::rejected("secret token mismatch");
            }
        }
        let update: Value = match serde_json::from_slice(raw_body) {
            Ok(update) => update,
            Err(e) => return WebhookOutcome::rejected(format!("malformed update: {e}")),
        };
        let messages = self.inner.normalize_update(&update).into_iter().filter(|m| self.inner.admit(m)).collect();
        WebhookOutcome {
            messages,
            validation: WebhookValidation::ok(),
        }
    }
}

impl BotInner {
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.config.api_base, self.config.bot_token)
    }

    fn account_id(&self) -> &str {
        self.lifecycle.account_id()
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value, ApiFailure> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiFailure::network(e.to_string()))?;
        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ApiFailure::network(format!("unreadable response ({status}): {e}")))?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(data.get("result").cloned().unwrap_or(Value::Null));
        }
        Err(ApiFailure {
            code: data
                .get("error_code")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| i64::from(status.as_u16())),
            description: data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            retry_after: data
                .pointer("/parameters/retry_after")
                .and_then(Value::as_u64),
        })
    }

    fn admit(&self, message: &UnifiedMessage) -> bool {
        let username = message
            .raw
            .pointer("/message/from/username")
            .or_else(|| message.raw.pointer("/edited_message/from/username"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.gate.admit(message, &[username])
    }

    fn normalize_update(&self, update: &Value) -> Option<UnifiedMessage> {
        let (msg, is_edited, is_channel) = [
            ("message", false, false),
            ("edited_message", true, false),
            ("channel_post", false, true),
            ("edited_channel_post", true, true),
        ]
        .into_iter()
        .find_map(|(field, edited, channel)| update.get(field).map(|m| (m, edited, channel)))?;

        let chat = msg.get("chat")?;
        let chat_id = chat.get("id").and_then(Value::as_i64)?.to_string();
        let message_id = msg.get("message_id").and_then(Value::as_i64)?;

        let from = msg.get("from").or_else(|| msg.get("sender_chat"));
        let sender_id = from
            .and_then(|f| f.get("id"))
            .and_then(Value::as_i64)
            .map_or_else(|| chat_id.clone(), |id| id.to_string());
        let full_name = from.map(|f| {
            [f.get("first_name"), f.get("last_name"), f.get("title")]
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" ")
        });
        let username = from.and_then(|f| f.get("username")).and_then(Value::as_str);

        let external_id = match msg.get("edit_date").and_then(Value::as_i64) {
            Some(edit_date) if is_edited => format!("{chat_id}:{message_id}:edit:{edit_date}"),
            _ => format!("{chat_id}:{message_id}"),
        };

        let mut out = UnifiedMessage::incoming(
            Platform::TelegramBot,
            self.account_id(),
            external_id,
            chat_id,
            sender_id,
        );
        out.sender_name = resolve_sender_name(full_name.as_deref(), username, &out.sender_id);
        out.is_edited = is_edited;
        out.is_group = is_channel
            || matches!(
                chat.get("type").and_then(Value::as_str),
                Some("group" | "supergroup" | "channel")
            );
        if let Some(ts) = msg
            .get("date")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        {
            out.timestamp = ts;
        }

        let probe = ContentProbe {
            text: msg.get("text").is_some(),
            photo: msg.get("photo").is_some(),
            audio: msg.get("audio").is_some(),
            voice: msg.get("voice").is_some(),
            video: msg.get("video").is_some() || msg.get("video_note").is_some(),
            document: msg.get("document").is_some(),
            sticker: msg.get("sticker").is_some(),
            location: msg.get("location").is_some(),
            contact: msg.get("contact").is_some(),
            poll: msg.get("poll").is_some(),
        };
        out.content_type = probe.classify();
        out.text = msg
            .get("text")
            .or_else(|| msg.get("caption"))
            .and_then(Value::as_str)
            .map(str::to_string);
        out.media = media_reference(msg, out.content_type);

        if let Some(text) = msg.get("text").and_then(Value::as_str) {
            let own = self.identity.read().as_ref().and_then(|i| i.username.clone());
            if let CommandParse::Command(command) = parse_command(text, own.as_deref()) {
                out.is_command = true;
                out.command = Some(command);
            }
        }

        out.raw = update.clone();
        Some(out)
    }

    async fn emit(&self, message: UnifiedMessage) {
        if !self.admit(&message) {
            return;
        }
        if let (Some(cache), Some(media)) = (&self.media, &message.media) {
            let fetcher = Arc::new(TelegramFileFetcher {
                client: self.client.clone(),
                api_base: self.config.api_base.clone(),
                token: self.config.bot_token.clone(),
            });
            cache.spawn_fetch(
                MediaCache::key_for(self.account_id(), media),
                media.clone(),
                fetcher,
            );
        }
        self.lifecycle.events().message(message).await;
    }

    async fn poll_loop(self: Arc<Self>) -> LoopExit {
        let mut offset: i64 = 0;
        tracing::info!(account_id = %self.account_id(), "Telegram bot polling for updates");

        loop {
            let body = json!({
                "offset": offset,
                "timeout": self.config.poll_timeout_secs,
                "allowed_updates": ["message", "edited_message", "channel_post", "edited_channel_post"]
            });

            let updates = match self.call("getUpdates", &body).await {
                Ok(result) => result,
                Err(failure) if failure.code == 401 => {
                    return LoopExit::Terminal(format!("bot token rejected: {}", failure.description));
                }
                Err(failure) => {
                    return LoopExit::Lost(format!("getUpdates failed: {}", failure.description));
                }
            };

            for update in updates.as_array().into_iter().flatten() {
                if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                    offset = uid + 1;
                }
                if let Some(message) = self.normalize_update(update) {
                    self.emit(message).await;
                }
            }
        }
    }
}

#[async_trait]
impl Connector for BotInner {
    async fn open(self: Arc<Self>, ticket: &ConnectTicket) -> Result<OpenOutcome, ChannelError> {
        let me = self.call("getMe", &json!({})).await.map_err(ApiFailure::into_channel_error)?;
        let identity = BotIdentity {
            id: me.get("id").and_then(Value::as_i64).unwrap_or_default(),
            username: me.get("username").and_then(Value::as_str).map(str::to_string),
        };
        tracing::info!(
            account_id = %self.account_id(),
            bot = identity.username.as_deref().unwrap_or("?"),
            "Telegram bot authenticated"
        );
        let metadata = ConnectionMetadata::TelegramBot {
            bot_id: Some(identity.id),
            bot_username: identity.username.clone(),
        };
        *self.identity.write() = Some(identity);
        if let Err(e) = self
            .lifecycle
            .store()
            .update_connection_metadata(self.account_id(), &metadata)
            .await
        {
            tracing::warn!(account_id = %self.account_id(), "metadata update failed: {e:#}");
        }

        match self.config.mode {
            UpdateMode::Polling => {
                // getUpdates is refused while a webhook is registered.
                self.call("deleteWebhook", &json!({ "drop_pending_updates": false }))
                    .await
                    .map_err(ApiFailure::into_channel_error)?;
                let task = Arc::clone(&self).poll_loop();
                self.lifecycle.spawn_bound(ticket, self.clone(), task);
            }
            UpdateMode::Webhook => {
                if let Some(url) = &self.config.webhook_url {
                    let mut body = json!({ "url": url });
                    if let Some(secret) = &self.config.webhook_secret {
                        body["secret_token"] = json!(secret);
                    }
                    self.call("setWebhook", &body)
                        .await
                        .map_err(ApiFailure::into_channel_error)?;
                }
            }
        }
        Ok(OpenOutcome::Ready)
    }
}

#[async_trait]
impl PlatformClient for TelegramBotClient {
    fn account_id(&self) -> &str {
        self.inner.account_id()
    }

    fn platform(&self) -> Platform {
        Platform::TelegramBot
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
        if self.status() != ConnectionState::Connected {
            return Err(SendError::Connection("telegram bot is not connected".into()));
        }
        if recipient.trim().is_empty() {
            return Err(SendError::validation("empty chat id"));
        }
        let (method, body) = build_send(recipient, content, options)?;
        let request = SendRequest {
            platform: Platform::TelegramBot,
            account_id: self.account_id(),
            recipient,
            operation: content.operation(),
            flood_wait: FloodWaitPolicy::Propagate,
        };
        let inner = &self.inner;
        let body = &body;
        inner
            .pipeline
            .execute(request, || async move {
                let result = inner
                    .call(method, body)
                    .await
                    .map_err(ApiFailure::into_send_error)?;
                let message_id = result.get("message_id").and_then(Value::as_i64).unwrap_or_default();
                let mut receipt = SendReceipt::now(format!("{recipient}:{message_id}"));
                if let Some(ts) = result
                    .get("date")
                    .and_then(Value::as_i64)
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                {
                    receipt.timestamp = ts;
                }
                Ok(receipt)
            })
            .await
    }

    fn status(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }
}

fn build_send(
    chat_id: &str,
    content: &OutboundContent,
    options: &SendOptions,
) -> Result<(&'static str, Value), SendError> {
    let mut body = json!({ "chat_id": chat_id });
    let method = match content {
        OutboundContent::Text(text) => {
            if text.trim().is_empty() {
                return Err(SendError::validation("empty message text"));
            }
            body["text"] = json!(text);
            "sendMessage"
        }
        OutboundContent::Media { kind, url, caption, .. } => {
            let (method, field) = match kind {
                ContentType::Photo => ("sendPhoto", "photo"),
                ContentType::Audio => ("sendAudio", "audio"),
                ContentType::Voice => ("sendVoice", "voice"),
                ContentType::Video => ("sendVideo", "video"),
                ContentType::Sticker => ("sendSticker", "sticker"),
                ContentType::Document => ("sendDocument", "document"),
                other => {
                    return Err(SendError::validation(format!("cannot send {other:?} as media")));
                }
            };
            body[field] = json!(url);
            if let Some(caption) = caption {
                body["caption"] = json!(caption);
            }
            method
        }
    };
    if let Some(mode) = &options.parse_mode {
        body["parse_mode"] = json!(mode);
    }
    if let Some(reply_to) = &options.reply_to {
        let id = reply_to.rsplit(':').next().unwrap_or(reply_to);
        if let Ok(id) = id.parse::<i64>() {
            body["reply_parameters"] = json!({ "message_id": id });
        }
    }
    Ok((method, body))
}

fn media_reference(msg: &Value, kind: ContentType) -> Option<MediaReference> {
    let node = match kind {
        // Sizes are ordered smallest first.
        ContentType::Photo => msg.get("photo").and_then(Value::as_array).and_then(|s| s.last()),
        ContentType::Audio => msg.get("audio"),
        ContentType::Voice => msg.get("voice"),
        ContentType::Video => msg.get("video").or_else(|| msg.get("video_note")),
        ContentType::Document => msg.get("document"),
        ContentType::Sticker => msg.get("sticker"),
        _ => None,
    }?;
    let mut media = MediaReference::new(node.get("file_id").and_then(Value::as_str)?);
    media.mime_type = node.get("mime_type").and_then(Value::as_str).map(str::to_string);
    media.file_name = node.get("file_name").and_then(Value::as_str).map(str::to_string);
    media.size = node.get("file_size").and_then(Value::as_u64);
    Some(media)
}

/// Error envelope of the Bot API.
#[derive(Debug, Clone)]
struct ApiFailure {
    code: i64,
    description: String,
    retry_after: Option<u64>,
}

impl ApiFailure {
    fn network(description: String) -> Self {
        Self {
            code: 0,
            description,
            retry_after: None,
        }
    }

    fn into_channel_error(self) -> ChannelError {
        match self.code {
            0 => ChannelError::Connection(self.description),
            401 | 403 => ChannelError::auth(AuthFailure::InvalidCredentials, self.description),
            code => ChannelError::Transport {
                code: code.to_string(),
                message: self.description,
            },
        }
    }

    fn into_send_error(self) -> SendError {
        match self.code {
            0 => SendError::Connection(self.description),
            401 => SendError::Auth {
                reason: AuthFailure::InvalidCredentials,
                message: self.description,
            },
            429 => SendError::RateLimit {
                limit_type: LimitType::FloodWait,
                retry_after_ms: self.retry_after.unwrap_or(1).saturating_mul(1000),
            },
            400 | 403 => SendError::validation(self.description),
            code => SendError::transport(Platform::TelegramBot, code.to_string(), self.description),
        }
    }
}

/// Resolves a `file_id` via `getFile` and downloads it.
struct TelegramFileFetcher {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

#[async_trait]
impl MediaFetcher for TelegramFileFetcher {
    async fn fetch(&self, media: &MediaReference) -> anyhow::Result<FetchedMedia> {
        let info: Value = self
            .client
            .post(format!("{}/bot{}/getFile", self.api_base, self.token))
            .json(&json!({ "file_id": media.reference }))
            .send()
            .await?
            .json()
            .await?;
        let path = info
            .pointer("/result/file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("getFile returned no file_path"))?;
        let bytes = self
            .client
            .get(format!("{}/file/bot{}/{path}", self.api_base, self.token))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec();
        Ok(FetchedMedia {
            bytes,
            mime_type: media.mime_type.clone(),
        })
    }
}
