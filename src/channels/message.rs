use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The five supported transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    WhatsappWeb,
    WhatsappBusiness,
    TelegramBot,
    TelegramUser,
    Email,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::WhatsappWeb => "whatsapp_web",
            Platform::WhatsappBusiness => "whatsapp_business",
            Platform::TelegramBot => "telegram_bot",
            Platform::TelegramUser => "telegram_user",
            Platform::Email => "email",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Connection state of one account. Exactly one value is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Content classification. Declaration order is the sniffing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Photo,
    Audio,
    Voice,
    Video,
    Document,
    Sticker,
    Location,
    Contact,
    Poll,
    Unknown,
}

impl ContentType {
    pub const PRIORITY: [ContentType; 10] = [
        ContentType::Text,
        ContentType::Photo,
        ContentType::Audio,
        ContentType::Voice,
        ContentType::Video,
        ContentType::Document,
        ContentType::Sticker,
        ContentType::Location,
        ContentType::Contact,
        ContentType::Poll,
    ];

    pub fn is_media(self) -> bool {
        matches!(
            self,
            ContentType::Photo
                | ContentType::Audio
                | ContentType::Voice
                | ContentType::Video
                | ContentType::Document
                | ContentType::Sticker
        )
    }
}

/// Pointer to media held by the platform. The payload itself is never
/// inlined into a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    /// Platform file id or URL.
    pub reference: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
}

impl MediaReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            mime_type: None,
            file_name: None,
            size: None,
        }
    }
}

/// A bot-style command such as `/start foo bar`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub command: String,
    pub args: Vec<String>,
    pub raw_args: String,
}

/// Platform-agnostic representation of one inbound or outbound event.
///
/// `(platform, external_id)` identifies one physical inbound event and is
/// what downstream consumers de-duplicate on. `id` is local and random.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    pub external_id: String,
    pub account_id: String,
    pub platform: Platform,
    pub direction: Direction,
    pub sender_id: String,
    pub sender_name: String,
    pub recipient_id: Option<String>,
    pub chat_id: String,
    pub content_type: ContentType,
    pub text: Option<String>,
    pub media: Option<MediaReference>,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    pub is_edited: bool,
    pub is_command: bool,
    pub command: Option<ParsedCommand>,
    pub raw: serde_json::Value,
}

impl UnifiedMessage {
    /// Start an incoming message; callers fill in the remaining fields.
    pub fn incoming(
        platform: Platform,
        account_id: &str,
        external_id: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        let sender_id = sender_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            external_id: external_id.into(),
            account_id: account_id.to_string(),
            platform,
            direction: Direction::Incoming,
            sender_name: sender_id.clone(),
            sender_id,
            recipient_id: None,
            chat_id: chat_id.into(),
            content_type: ContentType::Unknown,
            text: None,
            media: None,
            timestamp: Utc::now(),
            is_group: false,
            is_edited: false,
            is_command: false,
            command: None,
            raw: serde_json::Value::Null,
        }
    }

    /// Key used for de-duplication downstream.
    pub fn dedup_key(&self) -> (Platform, &str) {
        (self.platform, self.external_id.as_str())
    }
}

/// What a caller asks a client to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundContent {
    Text(String),
    Media {
        kind: ContentType,
        url: String,
        caption: Option<String>,
        file_name: Option<String>,
    },
}

impl OutboundContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }

    /// Text body, or the caption for media.
    pub fn body(&self) -> Option<&str> {
        match self {
            OutboundContent::Text(body) => Some(body),
            OutboundContent::Media { caption, .. } => caption.as_deref(),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            OutboundContent::Text(_) => "send_message",
            OutboundContent::Media { .. } => "send_media",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub reply_to: Option<String>,
    /// E-mail subject.
    pub subject: Option<String>,
    /// Send the e-mail body as HTML.
    pub html: bool,
    /// Telegram `parse_mode`.
    pub parse_mode: Option<String>,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

impl SendReceipt {
    pub fn now(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_serializes_snake_case() {
        let json = serde_json::to_string(&Platform::WhatsappBusiness).unwrap();
        assert_eq!(json, "\"whatsapp_business\"");
        assert_eq!(Platform::TelegramUser.to_string(), "telegram_user");
    }

    #[test]
    fn incoming_defaults_sender_name_to_id() {
        let msg = UnifiedMessage::incoming(Platform::Email, "acc", "<a@b>", "inbox", "bob@x.io");
        assert_eq!(msg.sender_name, "bob@x.io");
        assert_eq!(msg.direction, Direction::Incoming);
        assert_eq!(msg.dedup_key(), (Platform::Email, "<a@b>"));
    }

    #[test]
    fn media_priority_excludes_location() {
        assert!(ContentType::Voice.is_media());
        assert!(!ContentType::Location.is_media());
        assert_eq!(ContentType::PRIORITY[0], ContentType::Text);
        assert_eq!(ContentType::PRIORITY[9], ContentType::Poll);
    }

    #[test]
    fn outbound_operation_names() {
        assert_eq!(OutboundContent::text("hi").operation(), "send_message");
        let media = OutboundContent::Media {
            kind: ContentType::Photo,
            url: "https://x/y.png".into(),
            caption: Some("look".into()),
            file_name: None,
        };
        assert_eq!(media.operation(), "send_media");
        assert_eq!(media.body(), Some("look"));
    }
}
