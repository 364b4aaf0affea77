//! Deterministic helpers that turn transport payload fragments into
//! `UnifiedMessage` fields. Every client builds its messages through these so
//! the rules stay identical across platforms.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::message::{ContentType, ParsedCommand, Platform, UnifiedMessage};

/// Resolve a display name: resolved entity/profile name, then the name
/// carried inline in the payload, then the raw platform id.
pub fn resolve_sender_name(resolved: Option<&str>, inline: Option<&str>, raw_id: &str) -> String {
    [resolved, inline]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map_or_else(|| raw_id.to_string(), str::to_string)
}

/// Which content fields a payload carries. Built per transport, classified
/// here so the priority order is shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentProbe {
    pub text: bool,
    pub photo: bool,
    pub audio: bool,
    pub voice: bool,
    pub video: bool,
    pub document: bool,
    pub sticker: bool,
    pub location: bool,
    pub contact: bool,
    pub poll: bool,
}

impl ContentProbe {
    fn has(&self, kind: ContentType) -> bool {
        match kind {
            ContentType::Text => self.text,
            ContentType::Photo => self.photo,
            ContentType::Audio => self.audio,
            ContentType::Voice => self.voice,
            ContentType::Video => self.video,
            ContentType::Document => self.document,
            ContentType::Sticker => self.sticker,
            ContentType::Location => self.location,
            ContentType::Contact => self.contact,
            ContentType::Poll => self.poll,
            ContentType::Unknown => false,
        }
    }

    /// First matching field in priority order wins.
    pub fn classify(&self) -> ContentType {
        ContentType::PRIORITY
            .into_iter()
            .find(|kind| self.has(*kind))
            .unwrap_or(ContentType::Unknown)
    }
}

/// Group detection for transports whose native flag is missing or
/// unreliable: a chat id that differs from the sender id is a group even when
/// the native flag says otherwise.
pub fn infer_group(chat_id: &str, sender_id: &str, native_flag: Option<bool>) -> bool {
    if !chat_id.is_empty() && !sender_id.is_empty() && chat_id != sender_id {
        return true;
    }
    native_flag.unwrap_or(false)
}

/// Outcome of looking at a message for a bot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandParse {
    NotCommand,
    /// `/cmd@otherbot`: still emitted, but not a command for this bot.
    ForOtherBot,
    Command(ParsedCommand),
}

/// Split `/command[@bot] arg1 arg2` into its parts.
pub fn parse_command(text: &str, own_username: Option<&str>) -> CommandParse {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return CommandParse::NotCommand;
    };

    let (head, raw_args) = match rest.find(char::is_whitespace) {
        Some(pos) => (&rest[..pos], rest[pos..].trim()),
        None => (rest, ""),
    };
    if head.is_empty() {
        return CommandParse::NotCommand;
    }

    let command = match head.split_once('@') {
        Some((command, target)) => {
            let ours = own_username
                .map(|name| name.trim_start_matches('@'))
                .is_some_and(|name| name.eq_ignore_ascii_case(target));
            if !ours {
                return CommandParse::ForOtherBot;
            }
            command
        }
        None => head,
    };

    CommandParse::Command(ParsedCommand {
        command: command.to_string(),
        args: raw_args.split_whitespace().map(str::to_string).collect(),
        raw_args: raw_args.to_string(),
    })
}

/// Strip HTML tags from content (basic)
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Allow-list check shared by all clients. Empty list or `"*"` admits
/// everyone. On e-mail accounts an entry starting with `@` matches a whole
/// domain; elsewhere a leading `@` is just username notation (`@alice`).
pub fn is_sender_allowed(platform: Platform, allowed: &[String], candidates: &[&str]) -> bool {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return true;
    }
    candidates.iter().filter(|c| !c.is_empty()).any(|candidate| {
        let lower = candidate.to_lowercase();
        allowed.iter().any(|entry| match entry.strip_prefix('@') {
            Some(_) if platform == Platform::Email => lower.ends_with(&entry.to_lowercase()),
            Some(name) => name.eq_ignore_ascii_case(candidate.trim_start_matches('@')),
            None => entry
                .trim_start_matches('+')
                .eq_ignore_ascii_case(candidate.trim_start_matches('+')),
        })
    })
}

/// FIFO-bounded set of recently emitted external ids.
#[derive(Debug)]
pub struct BoundedSeenSet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl BoundedSeenSet {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Returns `false` when the id was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.members.insert(id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for BoundedSeenSet {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Last stop before emission: sender allow-list, then de-duplication on
/// the external id.
#[derive(Debug)]
pub struct InboundGate {
    allowed: Vec<String>,
    seen: Mutex<BoundedSeenSet>,
}

impl InboundGate {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed,
            seen: Mutex::new(BoundedSeenSet::default()),
        }
    }

    /// `aliases` are extra sender identities (usernames, phone formats).
    pub fn admit(&self, message: &UnifiedMessage, aliases: &[&str]) -> bool {
        let mut candidates = vec![message.sender_id.as_str()];
        candidates.extend_from_slice(aliases);
        if !is_sender_allowed(message.platform, &self.allowed, &candidates) {
            warn!(
                account_id = %message.account_id,
                sender = %message.sender_id,
                "dropping message from sender outside allow-list"
            );
            return false;
        }
        if !self.seen.lock().insert(message.external_id.clone()) {
            debug!(external_id = %message.external_id, "dropping redelivered message");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_name_falls_back_in_order() {
        assert_eq!(resolve_sender_name(Some("Alice A"), Some("al"), "42"), "Alice A");
        assert_eq!(resolve_sender_name(None, Some("al"), "42"), "al");
        assert_eq!(resolve_sender_name(Some("  "), None, "42"), "42");
        assert_eq!(resolve_sender_name(None, None, "42"), "42");
    }

    #[test]
    fn classify_prefers_text_over_media() {
        let probe = ContentProbe {
            text: true,
            photo: true,
            ..Default::default()
        };
        assert_eq!(probe.classify(), ContentType::Text);
    }

    #[test]
    fn classify_audio_beats_voice_and_video() {
        let probe = ContentProbe {
            voice: true,
            video: true,
            audio: true,
            ..Default::default()
        };
        assert_eq!(probe.classify(), ContentType::Audio);
    }

    #[test]
    fn classify_empty_probe_is_unknown() {
        assert_eq!(ContentProbe::default().classify(), ContentType::Unknown);
        let poll = ContentProbe {
            poll: true,
            ..Default::default()
        };
        assert_eq!(poll.classify(), ContentType::Poll);
    }

    #[test]
    fn group_inferred_from_differing_ids() {
        assert!(infer_group("-100123", "555", Some(false)));
        assert!(infer_group("-100123", "555", None));
        assert!(!infer_group("555", "555", None));
        assert!(infer_group("555", "555", Some(true)));
    }

    #[test]
    fn command_without_args() {
        let CommandParse::Command(cmd) = parse_command("/start", Some("mybot")) else {
            panic!("expected command");
        };
        assert_eq!(cmd.command, "start");
        assert!(cmd.args.is_empty());
        assert_eq!(cmd.raw_args, "");
    }

    #[test]
    fn command_with_args_and_own_username() {
        let CommandParse::Command(cmd) = parse_command("/remind@MyBot 10m  tea time", Some("mybot"))
        else {
            panic!("expected command");
        };
        assert_eq!(cmd.command, "remind");
        assert_eq!(cmd.args, vec!["10m", "tea", "time"]);
        assert_eq!(cmd.raw_args, "10m  tea time");
    }

    #[test]
    fn command_for_other_bot_is_not_ours() {
        assert_eq!(parse_command("/start@otherbot", Some("mybot")), CommandParse::ForOtherBot);
        assert_eq!(parse_command("/start@otherbot", None), CommandParse::ForOtherBot);
    }

    #[test]
    fn plain_text_and_bare_slash_are_not_commands() {
        assert_eq!(parse_command("hello /start", None), CommandParse::NotCommand);
        assert_eq!(parse_command("/", None), CommandParse::NotCommand);
    }

    #[test]
    fn strip_html_collapses_whitespace() {
        assert_eq!(strip_html("<div><p>Hello <b>World</b></p></div>"), "Hello World");
        assert_eq!(strip_html("Line<br/>Next"), "Line Next");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn allow_list_rules() {
        assert!(is_sender_allowed(Platform::Email, &[], &["anyone"]));
        assert!(is_sender_allowed(Platform::Email, &["*".into()], &["anyone"]));
        let list = vec!["@example.com".to_string(), "+15551234".to_string()];
        assert!(is_sender_allowed(Platform::Email, &list, &["Bob@Example.com"]));
        assert!(is_sender_allowed(Platform::WhatsappBusiness, &list, &["15551234"]));
        assert!(!is_sender_allowed(Platform::Email, &list, &["eve@evil.io", ""]));
    }

    #[test]
    fn at_prefixed_entry_is_a_username_outside_email() {
        let list = vec!["@Alice".to_string()];
        assert!(is_sender_allowed(Platform::TelegramBot, &list, &["42", "alice"]));
        assert!(is_sender_allowed(Platform::TelegramUser, &list, &["@alice"]));
        assert!(!is_sender_allowed(Platform::TelegramBot, &list, &["malice"]));
        // Domain matching stays an e-mail rule.
        assert!(!is_sender_allowed(Platform::WhatsappWeb, &["@c.us".to_string()], &["1555@c.us"]));
        assert!(!is_sender_allowed(Platform::Email, &list, &["alice"]));
    }

    #[test]
    fn gate_filters_senders_and_replays() {
        let gate = InboundGate::new(vec!["alice".into()]);
        let mut msg = UnifiedMessage::incoming(
            Platform::TelegramBot,
            "bot",
            "1:10",
            "1",
            "42",
        );
        assert!(gate.admit(&msg, &["alice"]));
        assert!(!gate.admit(&msg, &["alice"]), "replay must be dropped");

        msg.external_id = "1:11".into();
        assert!(!gate.admit(&msg, &["mallory"]));
    }

    #[test]
    fn seen_set_evicts_oldest() {
        let mut set = BoundedSeenSet::new(2);
        assert!(set.insert("a".into()));
        assert!(!set.insert("a".into()));
        set.insert("b".into());
        set.insert("c".into());
        assert_eq!(set.len(), 2);
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("c"));
    }
}
