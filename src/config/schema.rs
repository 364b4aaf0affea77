use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channels::lifecycle::ReconnectPolicy;
use crate::channels::message::Platform;
use crate::delivery::{CircuitConfig, RateLimitConfig};
use crate::error::ChannelError;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let bridge_dir = home.join(".channelbridge");
        Self {
            workspace_dir: bridge_dir.join("workspace"),
            config_path: bridge_dir.join("config.toml"),
            gateway: GatewayConfig::default(),
            delivery: DeliveryConfig::default(),
            media: MediaConfig::default(),
            accounts: Vec::new(),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 3000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

// ── Delivery ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

// ── Media cache ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `<workspace>/media`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_media_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_media_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: None,
            ttl_secs: default_media_ttl_secs(),
        }
    }
}

// ── Accounts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Empty or `["*"]` admits everyone; `@domain` matches e-mail domains.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    #[serde(default)]
    pub reconnect: Option<ReconnectOverride>,
    pub platform: PlatformCredentials,
}

impl AccountConfig {
    pub fn platform(&self) -> Platform {
        self.platform.platform()
    }

    /// Platform defaults with any configured override applied.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let base = self.platform.default_reconnect();
        match &self.reconnect {
            None => base,
            Some(o) => {
                let delay = o.delay_secs.map_or(base.delay, Duration::from_secs);
                ReconnectPolicy {
                    max_attempts: o.max_attempts.unwrap_or(base.max_attempts),
                    delay,
                    max_delay: o
                        .max_delay_secs
                        .map_or(base.max_delay.max(delay), Duration::from_secs),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectOverride {
    pub max_attempts: Option<u32>,
    pub delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
}

/// Typed credentials, one variant per transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformCredentials {
    WhatsappWeb(WhatsAppWebConfig),
    WhatsappBusiness(WhatsAppBusinessConfig),
    TelegramBot(TelegramBotConfig),
    TelegramUser(TelegramUserConfig),
    Email(EmailConfig),
}

impl PlatformCredentials {
    pub fn platform(&self) -> Platform {
        match self {
            PlatformCredentials::WhatsappWeb(_) => Platform::WhatsappWeb,
            PlatformCredentials::WhatsappBusiness(_) => Platform::WhatsappBusiness,
            PlatformCredentials::TelegramBot(_) => Platform::TelegramBot,
            PlatformCredentials::TelegramUser(_) => Platform::TelegramUser,
            PlatformCredentials::Email(_) => Platform::Email,
        }
    }

    pub fn default_reconnect(&self) -> ReconnectPolicy {
        let secs = Duration::from_secs;
        match self {
            PlatformCredentials::Email(_) => ReconnectPolicy::fixed(3, secs(10)),
            PlatformCredentials::TelegramBot(_) => ReconnectPolicy::fixed(3, secs(5)),
            PlatformCredentials::TelegramUser(_) => ReconnectPolicy::fixed(5, secs(5)),
            PlatformCredentials::WhatsappWeb(_) => ReconnectPolicy::fixed(5, secs(10)),
            PlatformCredentials::WhatsappBusiness(_) => ReconnectPolicy::fixed(3, secs(5)),
        }
    }

    /// Names of required fields that are empty.
    fn missing_fields(&self) -> Vec<&'static str> {
        let required: Vec<(&str, &'static str)> = match self {
            PlatformCredentials::WhatsappWeb(_) => Vec::new(),
            PlatformCredentials::WhatsappBusiness(c) => vec![
                (c.phone_number_id.as_str(), "phone_number_id"),
                (c.access_token.as_str(), "access_token"),
                (c.verify_token.as_str(), "verify_token"),
            ],
            PlatformCredentials::TelegramBot(c) => vec![(c.bot_token.as_str(), "bot_token")],
            PlatformCredentials::TelegramUser(c) => vec![(c.api_hash.as_str(), "api_hash")],
            PlatformCredentials::Email(c) => vec![
                (c.imap_host.as_str(), "imap_host"),
                (c.smtp_host.as_str(), "smtp_host"),
                (c.username.as_str(), "username"),
                (c.password.as_str(), "password"),
                (c.from_address.as_str(), "from_address"),
            ],
        };
        let mut missing: Vec<&'static str> = required
            .into_iter()
            .filter(|(value, _)| value.trim().is_empty())
            .map(|(_, name)| name)
            .collect();
        if let PlatformCredentials::TelegramUser(c) = self {
            if c.api_id == 0 {
                missing.push("api_id");
            }
        }
        missing
    }
}

/// WhatsApp Web session. The browser/session driver is supplied by the
/// embedding application; only local options live here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhatsAppWebConfig {
    /// Label under which the driver keeps its paired session.
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default = "default_web_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_web_keepalive_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppBusinessConfig {
    pub phone_number_id: String,
    pub access_token: String,
    /// Echoed back during the `hub.challenge` handshake.
    pub verify_token: String,
    /// Meta app secret for `X-Hub-Signature-256`; unsigned webhooks are
    /// rejected when set.
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default = "default_graph_api_base")]
    pub api_base: String,
}

fn default_graph_api_base() -> String {
    "https://graph.facebook.com/v18.0".into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    #[default]
    Polling,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramBotConfig {
    pub bot_token: String,
    #[serde(default)]
    pub mode: UpdateMode,
    /// Public URL registered with `setWebhook` in webhook mode. Leave unset
    /// when the webhook is registered out of band.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` in webhook mode.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUserConfig {
    pub api_id: i32,
    pub api_hash: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// Bound on confirming a saved session during unattended reconnect.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_session_persist_secs")]
    pub session_persist_secs: u64,
}

fn default_session_timeout_secs() -> u64 {
    45
}

fn default_session_persist_secs() -> u64 {
    300
}

/// Email channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port (default: 993 for TLS)
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    /// IMAP folder to watch (default: INBOX)
    #[serde(default = "default_imap_folder")]
    pub imap_folder: String,
    /// SMTP server hostname
    pub smtp_host: String,
    /// SMTP server port (default: 587 for STARTTLS, 465 for implicit TLS)
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Use TLS for SMTP (default: true)
    #[serde(default = "default_true")]
    pub smtp_tls: bool,
    pub username: String,
    pub password: String,
    /// From address for outgoing emails
    pub from_address: String,
    /// How long one IDLE waits before a NOOP keep-alive probe.
    #[serde(default = "default_idle_keepalive_secs")]
    pub idle_keepalive_secs: u64,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_imap_folder() -> String {
    "INBOX".into()
}

fn default_idle_keepalive_secs() -> u64 {
    300
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            imap_host: String::new(),
            imap_port: default_imap_port(),
            imap_folder: default_imap_folder(),
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            smtp_tls: true,
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            idle_keepalive_secs: default_idle_keepalive_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let bridge_dir = home.join(".channelbridge");
        let config_path = bridge_dir.join("config.toml");

        if !bridge_dir.exists() {
            fs::create_dir_all(&bridge_dir)
                .context("Failed to create .channelbridge directory")?;
            fs::create_dir_all(bridge_dir.join("workspace"))
                .context("Failed to create workspace directory")?;
        }

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save()?;
            config
        };
        config.workspace_dir = bridge_dir.join("workspace");
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.config_path = path.to_path_buf();
        if let Some(parent) = path.parent() {
            config.workspace_dir = parent.join("workspace");
        }
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Workspace directory: CHANNELBRIDGE_WORKSPACE
        if let Ok(workspace) = std::env::var("CHANNELBRIDGE_WORKSPACE") {
            if !workspace.is_empty() {
                self.workspace_dir = PathBuf::from(workspace);
            }
        }

        // Gateway: CHANNELBRIDGE_GATEWAY_HOST / CHANNELBRIDGE_GATEWAY_PORT
        if let Ok(host) = std::env::var("CHANNELBRIDGE_GATEWAY_HOST") {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }
        if let Ok(port_str) = std::env::var("CHANNELBRIDGE_GATEWAY_PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }

        // Secret kept out of the file: CHANNELBRIDGE_WHATSAPP_APP_SECRET
        if let Ok(secret) = std::env::var("CHANNELBRIDGE_WHATSAPP_APP_SECRET") {
            if !secret.is_empty() {
                for account in &mut self.accounts {
                    if let PlatformCredentials::WhatsappBusiness(c) = &mut account.platform {
                        if c.app_secret.is_none() {
                            c.app_secret = Some(secret.clone());
                        }
                    }
                }
            }
        }
    }

    /// Reject configurations that cannot produce working clients.
    pub fn validate(&self) -> Result<(), ChannelError> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(ChannelError::Config("account with empty id".into()));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(ChannelError::Config(format!(
                    "duplicate account id `{}`",
                    account.id
                )));
            }
            let missing = account.platform.missing_fields();
            if !missing.is_empty() {
                return Err(ChannelError::Config(format!(
                    "account `{}` ({}) is missing {}",
                    account.id,
                    account.platform(),
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn media_cache_dir(&self) -> PathBuf {
        self.media
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join("media"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace_dir.join("sessions")
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[gateway]
port = 8088

[delivery.circuit_breaker]
failure_threshold = 4

[[accounts]]
id = "support-mail"
allowed_senders = ["@example.com"]

[accounts.platform]
type = "email"
imap_host = "imap.example.com"
smtp_host = "smtp.example.com"
username = "support"
password = "hunter2"
from_address = "support@example.com"

[[accounts]]
id = "helper-bot"

[accounts.reconnect]
max_attempts = 7

[accounts.platform]
type = "telegram_bot"
bot_token = "123:ABC"
mode = "webhook"
webhook_secret = "s3cret"
"#;

    #[test]
    fn config_default_has_sane_values() {
        let c = Config::default();
        assert_eq!(c.gateway.port, 3000);
        assert_eq!(c.gateway.host, "127.0.0.1");
        assert_eq!(c.delivery.circuit_breaker.failure_threshold, 5);
        assert_eq!(c.delivery.circuit_breaker.success_threshold, 2);
        assert_eq!(c.media.ttl_secs, 604_800);
        assert!(c.accounts.is_empty());
        assert!(c.config_path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn parses_tagged_accounts() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.gateway.port, 8088);
        assert_eq!(config.delivery.circuit_breaker.failure_threshold, 4);
        assert_eq!(config.delivery.circuit_breaker.success_threshold, 2);
        assert_eq!(config.accounts.len(), 2);

        let mail = &config.accounts[0];
        assert_eq!(mail.platform(), Platform::Email);
        let PlatformCredentials::Email(email) = &mail.platform else {
            panic!("expected email credentials");
        };
        assert_eq!(email.imap_port, 993);
        assert_eq!(email.imap_folder, "INBOX");

        let bot = &config.accounts[1];
        let PlatformCredentials::TelegramBot(tg) = &bot.platform else {
            panic!("expected telegram credentials");
        };
        assert_eq!(tg.mode, UpdateMode::Webhook);
        assert_eq!(tg.api_base, "https://api.telegram.org");
        config.validate().unwrap();
    }

    #[test]
    fn reconnect_defaults_and_overrides() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let mail = config.accounts[0].reconnect_policy();
        assert_eq!(mail.max_attempts, 3);
        assert_eq!(mail.delay, Duration::from_secs(10));

        let bot = config.accounts[1].reconnect_policy();
        assert_eq!(bot.max_attempts, 7);
        assert_eq!(bot.delay, Duration::from_secs(5));
    }

    #[test]
    fn validate_rejects_duplicates_and_missing_credentials() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let mut dup = config.accounts[0].clone();
        config.accounts.push(dup.clone());
        assert!(matches!(config.validate(), Err(ChannelError::Config(msg)) if msg.contains("duplicate")));

        config.accounts.pop();
        dup.id = "other".into();
        if let PlatformCredentials::Email(c) = &mut dup.platform {
            c.password.clear();
        }
        config.accounts.push(dup);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("password"), "{err}");
    }

    #[test]
    fn save_then_load_keeps_accounts() {
        let tmp = TempDir::new().unwrap();
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.config_path = tmp.path().join("config.toml");
        config.save().unwrap();

        let loaded = Config::load_from(&config.config_path).unwrap();
        assert_eq!(loaded.accounts.len(), 2);
        assert_eq!(loaded.accounts[1].id, "helper-bot");
        assert_eq!(loaded.workspace_dir, tmp.path().join("workspace"));
    }
}
