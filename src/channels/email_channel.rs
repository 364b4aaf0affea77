//! E-mail account: IMAP IDLE for inbound, SMTP for outbound.
//!
//! The IMAP socket sits in IDLE between fetches. IDLE ends either when the
//! server announces new data or after `idle_keepalive_secs`, in which case a
//! NOOP checks that the socket is still alive. A failed NOOP is treated as a
//! silent disconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use lettre::message::header::ContentType;
use lettre::message::Mailbox as Address;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mail_parser::{MessageParser, MimeHeaders};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lifecycle::{ConnectTicket, Connector, Lifecycle, LoopExit, OpenOutcome};
use super::message::{
    ConnectionState, ContentType as Kind, MediaReference, OutboundContent, Platform, SendOptions, SendReceipt,
    UnifiedMessage,
};
use super::normalize::{resolve_sender_name, strip_html, ContentProbe, InboundGate};
use super::traits::PlatformClient;
use super::ClientContext;
use crate::config::EmailConfig;
use crate::delivery::{FloodWaitPolicy, OutboundPipeline, SendRequest};
use crate::error::{AuthFailure, ChannelError, SendError};
use crate::status::ConnectionMetadata;

const IMAP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SUBJECT: &str = "Message";

/// One fetched message, still in RFC 822 form.
#[derive(Debug, Clone)]
pub struct RawMail {
    pub uid: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxSignal {
    NewMail,
    Timeout,
}

/// An authenticated IMAP session with the folder selected.
#[async_trait]
pub trait MailboxSession: Send {
    /// Fetch every unseen message and flag it `\Seen`.
    async fn fetch_unseen(&mut self) -> Result<Vec<RawMail>, ChannelError>;

    /// Block in IDLE until new data or `timeout`.
    async fn wait_for_mail(&mut self, timeout: Duration) -> Result<MailboxSignal, ChannelError>;

    async fn noop(&mut self) -> Result<(), ChannelError>;

    async fn logout(&mut self);
}

#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, ChannelError>;
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<(), SendError>;
}

type TlsStream = tokio_rustls::client::TlsStream<tokio::net::TcpStream>;

pub fn build_imap_tls_config() -> anyhow::Result<Arc<tokio_rustls::rustls::ClientConfig>> {
    use tokio_rustls::rustls;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let crypto_provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let tls_config = rustls::ClientConfig::builder_with_provider(crypto_provider)
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(tls_config))
}

/// IMAPS over tokio-rustls.
pub struct ImapConnector {
    config: EmailConfig,
}

impl ImapConnector {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<ImapSession, ChannelError> {
        use rustls_pki_types::ServerName;

        let tcp = tokio::net::TcpStream::connect((self.config.imap_host.as_str(), self.config.imap_port))
            .await
            .map_err(|e| ChannelError::connection(format!("IMAP connect: {e}")))?;
        let tls_config = build_imap_tls_config().map_err(|e| ChannelError::Config(format!("{e:#}")))?;
        let server_name = ServerName::try_from(self.config.imap_host.clone())
            .map_err(|e| ChannelError::Config(format!("invalid IMAP host: {e}")))?;
        let tls = tokio_rustls::TlsConnector::from(tls_config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| ChannelError::connection(format!("IMAP TLS: {e}")))?;

        let client = async_imap::Client::new(tls);
        let mut session = client
            .login(&self.config.username, &self.config.password)
            .await
            .map_err(|(e, _)| ChannelError::auth(AuthFailure::InvalidCredentials, format!("IMAP login: {e}")))?;
        session
            .select(&self.config.imap_folder)
            .await
            .map_err(|e| ChannelError::Transport {
                code: "SELECT".into(),
                message: e.to_string(),
            })?;
        Ok(ImapSession { session: Some(session) })
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, ChannelError> {
        let session = tokio::time::timeout(IMAP_CONNECT_TIMEOUT, self.connect())
            .await
            .map_err(|_| ChannelError::Timeout {
                secs: IMAP_CONNECT_TIMEOUT.as_secs(),
                context: format!("connecting to {}", self.config.imap_host),
            })??;
        Ok(Box::new(session))
    }
}

struct ImapSession {
    // Taken while the connection is in IDLE.
    session: Option<async_imap::Session<TlsStream>>,
}

impl ImapSession {
    fn live(&mut self) -> Result<&mut async_imap::Session<TlsStream>, ChannelError> {
        self.session
            .as_mut()
            .ok_or_else(|| ChannelError::connection("IMAP session was lost during IDLE"))
    }
}

fn imap_err(e: async_imap::error::Error) -> ChannelError {
    ChannelError::connection(format!("IMAP: {e}"))
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn fetch_unseen(&mut self) -> Result<Vec<RawMail>, ChannelError> {
        let session = self.live()?;
        let mut uids: Vec<u32> = session.uid_search("UNSEEN").await.map_err(imap_err)?.into_iter().collect();
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        uids.sort_unstable();
        let set = uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");

        let fetched: Vec<_> = session
            .uid_fetch(&set, "(UID RFC822)")
            .await
            .map_err(imap_err)?
            .try_collect()
            .await
            .map_err(imap_err)?;
        let mails = fetched
            .iter()
            .filter_map(|f| {
                Some(RawMail {
                    uid: f.uid?,
                    bytes: f.body()?.to_vec(),
                })
            })
            .collect();

        let _: Vec<_> = session
            .uid_store(&set, "+FLAGS (\\Seen)")
            .await
            .map_err(imap_err)?
            .try_collect()
            .await
            .map_err(imap_err)?;
        Ok(mails)
    }

    async fn wait_for_mail(&mut self, timeout: Duration) -> Result<MailboxSignal, ChannelError> {
        use async_imap::extensions::idle::IdleResponse;

        let session = self
            .session
            .take()
            .ok_or_else(|| ChannelError::connection("IMAP session was lost during IDLE"))?;
        let mut idle = session.idle();
        idle.init().await.map_err(imap_err)?;
        let (wait, _stop) = idle.wait_with_timeout(timeout);
        let response = wait.await.map_err(imap_err)?;
        self.session = Some(idle.done().await.map_err(imap_err)?);

        Ok(match response {
            IdleResponse::NewData(_) => MailboxSignal::NewMail,
            IdleResponse::Timeout | IdleResponse::ManualInterrupt => MailboxSignal::Timeout,
        })
    }

    async fn noop(&mut self) -> Result<(), ChannelError> {
        self.live()?.noop().await.map_err(imap_err)
    }

    async fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout().await {
                debug!("IMAP logout failed: {e}");
            }
        }
    }
}

/// SMTP via lettre's async transport.
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    pub fn new(config: &EmailConfig) -> Result<Self, ChannelError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let builder = if !config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        } else if config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| ChannelError::Config(format!("SMTP relay: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| ChannelError::Config(format!("SMTP relay: {e}")))?
        };
        Ok(Self {
            transport: builder.port(config.smtp_port).credentials(creds).build(),
        })
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn deliver(&self, message: Message) -> Result<(), SendError> {
        self.transport.send(message).await.map(|_| ()).map_err(|e| {
            let code = e.status().map(|c| c.to_string());
            match code.as_deref() {
                Some("535" | "534" | "530") => SendError::Auth {
                    reason: AuthFailure::InvalidCredentials,
                    message: e.to_string(),
                },
                Some(code) if e.is_permanent() && code.starts_with("55") => SendError::validation(e.to_string()),
                Some(code) => SendError::transport(Platform::Email, code, e.to_string()),
                None => SendError::Connection(e.to_string()),
            }
        })
    }
}

pub struct EmailClient {
    inner: Arc<EmailInner>,
}

struct EmailInner {
    config: EmailConfig,
    imap: Arc<dyn MailConnector>,
    smtp: Arc<dyn MailSender>,
    lifecycle: Arc<Lifecycle>,
    pipeline: Arc<OutboundPipeline>,
    gate: InboundGate,
}

impl EmailClient {
    /// Real IMAP and SMTP transports.
    pub fn new(config: EmailConfig, ctx: &ClientContext) -> Result<Self, ChannelError> {
        let imap = Arc::new(ImapConnector::new(config.clone()));
        let smtp = Arc::new(SmtpSender::new(&config)?);
        Ok(Self::with_transports(config, imap, smtp, ctx))
    }

    pub fn with_transports(
        config: EmailConfig,
        imap: Arc<dyn MailConnector>,
        smtp: Arc<dyn MailSender>,
        ctx: &ClientContext,
    ) -> Self {
        Self {
            inner: Arc::new(EmailInner {
                config,
                imap,
                smtp,
                lifecycle: ctx.lifecycle(Platform::Email),
                pipeline: Arc::clone(&ctx.pipeline),
                gate: ctx.gate(),
            }),
        }
    }

    pub fn parse(&self, mail: &RawMail) -> Option<UnifiedMessage> {
        self.inner.parse(mail)
    }

    /// Build the outgoing message without sending it.
    pub fn compose(
        &self,
        recipient: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> Result<(Message, String), SendError> {
        self.inner.compose(recipient, content, options)
    }
}

fn attachment_kind(mime: &str) -> Kind {
    match mime.split('/').next().unwrap_or_default() {
        "image" => Kind::Photo,
        "audio" => Kind::Audio,
        "video" => Kind::Video,
        _ => Kind::Document,
    }
}

/// `Subject:` first line, as the outbound convention for plain sends.
fn split_subject(body: &str) -> (Option<&str>, &str) {
    if let Some(rest) = body.strip_prefix("Subject: ") {
        if let Some(pos) = rest.find('\n') {
            return (Some(rest[..pos].trim()), rest[pos + 1..].trim());
        }
    }
    (None, body)
}

impl EmailInner {
    fn account_id(&self) -> &str {
        self.lifecycle.account_id()
    }

    fn parse(&self, mail: &RawMail) -> Option<UnifiedMessage> {
        let parsed = MessageParser::default().parse(&mail.bytes)?;
        let from = parsed.from().and_then(|addr| addr.first());
        let address = from
            .and_then(|a| a.address())
            .map_or_else(|| "unknown".to_string(), str::to_lowercase);
        let external_id = parsed
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("imap:{}:{}", self.config.imap_folder, mail.uid));

        let mut msg = UnifiedMessage::incoming(
            Platform::Email,
            self.account_id(),
            external_id,
            address.clone(),
            address.clone(),
        );
        msg.sender_name = resolve_sender_name(from.and_then(|a| a.name()), None, &address);
        msg.recipient_id = Some(self.config.from_address.clone());

        if let Some(ts) = parsed.date().and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))
                .and_then(|date| date.and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second)))
                .map(|naive| {
                    let offset = i64::from(d.tz_hour) * 3600 + i64::from(d.tz_minute) * 60;
                    let offset = if d.tz_before_gmt { -offset } else { offset };
                    naive.and_utc() - chrono::Duration::seconds(offset)
                })
        }) {
            msg.timestamp = ts;
        }

        let text = parsed
            .body_text(0)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| parsed.body_html(0).map(|html| strip_html(html.as_ref())))
            .filter(|t| !t.is_empty());

        let attachment = parsed.attachments().next().map(|part| {
            let mime = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into());
            let mut media = MediaReference::new(format!("imap:{}:{}:0", self.config.imap_folder, mail.uid));
            media.file_name = MimeHeaders::attachment_name(part).map(str::to_string);
            media.size = Some(part.contents().len() as u64);
            let kind = attachment_kind(&mime);
            media.mime_type = Some(mime);
            (kind, media)
        });

        let probe = ContentProbe {
            text: text.is_some(),
            photo: matches!(attachment, Some((Kind::Photo, _))),
            audio: matches!(attachment, Some((Kind::Audio, _))),
            video: matches!(attachment, Some((Kind::Video, _))),
            document: matches!(attachment, Some((Kind::Document, _))),
            ..Default::default()
        };
        msg.content_type = probe.classify();
        msg.text = text;
        msg.media = attachment.map(|(_, media)| media);
        msg.raw = json!({
            "uid": mail.uid,
            "subject": parsed.subject(),
            "message_id": parsed.message_id(),
            "in_reply_to": parsed.in_reply_to().as_text(),
            "folder": self.config.imap_folder,
        });
        Some(msg)
    }

    fn compose(
        &self,
        recipient: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> Result<(Message, String), SendError> {
        let from: Address = self
            .config
            .from_address
            .parse()
            .map_err(|e| SendError::validation(format!("invalid from address: {e}")))?;
        let to: Address = recipient
            .parse()
            .map_err(|e| SendError::validation(format!("invalid recipient `{recipient}`: {e}")))?;

        let raw_body = match content {
            OutboundContent::Text(text) => text.clone(),
            OutboundContent::Media { url, caption, .. } => match caption {
                Some(caption) => format!("{caption}\n\n{url}"),
                None => url.clone(),
            },
        };
        let (inline_subject, body) = split_subject(&raw_body);
        if body.trim().is_empty() {
            return Err(SendError::validation("empty message body"));
        }
        let subject = options
            .subject
            .as_deref()
            .or(inline_subject)
            .unwrap_or(DEFAULT_SUBJECT);

        let domain = self
            .config
            .from_address
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain);
        let message_id = format!("<{}@{domain}>", Uuid::new_v4());

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .message_id(Some(message_id.clone()));
        if let Some(reply_to) = &options.reply_to {
            builder = builder.in_reply_to(reply_to.clone()).references(reply_to.clone());
        }
        let content_type = if options.html {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };
        let message = builder
            .header(content_type)
            .body(body.to_string())
            .map_err(|e| SendError::validation(e.to_string()))?;
        Ok((message, message_id))
    }

    async fn mailbox_loop(self: Arc<Self>, mut mailbox: Box<dyn MailboxSession>) -> LoopExit {
        let keepalive = Duration::from_secs(self.config.idle_keepalive_secs.max(1));
        loop {
            let mails = match mailbox.fetch_unseen().await {
                Ok(mails) => mails,
                Err(e) => return LoopExit::Lost(format!("fetch failed: {e}")),
            };
            if !mails.is_empty() {
                debug!(account_id = %self.account_id(), count = mails.len(), "new mail");
            }
            for mail in &mails {
                let Some(message) = self.parse(mail) else {
                    warn!(account_id = %self.account_id(), uid = mail.uid, "unparseable message skipped");
                    continue;
                };
                if self.gate.admit(&message, &[]) {
                    self.lifecycle.events().message(message).await;
                }
            }

            match mailbox.wait_for_mail(keepalive).await {
                Ok(MailboxSignal::NewMail) => {}
                Ok(MailboxSignal::Timeout) => {
                    if let Err(e) = mailbox.noop().await {
                        return LoopExit::Lost(format!("NOOP failed: {e}"));
                    }
                }
                Err(e) => return LoopExit::Lost(format!("IDLE failed: {e}")),
            }
        }
    }
}

#[async_trait]
impl Connector for EmailInner {
    async fn open(self: Arc<Self>, ticket: &ConnectTicket) -> Result<OpenOutcome, ChannelError> {
        let mailbox = self.imap.open().await?;
        info!(
            account_id = %self.account_id(),
            "Email watching {} on {}", self.config.imap_folder, self.config.imap_host
        );
        let metadata = ConnectionMetadata::Email {
            address: self.config.from_address.clone(),
            mailbox: self.config.imap_folder.clone(),
        };
        if let Err(e) = self
            .lifecycle
            .store()
            .update_connection_metadata(self.account_id(), &metadata)
            .await
        {
            warn!(account_id = %self.account_id(), "metadata update failed: {e:#}");
        }
        let task = Arc::clone(&self).mailbox_loop(mailbox);
        self.lifecycle.spawn_bound(ticket, self.clone(), task);
        Ok(OpenOutcome::Ready)
    }
}

#[async_trait]
impl PlatformClient for EmailClient {
    fn account_id(&self) -> &str {
        self.inner.account_id()
    }

    fn platform(&self) -> Platform {
        Platform::Email
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
        let (message, message_id) = self.inner.compose(recipient, content, options)?;
        let request = SendRequest {
            platform: Platform::Email,
            account_id: self.account_id(),
            recipient,
            operation: content.operation(),
            flood_wait: FloodWaitPolicy::Propagate,
        };
        let smtp = &self.inner.smtp;
        let message = &message;
        let message_id = message_id.as_str();
        let receipt = self
            .inner
            .pipeline
            .execute(request, || async move {
                smtp.deliver(message.clone()).await?;
                Ok(SendReceipt::now(message_id))
            })
            .await?;
        info!("Email sent to {}", recipient);
        Ok(receipt)
    }

    fn status(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{mail, FakeImap, FakeSmtp};
    use super::*;
    use crate::channels::test_support::context;
    use crate::channels::traits::ChannelEvent;
    use std::sync::atomic::Ordering;

    fn config() -> EmailConfig {
        EmailConfig {
            imap_host: "imap.example.org".into(),
            imap_port: 993,
            imap_folder: "INBOX".into(),
            smtp_host: "smtp.example.org".into(),
            smtp_port: 587,
            smtp_tls: true,
            username: "bot@example.org".into(),
            password: "secret".into(),
            from_address: "bot@example.org".into(),
            idle_keepalive_secs: 300,
        }
    }

    fn client(imap: Arc<FakeImap>) -> (EmailClient, Arc<FakeSmtp>, tokio::sync::mpsc::Receiver<ChannelEvent>) {
        let (ctx, rx) = context("mail", vec![]);
        let smtp = Arc::new(FakeSmtp::default());
        (EmailClient::with_transports(config(), imap, smtp.clone(), &ctx), smtp, rx)
    }

    #[test]
    fn build_imap_tls_config_succeeds() {
        assert!(build_imap_tls_config().is_ok());
    }

    #[test]
    fn parse_plain_mail() {
        let (c, _, _) = client(Arc::new(FakeImap::default()));
        let msg = c.parse(&mail(7, Some("<abc@example.com>"), "Hi there")).unwrap();
        assert_eq!(msg.external_id, "abc@example.com");
        assert_eq!(msg.sender_id, "ann@example.com");
        assert_eq!(msg.sender_name, "Ann Example");
        assert_eq!(msg.text.as_deref(), Some("Hi there"));
        assert_eq!(msg.content_type, Kind::Text);
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(msg.raw["subject"], "Hello 7");
    }

    #[test]
    fn missing_message_id_falls_back_to_uid() {
        let (c, _, _) = client(Arc::new(FakeImap::default()));
        let msg = c.parse(&mail(42, None, "body")).unwrap();
        assert_eq!(msg.external_id, "imap:INBOX:42");
    }

    #[test]
    fn html_only_mail_is_stripped() {
        let (c, _, _) = client(Arc::new(FakeImap::default()));
        let raw = "From: a@b.io\r\nSubject: x\r\nContent-Type: text/html\r\n\r\n<p>Hello <b>World</b></p>\r\n";
        let msg = c
            .parse(&RawMail {
                uid: 1,
                bytes: raw.as_bytes().to_vec(),
            })
            .unwrap();
        let text = msg.text.unwrap();
        assert!(text.contains("Hello") && text.contains("World"), "{text}");
        assert!(!text.contains('<'), "{text}");
    }

    #[tokio::test]
    async fn three_new_mails_yield_three_messages() {
        let imap = Arc::new(FakeImap::default());
        imap.batches.lock().push_back(vec![
            mail(1, Some("<m1@example.com>"), "one"),
            mail(2, Some("<m2@example.com>"), "two"),
            mail(3, None, "three"),
        ]);
        let (c, _, mut rx) = client(imap.clone());

        assert_eq!(c.connect().await.unwrap(), ConnectionState::Connected);

        let mut ids = Vec::new();
        let mut transitions = Vec::new();
        while ids.len() < 3 {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(ChannelEvent::Message(m))) => ids.push(m.external_id),
                Ok(Some(ChannelEvent::StatusChange { old, new, .. })) => transitions.push((old, new)),
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert_eq!(ids, vec!["m1@example.com", "m2@example.com", "imap:INBOX:3"]);
        assert_eq!(
            transitions,
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );
        c.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_noop_reconnects() {
        let imap = Arc::new(FakeImap {
            noop_fails: true,
            ..Default::default()
        });
        let (c, _, _rx) = client(imap.clone());
        c.connect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(305)).await;
        assert!(imap.opens.load(Ordering::SeqCst) >= 2);
        c.disconnect().await;
    }

    #[test]
    fn subject_from_first_line_or_default() {
        let (c, _, _) = client(Arc::new(FakeImap::default()));
        let (_, id) = c
            .compose(
                "ann@example.com",
                &OutboundContent::text("Subject: Invoice\nPlease find it attached."),
                &SendOptions::default(),
            )
            .unwrap();
        assert!(id.ends_with("@example.org>"));

        let (message, _) = c
            .compose("ann@example.com", &OutboundContent::text("just text"), &SendOptions::default())
            .unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: Message"));

        let (message, _) = c
            .compose(
                "ann@example.com",
                &OutboundContent::text("Subject: Invoice\nPlease find it attached."),
                &SendOptions::default(),
            )
            .unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert_eq!(formatted.matches("Subject: Invoice").count(), 1);
        assert!(formatted.contains("Please find it attached."));
    }

    #[test]
    fn reply_sets_threading_headers() {
        let (c, _, _) = client(Arc::new(FakeImap::default()));
        let (message, _) = c
            .compose(
                "ann@example.com",
                &OutboundContent::text("<p>ok</p>"),
                &SendOptions {
                    reply_to: Some("<abc@example.com>".into()),
                    html: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("In-Reply-To: <abc@example.com>"));
        assert!(formatted.contains("References: <abc@example.com>"));
        assert!(formatted.contains("text/html"));
    }

    #[test]
    fn invalid_recipient_is_validation_error() {
        let (c, _, _) = client(Arc::new(FakeImap::default()));
        let err = c
            .compose("not an address", &OutboundContent::text("x"), &SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, SendError::Validation(_)));
    }

    #[tokio::test]
    async fn send_delivers_through_pipeline() {
        let (c, smtp, _) = client(Arc::new(FakeImap::default()));
        let receipt = c
            .send("ann@example.com", &OutboundContent::text("hello"), &SendOptions::default())
            .await
            .unwrap();
        assert!(receipt.id.starts_with('<'));
        assert_eq!(smtp.delivered.lock().len(), 1);
    }
}
