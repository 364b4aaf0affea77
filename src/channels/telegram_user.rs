//! Telegram user account over a persistent MTProto session.
//!
//! Login is a multi-step exchange (phone, code, optional 2FA password) where
//! each step waits for a value supplied from outside through
//! [`PlatformClient::provide_auth_input`]. Scheduled reconnects never open
//! those prompts: they only resume the saved session, bounded by
//! `session_timeout_secs`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::lifecycle::{ConnectTicket, Connector, KeepAliveMode, Lifecycle, LoopExit, OpenOutcome};
use super::message::{
    ConnectionState, ContentType, MediaReference, OutboundContent, Platform, SendOptions, SendReceipt,
    UnifiedMessage,
};
use super::normalize::{infer_group, resolve_sender_name, ContentProbe, InboundGate};
use super::traits::{ChannelEvent, PlatformClient};
use super::ClientContext;
use crate::config::TelegramUserConfig;
use crate::delivery::{FloodWaitPolicy, OutboundPipeline, SendRequest};
use crate::error::{AuthFailure, ChannelError, SendError};
use crate::session::SessionStore;
use crate::status::ConnectionMetadata;

/// Interactive login progress. Orthogonal to `ConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Idle,
    PhoneRequired,
    CodeRequired,
    PasswordRequired,
    Connected,
    Error,
}

impl AuthState {
    pub fn awaits_input(self) -> bool {
        matches!(
            self,
            AuthState::PhoneRequired | AuthState::CodeRequired | AuthState::PasswordRequired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInOutcome {
    SignedIn,
    PasswordRequired,
}

/// One new or edited message as the session reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtprotoUpdate {
    pub message_id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    /// Name carried on the update itself.
    pub sender_name: Option<String>,
    pub sender_username: Option<String>,
    /// Native flag; absent or wrong for some peer types.
    pub is_group: Option<bool>,
    pub text: Option<String>,
    /// `photo`, `audio`, `voice`, `video`, `document`, `sticker`, `geo`,
    /// `contact` or `poll`.
    pub media_kind: Option<String>,
    pub media: Option<MediaReference>,
    pub date: i64,
    pub edit_date: Option<i64>,
    pub outgoing: bool,
}

/// MTProto driver for one account.
#[async_trait]
pub trait MtprotoSession: Send + Sync {
    /// Open the socket, resuming `saved_session` when given. Updates arrive on
    /// the returned channel until the socket closes.
    async fn connect(&self, saved_session: Option<&str>) -> Result<mpsc::Receiver<MtprotoUpdate>, ChannelError>;

    /// `None` when the server answer was inconclusive.
    async fn is_authorized(&self) -> Result<Option<bool>, ChannelError>;

    async fn request_login_code(&self, phone: &str) -> Result<(), ChannelError>;

    async fn sign_in(&self, code: &str) -> Result<SignInOutcome, ChannelError>;

    async fn check_password(&self, password: &str) -> Result<(), ChannelError>;

    /// Serialized session string for persistence.
    async fn export_session(&self) -> Result<String, ChannelError>;

    /// Display name of a user, chat or channel, when resolvable.
    async fn resolve_peer_name(&self, peer_id: i64) -> Option<String>;

    /// Returns the new message id. Flood-waits surface as
    /// `SendError::RateLimit { limit_type: FloodWait, .. }`.
    async fn send(&self, peer: &str, content: &OutboundContent, reply_to: Option<i64>) -> Result<i64, SendError>;

    async fn disconnect(&self);
}

pub type MtprotoFactory = Arc<dyn Fn(&str, &TelegramUserConfig) -> Arc<dyn MtprotoSession> + Send + Sync>;

/// Pending `provide(value)` slot.
#[derive(Default)]
struct AuthSlot {
    pending: Mutex<Option<(AuthState, oneshot::Sender<String>)>>,
}

impl AuthSlot {
    fn open(&self, state: AuthState) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some((state, tx));
        rx
    }

    fn provide(&self, value: &str) -> Result<AuthState, ChannelError> {
        let Some((state, tx)) = self.pending.lock().take() else {
            return Err(ChannelError::Config("no auth input is pending".into()));
        };
        if tx.send(value.trim().to_string()).is_err() {
            return Err(ChannelError::Config("auth flow was cancelled".into()));
        }
        Ok(state)
    }

    fn close(&self) {
        self.pending.lock().take();
    }
}

pub struct TelegramUserClient {
    inner: Arc<UserInner>,
}

struct UserInner {
    config: TelegramUserConfig,
    session: Arc<dyn MtprotoSession>,
    sessions: Arc<dyn SessionStore>,
    lifecycle: Arc<Lifecycle>,
    pipeline: Arc<OutboundPipeline>,
    gate: InboundGate,
    auth: RwLock<AuthState>,
    slot: AuthSlot,
}

impl TelegramUserClient {
    pub fn new(
        config: TelegramUserConfig,
        session: Arc<dyn MtprotoSession>,
        sessions: Arc<dyn SessionStore>,
        ctx: &ClientContext,
    ) -> Self {
        Self {
            inner: Arc::new(UserInner {
                config,
                session,
                sessions,
                lifecycle: ctx.lifecycle(Platform::TelegramUser),
                pipeline: Arc::clone(&ctx.pipeline),
                gate: ctx.gate(),
                auth: RwLock::new(AuthState::Idle),
                slot: AuthSlot::default(),
            }),
        }
    }

    pub fn auth_state(&self) -> AuthState {
        *self.inner.auth.read()
    }

    pub async fn normalize(&self, update: &MtprotoUpdate) -> UnifiedMessage {
        self.inner.normalize(update).await
    }
}

impl UserInner {
    fn account_id(&self) -> &str {
        self.lifecycle.account_id()
    }

    fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.config.session_timeout_secs.max(1))
    }

    async fn set_auth(&self, state: AuthState, detail: Option<String>) {
        let previous = std::mem::replace(&mut *self.auth.write(), state);
        if previous == state && detail.is_none() {
            return;
        }
        debug!(account_id = %self.account_id(), ?state, "auth state");
        let metadata = ConnectionMetadata::TelegramUser {
            auth_state: state,
            phone: self.config.phone.clone(),
        };
        if let Err(e) = self
            .lifecycle
            .store()
            .update_connection_metadata(self.account_id(), &metadata)
            .await
        {
            warn!(account_id = %self.account_id(), "metadata update failed: {e:#}");
        }
        self.lifecycle
            .events()
            .emit(ChannelEvent::Auth {
                account_id: self.account_id().to_string(),
                state,
                detail,
            })
            .await;
    }

    /// Ask for one value. `None` when the cycle was cancelled.
    async fn prompt(&self, ticket: &ConnectTicket, state: AuthState) -> Option<String> {
        let rx = self.slot.open(state);
        self.set_auth(state, None).await;
        tokio::select! {
            () = ticket.cancel.cancelled() => {
                self.slot.close();
                None
            }
            value = rx => value.ok(),
        }
    }

    async fn persist_session(&self) -> Result<(), ChannelError> {
        let exported = self.session.export_session().await?;
        self.sessions
            .save(self.account_id(), &exported)
            .await
            .map_err(|e| ChannelError::connection(format!("session store: {e:#}")))
    }

    async fn interactive_login(self: Arc<Self>, ticket: ConnectTicket, updates: mpsc::Receiver<MtprotoUpdate>) -> LoopExit {
        match self.login_steps(&ticket).await {
            Ok(true) => {
                if let Err(e) = self.persist_session().await {
                    warn!(account_id = %self.account_id(), "saving new session failed: {e}");
                }
                self.go_live(&ticket, updates).await;
                LoopExit::Done
            }
            Ok(false) => {
                debug!(account_id = %self.account_id(), "login abandoned");
                LoopExit::Done
            }
            Err(err) => {
                let reason = auth_reason(&err);
                self.set_auth(AuthState::Error, Some(reason.to_string())).await;
                LoopExit::Terminal(format!("telegram login failed: {err}"))
            }
        }
    }

    /// `Ok(false)` when cancelled mid-way.
    async fn login_steps(&self, ticket: &ConnectTicket) -> Result<bool, ChannelError> {
        let phone = match self.config.phone.clone().filter(|p| !p.trim().is_empty()) {
            Some(phone) => phone,
            None => match self.prompt(ticket, AuthState::PhoneRequired).await {
                Some(phone) => phone,
                None => return Ok(false),
            },
        };
        self.session.request_login_code(&phone).await?;

        let Some(code) = self.prompt(ticket, AuthState::CodeRequired).await else {
            return Ok(false);
        };
        if self.session.sign_in(&code).await? == SignInOutcome::PasswordRequired {
            let Some(password) = self.prompt(ticket, AuthState::PasswordRequired).await else {
                return Ok(false);
            };
            self.session.check_password(&password).await?;
        }
        Ok(true)
    }

    /// Session is authorized: flip to connected and start the update loop and
    /// periodic session re-persistence.
    async fn go_live(self: &Arc<Self>, ticket: &ConnectTicket, updates: mpsc::Receiver<MtprotoUpdate>) {
        self.set_auth(AuthState::Connected, None).await;
        if !self.lifecycle.mark_connected(ticket.generation).await {
            return;
        }
        self.spawn_loops(ticket, updates);
    }

    fn spawn_loops(self: &Arc<Self>, ticket: &ConnectTicket, updates: mpsc::Receiver<MtprotoUpdate>) {
        let task = Arc::clone(self).update_loop(updates);
        self.lifecycle.spawn_bound(ticket, Arc::clone(self) as Arc<dyn Connector>, task);

        let this = Arc::clone(self);
        self.lifecycle.spawn_keepalive(
            ticket,
            Duration::from_secs(self.config.session_persist_secs.max(1)),
            KeepAliveMode::BestEffort,
            Arc::clone(self) as Arc<dyn Connector>,
            move || {
                let this = Arc::clone(&this);
                async move { this.persist_session().await }
            },
        );
    }

    async fn update_loop(self: Arc<Self>, mut updates: mpsc::Receiver<MtprotoUpdate>) -> LoopExit {
        while let Some(update) = updates.recv().await {
            if update.outgoing {
                continue;
            }
            let message = self.normalize(&update).await;
            let username = update.sender_username.as_deref().unwrap_or_default();
            if self.gate.admit(&message, &[username]) {
                self.lifecycle.events().message(message).await;
            }
        }
        LoopExit::Lost("MTProto update stream closed".into())
    }

    async fn normalize(&self, u: &MtprotoUpdate) -> UnifiedMessage {
        let chat_id = u.chat_id.to_string();
        let sender_id = u.sender_id.map_or_else(|| chat_id.clone(), |id| id.to_string());
        let external_id = match u.edit_date {
            Some(edit) => format!("{chat_id}:{}:edit:{edit}", u.message_id),
            None => format!("{chat_id}:{}", u.message_id),
        };
        let mut msg = UnifiedMessage::incoming(
            Platform::TelegramUser,
            self.account_id(),
            external_id,
            chat_id.clone(),
            sender_id.clone(),
        );

        let resolved = match u.sender_id {
            Some(id) => self.session.resolve_peer_name(id).await,
            None => None,
        };
        let inline = u.sender_name.as_deref().or(u.sender_username.as_deref());
        msg.sender_name = resolve_sender_name(resolved.as_deref(), inline, &sender_id);
        msg.is_group = infer_group(&chat_id, &sender_id, u.is_group);
        msg.is_edited = u.edit_date.is_some();
        if let Some(ts) = DateTime::<Utc>::from_timestamp(u.date, 0).filter(|_| u.date > 0) {
            msg.timestamp = ts;
        }

        let kind = u.media_kind.as_deref().unwrap_or_default();
        let probe = ContentProbe {
            text: u.text.as_deref().is_some_and(|t| !t.is_empty()) && kind.is_empty(),
            photo: kind == "photo",
            audio: kind == "audio",
            voice: kind == "voice",
            video: kind == "video",
            document: kind == "document",
            sticker: kind == "sticker",
            location: kind == "geo",
            contact: kind == "contact",
            poll: kind == "poll",
        };
        msg.content_type = probe.classify();
        msg.text = u.text.clone().filter(|t| !t.is_empty());
        msg.media = u.media.clone().filter(|_| msg.content_type.is_media());
        msg.raw = serde_json::to_value(u).unwrap_or_default();
        msg
    }
}

fn auth_reason(err: &ChannelError) -> AuthFailure {
    match err {
        ChannelError::Auth { reason, .. } => *reason,
        ChannelError::Connection(_) | ChannelError::Timeout { .. } => AuthFailure::Network,
        _ => AuthFailure::Other,
    }
}

#[async_trait]
impl Connector for UserInner {
    async fn open(self: Arc<Self>, ticket: &ConnectTicket) -> Result<OpenOutcome, ChannelError> {
        let saved = match self.sessions.load(self.account_id()).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(account_id = %self.account_id(), "loading saved session failed: {e:#}");
                None
            }
        };

        if !ticket.manual {
            let Some(saved) = saved else {
                self.set_auth(AuthState::Error, Some(AuthFailure::ExpiredSession.to_string()))
                    .await;
                return Err(ChannelError::auth(
                    AuthFailure::ExpiredSession,
                    "no saved session to resume; interactive login required",
                ));
            };
            let timeout = self.session_timeout();
            let resumed = tokio::time::timeout(timeout, async {
                let updates = self.session.connect(Some(&saved)).await?;
                let authorized = self.session.is_authorized().await?;
                Ok::<_, ChannelError>((updates, authorized))
            })
            .await;

            return match resumed {
                Err(_) => {
                    self.session.disconnect().await;
                    Err(ChannelError::Timeout {
                        secs: timeout.as_secs(),
                        context: "confirming saved MTProto session".into(),
                    })
                }
                Ok(Err(err)) => {
                    self.session.disconnect().await;
                    Err(err)
                }
                Ok(Ok((updates, Some(true)))) => {
                    self.set_auth(AuthState::Connected, None).await;
                    self.spawn_loops(ticket, updates);
                    Ok(OpenOutcome::Ready)
                }
                Ok(Ok((_, Some(false)))) => {
                    self.session.disconnect().await;
                    self.set_auth(AuthState::Error, Some(AuthFailure::ExpiredSession.to_string()))
                        .await;
                    Err(ChannelError::auth(
                        AuthFailure::ExpiredSession,
                        "saved session is no longer authorized",
                    ))
                }
                Ok(Ok((_, None))) => {
                    // Never treated as connected; retry later.
                    self.session.disconnect().await;
                    Err(ChannelError::connection("session authorization could not be confirmed"))
                }
            };
        }

        let updates = tokio::time::timeout(self.session_timeout(), self.session.connect(saved.as_deref()))
            .await
            .map_err(|_| ChannelError::Timeout {
                secs: self.session_timeout().as_secs(),
                context: "opening MTProto socket".into(),
            })??;

        let authorized = match self.session.is_authorized().await {
            Ok(authorized) => authorized,
            Err(err) => {
                self.session.disconnect().await;
                return Err(err);
            }
        };
        if authorized == Some(true) {
            info!(account_id = %self.account_id(), "resumed saved Telegram session");
            self.set_auth(AuthState::Connected, None).await;
            self.spawn_loops(ticket, updates);
            return Ok(OpenOutcome::Ready);
        }

        info!(account_id = %self.account_id(), "Telegram login required");
        let task = Arc::clone(&self).interactive_login(ticket.clone(), updates);
        self.lifecycle.spawn_bound(ticket, self.clone(), task);
        Ok(OpenOutcome::Pending)
    }
}

#[async_trait]
impl PlatformClient for TelegramUserClient {
    fn account_id(&self) -> &str {
        self.inner.account_id()
    }

    fn platform(&self) -> Platform {
        Platform::TelegramUser
    }

    async fn connect(&self) -> Result<ConnectionState, ChannelError> {
        let connector: Arc<dyn Connector> = self.inner.clone();
        self.inner.lifecycle.run_connect(connector, true).await
    }

    async fn disconnect(&self) {
        if self.status() == ConnectionState::Connected {
            if let Err(e) = self.inner.persist_session().await {
                warn!(account_id = %self.account_id(), "final session save failed: {e}");
            }
        }
        self.inner.slot.close();
        self.inner.lifecycle.disconnect().await;
        self.inner.session.disconnect().await;
        *self.inner.auth.write() = AuthState::Idle;
    }

    async fn send(
        &self,
        recipient: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> Result<SendReceipt, SendError> {
        if self.status() != ConnectionState::Connected {
            return Err(SendError::Connection("telegram session is not connected".into()));
        }
        if recipient.trim().is_empty() {
            return Err(SendError::validation("empty peer"));
        }
        if let OutboundContent::Text(text) = content {
            if text.trim().is_empty() {
                return Err(SendError::validation("empty message text"));
            }
        }
        if let OutboundContent::Media { kind, .. } = content {
            if !kind.is_media() {
                return Err(SendError::validation(format!("cannot send {kind:?} as media")));
            }
        }

        let reply_to = options
            .reply_to
            .as_deref()
            .and_then(|r| r.rsplit(':').next())
            .and_then(|id| id.parse::<i64>().ok());
        let request = SendRequest {
            platform: Platform::TelegramUser,
            account_id: self.account_id(),
            recipient,
            operation: content.operation(),
            flood_wait: FloodWaitPolicy::RetryOnce,
        };
        let session = &self.inner.session;
        self.inner
            .pipeline
            .execute(request, || async move {
                let id = session.send(recipient, content, reply_to).await?;
                Ok(SendReceipt::now(format!("{recipient}:{id}")))
            })
            .await
    }

    fn status(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    fn provide_auth_input(&self, value: &str) -> Result<(), ChannelError> {
        let state = self.inner.slot.provide(value)?;
        debug!(account_id = %self.account_id(), ?state, "auth input received");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::error::LimitType;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scriptable MTProto session.
    pub struct FakeMtproto {
        pub authorized: Mutex<Option<bool>>,
        pub needs_password: bool,
        pub connect_delay: Duration,
        pub updates: Mutex<Option<mpsc::Sender<MtprotoUpdate>>>,
        pub codes: Mutex<Vec<String>>,
        pub sends: AtomicU32,
        pub flood_first_send_ms: Option<u64>,
        pub names: Vec<(i64, String)>,
        pub auth_check_fails: AtomicBool,
    }

    impl Default for FakeMtproto {
        fn default() -> Self {
            Self {
                authorized: Mutex::new(Some(false)),
                needs_password: false,
                connect_delay: Duration::ZERO,
                updates: Mutex::new(None),
                codes: Mutex::new(Vec::new()),
                sends: AtomicU32::new(0),
                flood_first_send_ms: None,
                names: Vec::new(),
                auth_check_fails: AtomicBool::new(false),
            }
        }
    }

    impl FakeMtproto {
        pub async fn push(&self, update: MtprotoUpdate) {
            let tx = self.updates.lock().clone();
            if let Some(tx) = tx {
                let _ = tx.send(update).await;
            }
        }
    }

    #[async_trait]
    impl MtprotoSession for FakeMtproto {
        async fn connect(&self, _saved: Option<&str>) -> Result<mpsc::Receiver<MtprotoUpdate>, ChannelError> {
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            let (tx, rx) = mpsc::channel(16);
            *self.updates.lock() = Some(tx);
            Ok(rx)
        }

        async fn is_authorized(&self) -> Result<Option<bool>, ChannelError> {
            if self.auth_check_fails.load(Ordering::SeqCst) {
                return Err(ChannelError::connection("auth check RPC failed"));
            }
            Ok(*self.authorized.lock())
        }

        async fn request_login_code(&self, phone: &str) -> Result<(), ChannelError> {
            if phone.is_empty() {
                return Err(ChannelError::auth(AuthFailure::InvalidCredentials, "PHONE_NUMBER_INVALID"));
            }
            Ok(())
        }

        async fn sign_in(&self, code: &str) -> Result<SignInOutcome, ChannelError> {
            self.codes.lock().push(code.to_string());
            if code != "12345" {
                return Err(ChannelError::auth(AuthFailure::InvalidCredentials, "PHONE_CODE_INVALID"));
            }
            if self.needs_password {
                Ok(SignInOutcome::PasswordRequired)
            } else {
                *self.authorized.lock() = Some(true);
                Ok(SignInOutcome::SignedIn)
            }
        }

        async fn check_password(&self, password: &str) -> Result<(), ChannelError> {
            if password == "hunter2" {
                *self.authorized.lock() = Some(true);
                Ok(())
            } else {
                Err(ChannelError::auth(AuthFailure::InvalidCredentials, "PASSWORD_HASH_INVALID"))
            }
        }

        async fn export_session(&self) -> Result<String, ChannelError> {
            Ok("1BQANOTEu...".into())
        }

        async fn resolve_peer_name(&self, peer_id: i64) -> Option<String> {
            self.names.iter().find(|(id, _)| *id == peer_id).map(|(_, n)| n.clone())
        }

        async fn send(&self, _peer: &str, _content: &OutboundContent, _reply_to: Option<i64>) -> Result<i64, SendError> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            match self.flood_first_send_ms {
                Some(ms) if n == 0 => Err(SendError::RateLimit {
                    limit_type: LimitType::FloodWait,
                    retry_after_ms: ms,
                }),
                _ => Ok(1000 + i64::from(n)),
            }
        }

        async fn disconnect(&self) {
            self.updates.lock().take();
        }
    }
}
