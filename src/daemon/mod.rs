use crate::channels::{
    ChannelEvent, ClientContext, ConnectionState, EmailClient, EventSink, MtprotoFactory, OutboundContent, Platform,
    PlatformClient, SendOptions, SendReceipt, TelegramBotClient, TelegramUserClient, WebTransportFactory,
    WhatsAppBusinessClient, WhatsAppWebClient,
};
use crate::config::{Config, PlatformCredentials};
use crate::delivery::{DeadLetterSink, LogDeadLetterSink, OutboundPipeline};
use crate::error::{ChannelError, SendError};
use crate::media::MediaCache;
use crate::session::{FileSessionStore, SessionStore};
use crate::status::{InMemoryStatusStore, PlatformAccount};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const EVENT_BUFFER: usize = 1024;
const MEDIA_PURGE_SECONDS: u64 = 60 * 60;

/// Consumer of everything the bridge receives.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, event: ChannelEvent);
}

/// Default dispatcher: structured log lines only.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(msg) => tracing::info!(
                account_id = %msg.account_id,
                platform = %msg.platform,
                chat_id = %msg.chat_id,
                sender = %msg.sender_name,
                kind = ?msg.content_type,
                "inbound message"
            ),
            ChannelEvent::StatusChange { account_id, old, new } => {
                tracing::info!(%account_id, ?old, ?new, "status change");
            }
            ChannelEvent::Error { account_id, detail } => tracing::warn!(%account_id, "{detail}"),
            ChannelEvent::Auth {
                account_id,
                state,
                detail,
            } => tracing::info!(%account_id, ?state, detail = detail.as_deref().unwrap_or_default(), "auth step"),
        }
    }
}

/// Concrete client behind an account id. Webhook routes need the concrete
/// type; everything else goes through [`PlatformClient`].
#[derive(Clone)]
pub enum AccountClient {
    WhatsappWeb(Arc<WhatsAppWebClient>),
    WhatsappBusiness(Arc<WhatsAppBusinessClient>),
    TelegramBot(Arc<TelegramBotClient>),
    TelegramUser(Arc<TelegramUserClient>),
    Email(Arc<EmailClient>),
}

impl AccountClient {
    pub fn client(&self) -> &dyn PlatformClient {
        match self {
            AccountClient::WhatsappWeb(c) => c.as_ref(),
            AccountClient::WhatsappBusiness(c) => c.as_ref(),
            AccountClient::TelegramBot(c) => c.as_ref(),
            AccountClient::TelegramUser(c) => c.as_ref(),
            AccountClient::Email(c) => c.as_ref(),
        }
    }
}

/// Owns one client per enabled account.
pub struct AccountManager {
    accounts: BTreeMap<String, AccountClient>,
    store: Arc<InMemoryStatusStore>,
    pipeline: Arc<OutboundPipeline>,
    media: Option<Arc<MediaCache>>,
    events: EventSink,
}

pub struct AccountManagerBuilder {
    config: Config,
    web_transport: Option<WebTransportFactory>,
    mtproto: Option<MtprotoFactory>,
    sessions: Option<Arc<dyn SessionStore>>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl AccountManagerBuilder {
    /// Driver for WhatsApp Web sessions. Without one, WhatsApp Web accounts
    /// are skipped.
    pub fn whatsapp_web(mut self, factory: WebTransportFactory) -> Self {
        self.web_transport = Some(factory);
        self
    }

    /// MTProto driver for Telegram user accounts. Without one, those
    /// accounts are skipped.
    pub fn mtproto(mut self, factory: MtprotoFactory) -> Self {
        self.mtproto = Some(factory);
        self
    }

    pub fn sessions(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn build(self, events: EventSink) -> Result<AccountManager> {
        let config = self.config;
        config.validate()?;

        let pipeline = Arc::new(
            OutboundPipeline::new(config.delivery.rate_limit, config.delivery.circuit_breaker)
                .with_dead_letter_sink(self.dead_letters),
        );
        let store = Arc::new(InMemoryStatusStore::new());
        let media = config.media.enabled.then(|| {
            Arc::new(MediaCache::new(
                config.media_cache_dir(),
                Duration::from_secs(config.media.ttl_secs),
            ))
        });
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(FileSessionStore::new(config.sessions_dir())));

        let mut accounts = BTreeMap::new();
        for account in config.accounts.iter().filter(|a| a.enabled) {
            let ctx = ClientContext::new(
                account.id.clone(),
                account.reconnect_policy(),
                events.clone(),
                store.clone(),
                pipeline.clone(),
            )
            .with_allowed_senders(account.allowed_senders.clone())
            .with_media(media.clone());

            let client = match &account.platform {
                PlatformCredentials::WhatsappWeb(cfg) => {
                    let Some(factory) = &self.web_transport else {
                        tracing::warn!(account_id = %account.id, "no WhatsApp Web driver installed; account skipped");
                        continue;
                    };
                    let transport = factory(&account.id, cfg);
                    AccountClient::WhatsappWeb(Arc::new(WhatsAppWebClient::new(cfg.clone(), transport, &ctx)))
                }
                PlatformCredentials::WhatsappBusiness(cfg) => {
                    AccountClient::WhatsappBusiness(Arc::new(WhatsAppBusinessClient::new(cfg.clone(), &ctx)))
                }
                PlatformCredentials::TelegramBot(cfg) => {
                    AccountClient::TelegramBot(Arc::new(TelegramBotClient::new(cfg.clone(), &ctx)))
                }
                PlatformCredentials::TelegramUser(cfg) => {
                    let Some(factory) = &self.mtproto else {
                        tracing::warn!(account_id = %account.id, "no MTProto driver installed; account skipped");
                        continue;
                    };
                    let session = factory(&account.id, cfg);
                    AccountClient::TelegramUser(Arc::new(TelegramUserClient::new(
                        cfg.clone(),
                        session,
                        sessions.clone(),
                        &ctx,
                    )))
                }
                PlatformCredentials::Email(cfg) => AccountClient::Email(Arc::new(
                    EmailClient::new(cfg.clone(), &ctx)
                        .with_context(|| format!("building e-mail account `{}`", account.id))?,
                )),
            };
            store.register(&account.id, account.platform());
            accounts.insert(account.id.clone(), client);
        }

        Ok(AccountManager {
            accounts,
            store,
            pipeline,
            media,
            events,
        })
    }
}

impl AccountManager {
    pub fn builder(config: Config) -> AccountManagerBuilder {
        AccountManagerBuilder {
            config,
            web_transport: None,
            mtproto: None,
            sessions: None,
            dead_letters: Arc::new(LogDeadLetterSink),
        }
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountClient> {
        self.accounts.get(account_id)
    }

    pub fn account_ids(&self) -> impl Iterator<Item = &str> {
        self.accounts.keys().map(String::as_str)
    }

    pub fn whatsapp_business(&self, account_id: &str) -> Option<Arc<WhatsAppBusinessClient>> {
        match self.accounts.get(account_id)? {
            AccountClient::WhatsappBusiness(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn telegram_bot(&self, account_id: &str) -> Option<Arc<TelegramBotClient>> {
        match self.accounts.get(account_id)? {
            AccountClient::TelegramBot(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn pipeline(&self) -> &Arc<OutboundPipeline> {
        &self.pipeline
    }

    fn client(&self, account_id: &str) -> Result<&dyn PlatformClient, ChannelError> {
        self.accounts
            .get(account_id)
            .map(AccountClient::client)
            .ok_or_else(|| ChannelError::Config(format!("unknown account `{account_id}`")))
    }

    pub async fn connect(&self, account_id: &str) -> Result<ConnectionState, ChannelError> {
        self.client(account_id)?.connect().await
    }

    pub async fn disconnect(&self, account_id: &str) -> Result<(), ChannelError> {
        self.client(account_id)?.disconnect().await;
        Ok(())
    }

    /// Connect every account concurrently. Failures are logged per account
    /// and do not stop the others.
    pub async fn connect_all(&self) -> Vec<(String, Result<ConnectionState, ChannelError>)> {
        let attempts = self.accounts.iter().map(|(id, account)| async move {
            let result = account.client().connect().await;
            match &result {
                Ok(state) => tracing::info!(account_id = %id, ?state, "account started"),
                Err(e) => tracing::error!(account_id = %id, "account failed to start: {e}"),
            }
            (id.clone(), result)
        });
        futures_util::future::join_all(attempts).await
    }

    pub async fn disconnect_all(&self) {
        let closes = self.accounts.values().map(|account| account.client().disconnect());
        futures_util::future::join_all(closes).await;
    }

    pub async fn send(
        &self,
        account_id: &str,
        recipient: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> Result<SendReceipt, SendError> {
        let client = self
            .client(account_id)
            .map_err(|e| SendError::validation(e.to_string()))?;
        client.send(recipient, content, options).await
    }

    pub fn provide_auth_input(&self, account_id: &str, value: &str) -> Result<(), ChannelError> {
        self.client(account_id)?.provide_auth_input(value)
    }

    pub fn statuses(&self) -> Vec<PlatformAccount> {
        self.store.snapshot()
    }

    pub fn platform_of(&self, account_id: &str) -> Option<Platform> {
        self.accounts.get(account_id).map(|a| a.client().platform())
    }

    pub fn media(&self) -> Option<&Arc<MediaCache>> {
        self.media.as_ref()
    }
}

/// Forward client events to the dispatcher until every sender is gone.
pub fn spawn_dispatch(mut rx: mpsc::Receiver<ChannelEvent>, dispatcher: Arc<dyn Dispatcher>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            dispatcher.dispatch(event).await;
        }
        tracing::debug!("event stream closed; dispatcher stopped");
    })
}

fn spawn_media_purger(media: Arc<MediaCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(MEDIA_PURGE_SECONDS));
        loop {
            interval.tick().await;
            match media.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("purged {n} expired media files"),
                Err(e) => tracing::warn!("media purge failed: {e:#}"),
            }
        }
    })
}

/// Run accounts and the webhook gateway until Ctrl-C.
pub async fn run(config: Config, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;

    let (events, rx) = EventSink::channel(EVENT_BUFFER);
    let manager = Arc::new(AccountManager::builder(config).build(events)?);

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_dispatch(rx, dispatcher)];
    if let Some(media) = manager.media() {
        handles.push(spawn_media_purger(media.clone()));
    }

    let gateway = {
        let manager = manager.clone();
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::gateway::run_gateway(&host, port, manager).await {
                tracing::error!("gateway stopped: {e:#}");
            }
        })
    };

    manager.connect_all().await;

    println!("📡 channelbridge started");
    println!("   Gateway:  http://{host}:{port}");
    println!("   Accounts: {}", manager.account_ids().collect::<Vec<_>>().join(", "));
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    gateway.abort();
    let _ = gateway.await;
    manager.disconnect_all().await;
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::whatsapp_web::fake::FakeWebTransport;
    use crate::config::{AccountConfig, TelegramBotConfig, UpdateMode, WhatsAppBusinessConfig, WhatsAppWebConfig};
    use crate::session::FileSessionStore;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.workspace_dir = tmp.path().join("workspace");
        config.config_path = tmp.path().join("config.toml");
        config.media.enabled = false;
        config.accounts = vec![
            AccountConfig {
                id: "wa-biz".into(),
                enabled: true,
                allowed_senders: vec![],
                reconnect: None,
                platform: PlatformCredentials::WhatsappBusiness(WhatsAppBusinessConfig {
                    phone_number_id: "123".into(),
                    access_token: "token".into(),
                    verify_token: "verify".into(),
                    app_secret: None,
                    api_base: "http://127.0.0.1:9".into(),
                }),
            },
            AccountConfig {
                id: "bot".into(),
                enabled: false,
                allowed_senders: vec![],
                reconnect: None,
                platform: PlatformCredentials::TelegramBot(TelegramBotConfig {
                    bot_token: "1:x".into(),
                    mode: UpdateMode::Polling,
                    webhook_url: None,
                    webhook_secret: None,
                    api_base: "http://127.0.0.1:9".into(),
                    poll_timeout_secs: 1,
                }),
            },
            AccountConfig {
                id: "wa-web".into(),
                enabled: true,
                allowed_senders: vec![],
                reconnect: None,
                platform: PlatformCredentials::WhatsappWeb(WhatsAppWebConfig::default()),
            },
        ];
        config
    }

    #[test]
    fn disabled_accounts_and_missing_drivers_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let (events, _rx) = EventSink::channel(8);
        let manager = AccountManager::builder(config(&tmp)).build(events).unwrap();
        assert_eq!(manager.account_ids().collect::<Vec<_>>(), vec!["wa-biz"]);
        assert!(manager.whatsapp_business("wa-biz").is_some());
        assert!(manager.telegram_bot("bot").is_none());

        let statuses = manager.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn web_driver_enables_account_and_status_tracks_connect() {
        let tmp = TempDir::new().unwrap();
        let (events, _rx) = EventSink::channel(64);
        let transport = Arc::new(FakeWebTransport::default());
        let factory: WebTransportFactory = {
            let transport = transport.clone();
            Arc::new(move |_: &str, _: &WhatsAppWebConfig| -> Arc<dyn crate::channels::WhatsAppWebTransport> {
                transport.clone()
            })
        };
        let manager = AccountManager::builder(config(&tmp))
            .whatsapp_web(factory)
            .sessions(Arc::new(FileSessionStore::new(tmp.path().join("sessions"))))
            .build(events)
            .unwrap();
        assert_eq!(manager.platform_of("wa-web"), Some(Platform::WhatsappWeb));

        assert_eq!(manager.connect("wa-web").await.unwrap(), ConnectionState::Connecting);
        transport.push(crate::channels::whatsapp_web::WebEvent::Ready { phone: None }).await;

        let mut connected = false;
        for _ in 0..50 {
            if manager
                .statuses()
                .iter()
                .any(|a| a.id == "wa-web" && a.status == ConnectionState::Connected)
            {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connected);
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (events, _rx) = EventSink::channel(8);
        let manager = AccountManager::builder(config(&tmp)).build(events).unwrap();

        assert!(matches!(manager.connect("nope").await, Err(ChannelError::Config(_))));
        let err = manager
            .send("nope", "x", &OutboundContent::text("hi"), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Validation(_)));
        assert!(manager.provide_auth_input("wa-biz", "12345").is_err());
    }

    #[tokio::test]
    async fn dispatch_forwards_until_closed() {
        struct Counting(parking_lot::Mutex<usize>);

        #[async_trait]
        impl Dispatcher for Counting {
            async fn dispatch(&self, _event: ChannelEvent) {
                *self.0.lock() += 1;
            }
        }

        let (events, rx) = EventSink::channel(8);
        let counting = Arc::new(Counting(parking_lot::Mutex::new(0)));
        let handle = spawn_dispatch(rx, counting.clone());
        events.error("acc", "one").await;
        events.error("acc", "two").await;
        drop(events);
        handle.await.unwrap();
        assert_eq!(*counting.0.lock(), 2);
    }
}
