//! Connection lifecycle shared by every platform client.
//!
//! Owns the state machine, the reconnect attempt counter and delay, the
//! attempt ceiling, and keep-alive scheduling. Each connect cycle gets a
//! generation id and a cancellation token; callbacks carrying an older
//! generation are dropped instead of touching the new connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::{ConnectionState, Platform};
use super::traits::{ChannelEvent, EventSink};
use crate::error::ChannelError;
use crate::status::AccountStatusStore;

/// Reconnect parameters. Configuration, not constants: each transport
/// supplies its own defaults and accounts may override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    #[serde(with = "secs")]
    pub delay: Duration,
    /// Upper bound for the linearly growing delay. Equal to `delay` for a
    /// fixed delay.
    #[serde(with = "secs")]
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            max_delay: delay,
        }
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay.max(self.delay))
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Handle for one connect cycle.
#[derive(Debug, Clone)]
pub struct ConnectTicket {
    pub generation: u64,
    /// Cancelled on disconnect, on loss of this connection, or when a newer
    /// cycle starts. Every loop spawned for this cycle must observe it.
    pub cancel: CancellationToken,
    /// `false` for scheduled reconnects: no interactive prompts allowed.
    pub manual: bool,
}

/// How `open` finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Transport is up.
    Ready,
    /// Handshake continues in the background (QR pairing, interactive auth);
    /// the client calls `mark_connected` when it completes.
    Pending,
}

/// What a client implements so the controller can (re)open its transport.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(self: Arc<Self>, ticket: &ConnectTicket) -> Result<OpenOutcome, ChannelError>;
}

/// What to do when a keep-alive tick fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveMode {
    /// A failed tick means the transport is dead: treat as connection loss.
    Probe,
    /// Log and try again on the next interval.
    BestEffort,
}

/// How a task started with [`Lifecycle::spawn_bound`] finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Finished on its own; nothing to report.
    Done,
    /// The transport went away; reconnect.
    Lost(String),
    /// Unrecoverable without operator action.
    Terminal(String),
}

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<ConnectionState, ChannelError>> + Send>>;

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    generation: u64,
    attempts: u32,
    stopped: bool,
    /// Lives across reconnects; cancelled only by `disconnect`.
    session: CancellationToken,
    current: CancellationToken,
}

pub struct Lifecycle {
    account_id: String,
    platform: Platform,
    policy: ReconnectPolicy,
    events: EventSink,
    store: Arc<dyn AccountStatusStore>,
    inner: Mutex<Inner>,
}

impl Lifecycle {
    pub fn new(
        account_id: impl Into<String>,
        platform: Platform,
        policy: ReconnectPolicy,
        events: EventSink,
        store: Arc<dyn AccountStatusStore>,
    ) -> Arc<Self> {
        let session = CancellationToken::new();
        let current = session.child_token();
        Arc::new(Self {
            account_id: account_id.into(),
            platform,
            policy,
            events,
            store,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                attempts: 0,
                stopped: false,
                session,
                current,
            }),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn AccountStatusStore> {
        &self.store
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Consecutive failed reconnect attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.generation == generation && !inner.current.is_cancelled()
    }

    /// Claim a new connect cycle, or report the state that makes this call a
    /// no-op.
    fn begin(&self, manual: bool) -> Result<(ConnectTicket, ConnectionState), ConnectionState> {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(inner.state);
        }
        if manual {
            inner.attempts = 0;
            inner.stopped = false;
            if inner.session.is_cancelled() {
                inner.session = CancellationToken::new();
            }
        } else if inner.stopped {
            return Err(inner.state);
        }

        inner.current.cancel();
        inner.current = inner.session.child_token();
        inner.generation += 1;
        let old = inner.state;
        inner.state = ConnectionState::Connecting;

        Ok((
            ConnectTicket {
                generation: inner.generation,
                cancel: inner.current.clone(),
                manual,
            },
            old,
        ))
    }

    /// Run one connect cycle through `connector`. Failures feed the
    /// reconnect policy; the error is also returned to the caller.
    pub fn run_connect(self: &Arc<Self>, connector: Arc<dyn Connector>, manual: bool) -> ConnectFuture {
        let this = Arc::clone(self);
        Box::pin(async move {
            let (ticket, old) = match this.begin(manual) {
                Ok(claimed) => claimed,
                Err(state) => {
                    debug!(
                        account_id = %this.account_id,
                        %state,
                        "connect ignored; already {state}"
                    );
                    return Ok(state);
                }
            };
            this.announce(old, ConnectionState::Connecting).await;
            info!(
                account_id = %this.account_id,
                platform = %this.platform,
                generation = ticket.generation,
                manual,
                "connecting"
            );

            match Arc::clone(&connector).open(&ticket).await {
                Ok(OpenOutcome::Ready) => {
                    this.mark_connected(ticket.generation).await;
                    Ok(this.state())
                }
                Ok(OpenOutcome::Pending) => Ok(this.state()),
                Err(err) => {
                    this.fail(ticket.generation, &err, connector).await;
                    Err(err)
                }
            }
        })
    }

    /// Finish a connect cycle. Returns `false` if the generation is stale.
    pub async fn mark_connected(&self, generation: u64) -> bool {
        let old = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.current.is_cancelled() {
                debug!(
                    account_id = %self.account_id,
                    generation,
                    "dropping stale connected callback"
                );
                return false;
            }
            inner.attempts = 0;
            let old = inner.state;
            inner.state = ConnectionState::Connected;
            old
        };
        info!(account_id = %self.account_id, platform = %self.platform, "connected");
        self.announce(old, ConnectionState::Connected).await;
        true
    }

    /// A connect cycle failed: move to `error`, record the reason and, for
    /// transient failures, schedule the next attempt.
    pub async fn fail(self: &Arc<Self>, generation: u64, err: &ChannelError, connector: Arc<dyn Connector>) {
        let old = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.current.is_cancelled() {
                return;
            }
            inner.current.cancel();
            let old = inner.state;
            inner.state = ConnectionState::Error;
            old
        };
        warn!(account_id = %self.account_id, platform = %self.platform, "connect failed: {err}");
        self.announce(old, ConnectionState::Error).await;
        self.record_error(&err.to_string()).await;

        if err.is_retryable() {
            self.schedule_reconnect(connector);
        } else {
            error!(
                account_id = %self.account_id,
                "not retrying: {err}; waiting for new credentials or manual reconnect"
            );
        }
    }

    /// The transport ended on its own ("end"/"close" without an explicit
    /// disconnect). Tears down this generation and reconnects.
    pub async fn connection_lost(self: &Arc<Self>, generation: u64, reason: &str, connector: Arc<dyn Connector>) {
        let (old, stopped) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.current.is_cancelled() {
                return;
            }
            inner.current.cancel();
            let old = inner.state;
            inner.state = ConnectionState::Disconnected;
            (old, inner.stopped)
        };
        warn!(account_id = %self.account_id, platform = %self.platform, "connection lost: {reason}");
        self.announce(old, ConnectionState::Disconnected).await;
        if !stopped {
            self.schedule_reconnect(connector);
        }
    }

    /// Move to `error` without scheduling anything, e.g. after an
    /// authentication rejection discovered mid-session.
    pub async fn fail_terminal(&self, generation: u64, message: &str) {
        let old = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.current.cancel();
            let old = inner.state;
            inner.state = ConnectionState::Error;
            old
        };
        error!(account_id = %self.account_id, "{message}");
        self.announce(old, ConnectionState::Error).await;
        self.record_error(message).await;
    }

    fn schedule_reconnect(self: &Arc<Self>, connector: Arc<dyn Connector>) {
        let (attempt, session, generation) = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            if inner.attempts >= self.policy.max_attempts {
                (None, inner.session.clone(), inner.generation)
            } else {
                inner.attempts += 1;
                (Some(inner.attempts), inner.session.clone(), inner.generation)
            }
        };

        let Some(attempt) = attempt else {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.give_up(generation).await });
            return;
        };

        let delay = self.policy.delay_for(attempt);
        info!(
            account_id = %self.account_id,
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_secs = delay.as_secs_f64(),
            "scheduling reconnect"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = session.cancelled() => {
                    debug!(account_id = %this.account_id, "reconnect timer cancelled");
                }
                () = tokio::time::sleep(delay) => {
                    // Failures are handled inside run_connect.
                    let _ = this.run_connect(connector, false).await;
                }
            }
        });
    }

    async fn give_up(&self, generation: u64) {
        let old = {
            let mut inner = self.inner.lock();
            // A manual connect got in first.
            if inner.stopped || inner.generation != generation {
                return;
            }
            let old = inner.state;
            inner.state = ConnectionState::Error;
            old
        };
        let message = format!(
            "gave up after {} reconnect attempts; manual reconnect required",
            self.policy.max_attempts
        );
        error!(account_id = %self.account_id, platform = %self.platform, "{message}");
        self.announce(old, ConnectionState::Error).await;
        self.record_error(&message).await;
    }

    /// Explicit stop. Cancels reconnect timers, loops and keep-alives of every
    /// generation and bumps the generation so late callbacks are ignored.
    pub async fn disconnect(&self) {
        let old = {
            let mut inner = self.inner.lock();
            inner.stopped = true;
            inner.attempts = 0;
            inner.session.cancel();
            inner.generation += 1;
            let old = inner.state;
            inner.state = ConnectionState::Disconnected;
            old
        };
        info!(account_id = %self.account_id, platform = %self.platform, "disconnected");
        self.announce(old, ConnectionState::Disconnected).await;
    }

    /// Spawn a task that lives exactly as long as the ticket's generation.
    /// How the task ended is applied to the lifecycle after it has left the
    /// cancellable section, so the resulting transition is never cut short.
    pub fn spawn_bound<F>(self: &Arc<Self>, ticket: &ConnectTicket, connector: Arc<dyn Connector>, task: F)
    where
        F: Future<Output = LoopExit> + Send + 'static,
    {
        let this = Arc::clone(self);
        let token = ticket.cancel.clone();
        let generation = ticket.generation;
        tokio::spawn(async move {
            let exit = tokio::select! {
                () = token.cancelled() => return,
                exit = task => exit,
            };
            match exit {
                LoopExit::Done => {}
                LoopExit::Lost(reason) => this.connection_lost(generation, &reason, connector).await,
                LoopExit::Terminal(message) => this.fail_terminal(generation, &message).await,
            }
        });
    }

    /// Periodic keep-alive bound to the ticket's generation.
    pub fn spawn_keepalive<F, Fut>(
        self: &Arc<Self>,
        ticket: &ConnectTicket,
        every: Duration,
        mode: KeepAliveMode,
        connector: Arc<dyn Connector>,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send,
    {
        let this = Arc::clone(self);
        let token = ticket.cancel.clone();
        let generation = ticket.generation;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if let Err(err) = tick().await {
                    match mode {
                        KeepAliveMode::Probe => {
                            this.connection_lost(generation, &format!("keep-alive failed: {err}"), connector)
                                .await;
                            return;
                        }
                        KeepAliveMode::BestEffort => {
                            warn!(account_id = %this.account_id, "keep-alive tick failed, retrying next interval: {err}");
                        }
                    }
                }
            }
        });
    }

    async fn announce(&self, old: ConnectionState, new: ConnectionState) {
        if old == new {
            return;
        }
        if let Err(err) = self.store.update_status(&self.account_id, new).await {
            warn!(account_id = %self.account_id, "status store update failed: {err:#}");
        }
        self.events
            .emit(ChannelEvent::StatusChange {
                account_id: self.account_id.clone(),
                old,
                new,
            })
            .await;
    }

    pub async fn record_error(&self, message: &str) {
        if let Err(err) = self.store.update_error(&self.account_id, message).await {
            warn!(account_id = %self.account_id, "status store error update failed: {err:#}");
        }
        self.events.error(&self.account_id, message).await;
    }
}
