use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::circuit_breaker::{BreakerKey, CallPermit, CircuitBreaker, CircuitBreakerGroup, CircuitConfig};
use super::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::channels::message::{Platform, SendReceipt};
use crate::error::SendError;

/// Whether a platform-reported flood-wait is retried transparently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodWaitPolicy {
    /// Hand the `RateLimit` error straight back to the caller.
    Propagate,
    /// Sleep exactly the reported duration, then retry exactly once.
    RetryOnce,
}

/// One outbound call as the pipeline sees it.
#[derive(Debug, Clone)]
pub struct SendRequest<'a> {
    pub platform: Platform,
    pub account_id: &'a str,
    pub recipient: &'a str,
    pub operation: &'a str,
    pub flood_wait: FloodWaitPolicy,
}

#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Delivered(SendReceipt),
    Failed(SendError),
}

/// Unit the pipeline reasons about per call. Not persisted here.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub account_id: String,
    pub recipient: String,
    pub operation: String,
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
}

/// Receives attempts whose final outcome was a failure after the transport
/// was invoked. Storage and replay belong to the implementor.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, attempt: DeliveryAttempt);
}

/// Default sink: log and drop.
#[derive(Debug, Default)]
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn dead_letter(&self, attempt: DeliveryAttempt) {
        if let DeliveryOutcome::Failed(err) = &attempt.outcome {
            warn!(
                account_id = %attempt.account_id,
                recipient = %attempt.recipient,
                operation = %attempt.operation,
                attempt = attempt.attempt,
                "delivery failed: {err}"
            );
        }
    }
}

/// Rate limiter, then circuit breaker, then the transport call, then outcome
/// recording. Shared by every client in the process.
pub struct OutboundPipeline {
    limiter: RateLimiter,
    breakers: CircuitBreakerGroup,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl Default for OutboundPipeline {
    fn default() -> Self {
        Self::new(RateLimitConfig::default(), CircuitConfig::default())
    }
}

impl OutboundPipeline {
    pub fn new(rate_limit: RateLimitConfig, circuit: CircuitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(rate_limit),
            breakers: CircuitBreakerGroup::with_config(circuit),
            dead_letters: Arc::new(LogDeadLetterSink),
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn breakers(&self) -> &CircuitBreakerGroup {
        &self.breakers
    }

    /// Forget quotas and breakers of an account that was unpaired.
    pub fn forget_account(&self, account_id: &str) {
        self.limiter.forget_account(account_id);
        self.breakers.remove_account(account_id);
    }

    /// Run `call` through the pipeline. Every failure is returned to the
    /// caller; nothing is dropped or retried beyond a single flood-wait.
    pub async fn execute<F, Fut>(&self, request: SendRequest<'_>, mut call: F) -> Result<SendReceipt, SendError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<SendReceipt, SendError>> + Send,
    {
        self.limiter.check(request.account_id, request.recipient)?;

        let key = BreakerKey::new(request.platform, request.account_id, request.operation);
        let breaker = self.breakers.get_or_create(&key);
        let permit = admit(&breaker, &key)?;

        let mut attempt = 1;
        let mut result = call().await;
        settle(permit, &result);

        if request.flood_wait == FloodWaitPolicy::RetryOnce {
            if let Some(wait_ms) = result.as_ref().err().and_then(SendError::flood_wait_ms) {
                info!(
                    account_id = request.account_id,
                    operation = request.operation,
                    wait_ms,
                    "flood-wait reported; retrying once"
                );
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                let permit = admit(&breaker, &key)?;
                attempt += 1;
                result = call().await;
                settle(permit, &result);
            }
        }

        match result {
            Ok(receipt) => {
                debug!(
                    account_id = request.account_id,
                    operation = request.operation,
                    attempt,
                    "delivered"
                );
                Ok(receipt)
            }
            Err(err) => {
                self.dead_letters
                    .dead_letter(DeliveryAttempt {
                        account_id: request.account_id.to_string(),
                        recipient: request.recipient.to_string(),
                        operation: request.operation.to_string(),
                        attempt,
                        outcome: DeliveryOutcome::Failed(err.clone()),
                    })
                    .await;
                Err(err)
            }
        }
    }
}

fn admit<'a>(breaker: &'a CircuitBreaker, key: &BreakerKey) -> Result<CallPermit<'a>, SendError> {
    breaker.acquire().ok_or_else(|| {
        debug!(breaker = %key, "rejected by open circuit");
        SendError::CircuitOpen { key: key.to_string() }
    })
}

fn settle(permit: CallPermit<'_>, result: &Result<SendReceipt, SendError>) {
    match result {
        Ok(_) => permit.success(),
        Err(err) if err.trips_breaker() => permit.failure(),
        Err(_) => permit.neutral(),
    }
}
