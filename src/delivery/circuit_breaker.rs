//! Circuit breaker for outbound platform calls.
//!
//! Three states: Closed, Open, HalfOpen. Opens after a run of consecutive
//! failures, lets exactly one probe through once the cool-down has elapsed,
//! and closes again after enough consecutive probe successes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channels::message::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Rejecting calls until the cool-down elapses.
    Open,
    /// One probe at a time is allowed through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    #[serde(rename = "reset_timeout_secs", with = "secs")]
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
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

/// Identity of one breaker: (platform, account, operation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub platform: Platform,
    pub account_id: String,
    pub operation: String,
}

impl BreakerKey {
    pub fn new(platform: Platform, account_id: &str, operation: &str) -> Self {
        Self {
            platform,
            account_id: account_id.to_string(),
            operation: operation.to_string(),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.account_id, self.operation)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Snapshot for health output.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn with_name(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to make a call. In half-open only one probe may be outstanding;
    /// the caller must report the outcome through one of the `record_*`
    /// methods. Prefer [`CircuitBreaker::acquire`], which releases the probe
    /// slot even when the call is abandoned.
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    /// Admission as a permit. Dropping the permit without settling it frees
    /// a half-open probe slot, so a cancelled probe cannot wedge the breaker.
    pub fn acquire(&self) -> Option<CallPermit<'_>> {
        self.admit().map(|probe| CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// `Some(true)` when the admitted call is the half-open probe.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
                if !cooled {
                    return None;
                }
                debug!(breaker = %self.name, "cool-down elapsed; admitting probe");
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.probe_in_flight = true;
                Some(true)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            if inner.consecutive_successes >= self.config.success_threshold {
                info!(
                    breaker = %self.name,
                    successes = inner.consecutive_successes,
                    "circuit closed after consecutive successes"
                );
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed; circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// The call finished with an outcome that says nothing about the
    /// dependency (bad input, local quota). Frees the probe slot only.
    pub fn record_neutral(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }
}

/// One admitted call. Settle it with `success`, `failure` or `neutral`.
#[must_use = "an unsettled permit records nothing"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }

    pub fn neutral(mut self) {
        self.settled = true;
        self.breaker.record_neutral();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            debug!(breaker = %self.breaker.name, "probe abandoned; releasing slot");
            self.breaker.record_neutral();
        }
    }
}

/// Process-wide set of breakers keyed by (platform, account, operation).
#[derive(Debug, Default)]
pub struct CircuitBreakerGroup {
    breakers: Mutex<HashMap<BreakerKey, Arc<CircuitBreaker>>>,
    default_config: CircuitConfig,
}

impl CircuitBreakerGroup {
    pub fn with_config(default_config: CircuitConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            default_config,
        }
    }

    pub fn get_or_create(&self, key: &BreakerKey) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(key.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_name(key.to_string(), self.default_config))
        }))
    }

    pub fn get(&self, key: &BreakerKey) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(key).map(Arc::clone)
    }

    /// Forget every breaker of one account (unpair).
    pub fn remove_account(&self, account_id: &str) {
        self.breakers.lock().retain(|key, _| key.account_id != account_id);
    }

    pub fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .lock()
            .iter()
            .map(|(key, breaker)| (key.to_string(), breaker.stats()))
            .collect()
    }
}
