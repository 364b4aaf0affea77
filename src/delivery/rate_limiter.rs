//! Sliding-window send quotas, per recipient and per account.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{LimitType, SendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub max: u32,
    pub window_secs: u64,
}

impl Quota {
    pub const fn per_minute(max: u32) -> Self {
        Self { max, window_secs: 60 }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_recipient: Quota,
    pub per_account: Quota,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_recipient: Quota::per_minute(20),
            per_account: Quota::per_minute(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    account_id: String,
    recipient: Option<String>,
}

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<WindowKey, VecDeque<Instant>>,
    swept_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Consume one slot from both quotas, or reject without consuming.
    pub fn check(&self, account_id: &str, recipient: &str) -> Result<(), SendError> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        self.sweep(&mut windows, now);

        let recipient_key = WindowKey {
            account_id: account_id.to_string(),
            recipient: Some(recipient.to_string()),
        };
        let account_key = WindowKey {
            account_id: account_id.to_string(),
            recipient: None,
        };

        let checks = [
            (&recipient_key, self.config.per_recipient, LimitType::PerRecipient),
            (&account_key, self.config.per_account, LimitType::PerAccount),
        ];
        for (key, quota, limit_type) in checks {
            let (used, oldest) = match windows.by_key.get_mut(key) {
                Some(window) => {
                    prune(window, now, quota.window());
                    (window.len(), window.front().copied())
                }
                None => (0, None),
            };
            if used >= quota.max as usize {
                let retry_after = oldest
                    .map(|oldest| quota.window().saturating_sub(now.duration_since(oldest)))
                    .unwrap_or_else(|| quota.window());
                return Err(SendError::RateLimit {
                    limit_type,
                    retry_after_ms: (retry_after.as_millis() as u64).max(1),
                });
            }
        }

        for key in [recipient_key, account_key] {
            windows.by_key.entry(key).or_default().push_back(now);
        }
        Ok(())
    }

    /// Drop every window of one account.
    pub fn forget_account(&self, account_id: &str) {
        self.windows
            .lock()
            .by_key
            .retain(|key, _| key.account_id != account_id);
    }

    /// Number of keys currently holding sends.
    pub fn tracked_windows(&self) -> usize {
        self.windows.lock().by_key.len()
    }

    fn window_for(&self, key: &WindowKey) -> Duration {
        if key.recipient.is_some() {
            self.config.per_recipient.window()
        } else {
            self.config.per_account.window()
        }
    }

    /// Once per longest window, drop keys whose sends have all aged out.
    fn sweep(&self, windows: &mut Windows, now: Instant) {
        let span = self.config.per_recipient.window().max(self.config.per_account.window());
        if windows.swept_at.is_some_and(|at| now.duration_since(at) < span) {
            return;
        }
        windows.by_key.retain(|key, window| {
            prune(window, now, self.window_for(key));
            !window.is_empty()
        });
        windows.swept_at = Some(now);
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while window
        .front()
        .is_some_and(|at| now.duration_since(*at) >= span)
    {
        window.pop_front();
    }
}
