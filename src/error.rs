//! Error taxonomy shared by every platform client.
//!
//! `ChannelError` describes connection lifecycle failures and drives the
//! reconnect policy. `SendError` is what an outbound `send` returns to the
//! caller; it is always surfaced synchronously, never swallowed.

use std::fmt;

use crate::channels::message::Platform;

/// Why an authentication attempt failed. Callers use this to decide whether
/// interactive re-auth should be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// A saved session exists but the platform no longer accepts it.
    ExpiredSession,
    /// Token, code, password or login rejected.
    InvalidCredentials,
    /// The auth exchange could not reach the platform.
    Network,
    Other,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthFailure::ExpiredSession => "session expired",
            AuthFailure::InvalidCredentials => "invalid credentials",
            AuthFailure::Network => "network failure",
            AuthFailure::Other => "auth failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Transient; the lifecycle controller retries these.
    #[error("connection error: {0}")]
    Connection(String),

    /// Terminal until new credentials or interactive re-auth.
    #[error("{reason}: {message}")]
    Auth { reason: AuthFailure, message: String },

    #[error("timed out after {secs}s: {context}")]
    Timeout { secs: u64, context: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error {code}: {message}")]
    Transport { code: String, message: String },
}

impl ChannelError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn auth(reason: AuthFailure, message: impl Into<String>) -> Self {
        Self::Auth {
            reason,
            message: message.into(),
        }
    }

    /// Whether the reconnect policy may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Connection(_)
            | ChannelError::Timeout { .. }
            | ChannelError::Transport { .. } => true,
            ChannelError::Auth { reason, .. } => *reason == AuthFailure::Network,
            ChannelError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return ChannelError::auth(AuthFailure::InvalidCredentials, err.to_string());
            }
            return ChannelError::Transport {
                code: status.as_u16().to_string(),
                message: err.to_string(),
            };
        }
        ChannelError::Connection(err.to_string())
    }
}

/// Which quota rejected a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitType {
    PerRecipient,
    PerAccount,
    /// The platform itself asked us to wait (Telegram flood-wait, HTTP 429).
    FloodWait,
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitType::PerRecipient => f.write_str("per_recipient"),
            LimitType::PerAccount => f.write_str("per_account"),
            LimitType::FloodWait => f.write_str("flood_wait"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("not connected: {0}")]
    Connection(String),

    #[error("{reason}: {message}")]
    Auth { reason: AuthFailure, message: String },

    #[error("rate limited ({limit_type}), retry after {retry_after_ms}ms")]
    RateLimit {
        limit_type: LimitType,
        retry_after_ms: u64,
    },

    /// The breaker's own cool-down governs recovery; do not retry manually.
    #[error("circuit open for {key}")]
    CircuitOpen { key: String },

    #[error("{platform} API error {code}: {message}")]
    Transport {
        platform: Platform,
        code: String,
        message: String,
    },

    /// Bad input; never retried.
    #[error("invalid request: {0}")]
    Validation(String),
}

impl SendError {
    pub fn transport(platform: Platform, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            platform,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this outcome counts against the circuit breaker. Caller
    /// mistakes and quota rejections say nothing about the dependency's health.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            SendError::Connection(_) | SendError::Auth { .. } | SendError::Transport { .. }
        )
    }

    /// Required wait when the platform reported a flood-wait.
    pub fn flood_wait_ms(&self) -> Option<u64> {
        match self {
            SendError::RateLimit {
                limit_type: LimitType::FloodWait,
                retry_after_ms,
            } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<ChannelError> for SendError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Auth { reason, message } => SendError::Auth { reason, message },
            ChannelError::Config(message) => SendError::Validation(message),
            other => SendError::Connection(other.to_string()),
        }
    }
}
