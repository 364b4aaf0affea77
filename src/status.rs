//! Account status bookkeeping.
//!
//! Clients never talk to a storage engine directly; they report through
//! `AccountStatusStore`. The in-memory store backs the daemon's `/health`
//! endpoint and the tests.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::channels::message::{ConnectionState, Platform};
use crate::channels::telegram_user::AuthState;

/// Typed per-platform connection metadata. Serialised only when it reaches
/// the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum ConnectionMetadata {
    WhatsappWeb {
        qr_code: Option<String>,
        phone: Option<String>,
    },
    WhatsappBusiness {
        phone_number_id: String,
        display_phone_number: Option<String>,
    },
    TelegramBot {
        bot_id: Option<i64>,
        bot_username: Option<String>,
    },
    TelegramUser {
        auth_state: AuthState,
        phone: Option<String>,
    },
    Email {
        address: String,
        mailbox: String,
    },
}

/// One configured account as the store sees it.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformAccount {
    pub id: String,
    pub platform: Platform,
    pub status: ConnectionState,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl PlatformAccount {
    pub fn new(id: impl Into<String>, platform: Platform) -> Self {
        Self {
            id: id.into(),
            platform,
            status: ConnectionState::Disconnected,
            error_count: 0,
            last_error: None,
            last_connected_at: None,
            metadata: None,
        }
    }
}

#[async_trait]
pub trait AccountStatusStore: Send + Sync {
    async fn update_status(&self, account_id: &str, status: ConnectionState) -> Result<()>;

    async fn update_error(&self, account_id: &str, message: &str) -> Result<()>;

    async fn update_connection_metadata(
        &self,
        account_id: &str,
        metadata: &ConnectionMetadata,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    accounts: RwLock<BTreeMap<String, PlatformAccount>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account at setup time.
    pub fn register(&self, account_id: &str, platform: Platform) {
        self.accounts
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| PlatformAccount::new(account_id, platform));
    }

    /// Drop an account (unpair).
    pub fn remove(&self, account_id: &str) -> Option<PlatformAccount> {
        self.accounts.write().remove(account_id)
    }

    pub fn get(&self, account_id: &str) -> Option<PlatformAccount> {
        self.accounts.read().get(account_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<PlatformAccount> {
        self.accounts.read().values().cloned().collect()
    }

    fn with_account<F>(&self, account_id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut PlatformAccount),
    {
        let mut accounts = self.accounts.write();
        let Some(account) = accounts.get_mut(account_id) else {
            anyhow::bail!("unknown account `{account_id}`");
        };
        update(account);
        Ok(())
    }
}

#[async_trait]
impl AccountStatusStore for InMemoryStatusStore {
    async fn update_status(&self, account_id: &str, status: ConnectionState) -> Result<()> {
        self.with_account(account_id, |account| {
            account.status = status;
            if status == ConnectionState::Connected {
                account.last_connected_at = Some(Utc::now());
            }
        })
    }

    async fn update_error(&self, account_id: &str, message: &str) -> Result<()> {
        self.with_account(account_id, |account| {
            account.error_count = account.error_count.saturating_add(1);
            account.last_error = Some(message.to_string());
        })
    }

    async fn update_connection_metadata(
        &self,
        account_id: &str,
        metadata: &ConnectionMetadata,
    ) -> Result<()> {
        let value = serde_json::to_value(metadata)?;
        self.with_account(account_id, |account| account.metadata = Some(value))
    }
}
