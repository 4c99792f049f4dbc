//! Collaborators shared by everything that runs for one account.

use std::sync::Arc;

use {
    napgate_channels::{host::ChannelHost, pairing::PairingStore},
    napgate_config::ConfigProvider,
    serde_json::Value,
    tracing::warn,
};

use crate::{
    client::OneBotApi,
    config::{NapCatAccountConfig, resolve_account},
    media::MediaFetcher,
    pool::ClientPool,
    state::AccountState,
};

/// Host-provided services, handed to the channel once.
#[derive(Clone)]
pub struct ChannelDeps {
    pub config: Arc<dyn ConfigProvider>,
    pub host: Arc<dyn ChannelHost>,
    pub pairing: Arc<dyn PairingStore>,
    pub pool: ClientPool,
}

impl ChannelDeps {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        host: Arc<dyn ChannelHost>,
        pairing: Arc<dyn PairingStore>,
    ) -> Self {
        Self {
            config,
            host,
            pairing,
            pool: ClientPool::new(),
        }
    }
}

/// Everything an account's event handlers need.
pub struct AccountContext {
    pub account_id: String,
    pub state: Arc<AccountState>,
    pub api: Arc<dyn OneBotApi>,
    pub deps: ChannelDeps,
    pub media: MediaFetcher,
}

impl AccountContext {
    /// The live config document, `None` (logged) when it cannot be read.
    pub fn load_config(&self) -> Option<Value> {
        self.deps
            .config
            .load()
            .inspect_err(|e| warn!(account_id = %self.account_id, error = %e, "failed to load config"))
            .ok()
    }

    /// Typed account view from the live config; defaults when unreadable.
    pub fn account(&self) -> NapCatAccountConfig {
        let cfg = self.load_config().unwrap_or(Value::Null);
        resolve_account(&cfg, Some(&self.account_id))
    }

    pub fn owner_ids(&self) -> Vec<String> {
        self.account().owner_ids()
    }
}
