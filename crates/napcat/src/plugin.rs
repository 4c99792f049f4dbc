use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    anyhow::Result,
    async_trait::async_trait,
    napgate_channels::{
        Error as ChannelError,
        pairing::PAIRING_APPROVED_MESSAGE,
        plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus},
    },
    napgate_common::{ChatType, ReplyPayload},
    napgate_config::ConfigProvider,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    CHANNEL_ID,
    client::{ClientEvents, WsClient, WsClientOptions},
    config::{
        LogoutResult, NapCatAccountConfig, list_account_ids, normalize_account_id, resolve_account,
        resolve_default_to,
    },
    context::ChannelDeps,
    error::Error,
    frame::Event,
    gateway::{AccountRuntime, logout_account, stop_account},
    outbound::{
        PeerEntry, SendOptions, get_login_info, list_friends, list_groups, send_message,
        send_payload, set_input_status,
    },
    pool::ClientPool,
    setup::{AccountSnapshot, OutboundTarget, parse_target},
    state::{AccountState, AccountStatus, BotIdentity},
};

struct RunningAccount {
    cancel: CancellationToken,
    state: Arc<AccountState>,
    task: JoinHandle<()>,
}

/// QQ channel plugin backed by NapCat.
pub struct NapCatPlugin {
    deps: ChannelDeps,
    accounts: HashMap<String, RunningAccount>,
    outbound: NapCatOutbound,
}

impl NapCatPlugin {
    pub fn new(deps: ChannelDeps) -> Self {
        let outbound = NapCatOutbound {
            pool: deps.pool.clone(),
            config: Arc::clone(&deps.config),
        };
        Self {
            deps,
            accounts: HashMap::new(),
            outbound,
        }
    }

    pub fn deps(&self) -> &ChannelDeps {
        &self.deps
    }

    /// Ids of accounts started through this plugin.
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn account_status(&self, account_id: &str) -> Option<AccountStatus> {
        self.accounts
            .get(&normalize_account_id(Some(account_id)))
            .map(|a| a.state.status())
    }

    /// One snapshot per configured account.
    pub fn snapshots(&self) -> Result<Vec<AccountSnapshot>> {
        let cfg = self.deps.config.load()?;
        Ok(list_account_ids(&cfg)
            .iter()
            .map(|id| {
                let account = resolve_account(&cfg, Some(id));
                AccountSnapshot::new(&account, self.account_status(id))
            })
            .collect())
    }

    /// Stop the account if it runs, then strip its connection secrets.
    pub async fn logout(&mut self, account_id: &str) -> Result<LogoutResult> {
        self.stop_account(account_id).await?;
        Ok(logout_account(self.deps.config.as_ref(), account_id)?)
    }

    pub async fn list_peers(&self, account_id: &str) -> Vec<PeerEntry> {
        match self.deps.pool.get(&normalize_account_id(Some(account_id))) {
            Some(client) => list_friends(client.as_ref()).await,
            None => Vec::new(),
        }
    }

    pub async fn list_groups(&self, account_id: &str) -> Vec<PeerEntry> {
        match self.deps.pool.get(&normalize_account_id(Some(account_id))) {
            Some(client) => list_groups(client.as_ref()).await,
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl ChannelPlugin for NapCatPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "NapCatQQ"
    }

    async fn start_account(&mut self, account_id: &str) -> Result<()> {
        let id = normalize_account_id(Some(account_id));
        if self.accounts.contains_key(&id) {
            self.stop_account(&id).await?;
        }

        let runtime = AccountRuntime::prepare(&self.deps, &id)?;
        let cancel = CancellationToken::new();
        let state = Arc::clone(runtime.state());
        let run_cancel = cancel.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = runtime.run(run_cancel).await {
                warn!(account_id = %task_id, error = %e, "NapCat account exited with error");
            }
        });
        info!(account_id = %id, "NapCat account started");
        self.accounts.insert(id, RunningAccount {
            cancel,
            state,
            task,
        });
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        let id = normalize_account_id(Some(account_id));
        match self.accounts.remove(&id) {
            Some(running) => {
                running.cancel.cancel();
                stop_account(&self.deps, &id, Some(&running.state));
                if let Err(e) = running.task.await {
                    warn!(account_id = %id, error = %e, "NapCat account task failed");
                }
            },
            None => {
                stop_account(&self.deps, &id, None);
                warn!(account_id = %id, "NapCat account not running");
            },
        }
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(&self.outbound)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for NapCatPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        let id = normalize_account_id(Some(account_id));
        Ok(match probe_account(&self.deps.pool, &id).await {
            Ok(bot) => ChannelHealthSnapshot {
                connected: true,
                account_id: id,
                details: Some(format!("Bot: {} ({})", bot.label(), bot.user_id)),
            },
            Err(e) => ChannelHealthSnapshot {
                connected: false,
                account_id: id,
                details: Some(e.to_string()),
            },
        })
    }
}

/// Bot identity through the account's pooled client.
pub async fn probe_account(pool: &ClientPool, account_id: &str) -> crate::Result<BotIdentity> {
    let client = pool
        .get(account_id)
        .ok_or_else(|| Error::message("not connected"))?;
    let info = get_login_info(client.as_ref())
        .await
        .ok_or_else(|| Error::message("get_login_info failed"))?;
    Ok(BotIdentity {
        user_id: info.user_id,
        nickname: info.nickname,
    })
}

/// Tell a freshly approved user through the first account with a client,
/// preferring connected ones.
pub async fn notify_pairing_approved(pool: &ClientPool, user_id: &str) -> crate::Result<()> {
    let (account_id, client) = pool
        .first_available()
        .ok_or_else(|| Error::message("no NapCatQQ account available"))?;
    let result = send_message(
        client.as_ref(),
        SendOptions::direct(user_id).with_text(PAIRING_APPROVED_MESSAGE),
    )
    .await;
    if !result.ok {
        return Err(Error::message(result.error.unwrap_or_default()));
    }
    info!(%account_id, user_id, "sent pairing approval");
    Ok(())
}

/// Client events for short-lived connections that only make calls.
struct Detached;

impl ClientEvents for Detached {
    fn on_event(&self, event: Event) {
        debug!(post_type = event.post_type(), "ignoring event on detached client");
    }
}

/// Connect outside any account runtime, waiting up to `timeout` for the
/// session. The caller stops the client.
pub async fn connect_detached(
    account: &NapCatAccountConfig,
    timeout: Duration,
) -> crate::Result<Arc<WsClient>> {
    if let Some(reason) = account.unconfigured_reason() {
        return Err(Error::message(reason));
    }
    let options = WsClientOptions::new(account.ws_url.trim())
        .with_access_token(account.access_token.clone());
    let client = WsClient::new(options, Arc::new(Detached));
    client.start();
    if !client.wait_connected(timeout).await {
        client.stop();
        return Err(Error::NotConnected);
    }
    Ok(client)
}

fn send_failed(error: Option<String>) -> ChannelError {
    ChannelError::unavailable(error.unwrap_or_else(|| "send failed".into()))
}

/// Sends through the pooled client of an account.
#[derive(Clone)]
pub struct NapCatOutbound {
    pool: ClientPool,
    config: Arc<dyn ConfigProvider>,
}

impl NapCatOutbound {
    fn client(&self, account_id: &str) -> Result<Arc<WsClient>> {
        let id = normalize_account_id(Some(account_id));
        self.pool
            .get(&id)
            .ok_or_else(|| ChannelError::unknown_account(&id).into())
    }

    /// `to`, or the account's `defaultTo` when `to` is blank.
    fn target(&self, account_id: &str, to: &str) -> Result<OutboundTarget> {
        let raw = if to.trim().is_empty() {
            let cfg = self
                .config
                .load()
                .map_err(|e| ChannelError::external("loading config", e))?;
            resolve_default_to(&cfg, &normalize_account_id(Some(account_id)))
                .ok_or_else(|| {
                    ChannelError::invalid_input("no target given and no defaultTo configured")
                })?
        } else {
            to.to_string()
        };
        parse_target(&raw).ok_or_else(|| {
            ChannelError::invalid_input(format!("invalid NapCatQQ target: {raw}")).into()
        })
    }
}

#[async_trait]
impl ChannelOutbound for NapCatOutbound {
    async fn send_text(
        &self,
        account_id: &str,
        to: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Option<String>> {
        let client = self.client(account_id)?;
        let target = self.target(account_id, to)?;
        debug!(account_id, to = %target.as_target(), text_len = text.len(), "outbound text");
        let mut opts = SendOptions::to_target(&target.as_target()).with_text(text);
        if let Some(reply_to) = reply_to {
            opts = opts.with_reply_to(reply_to);
        }
        let result = send_message(client.as_ref(), opts).await;
        if !result.ok {
            return Err(send_failed(result.error).into());
        }
        Ok(result.message_id)
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<Option<String>> {
        let client = self.client(account_id)?;
        let target = self.target(account_id, to)?;
        let result = send_payload(client.as_ref(), &target.as_target(), payload).await;
        if !result.ok {
            return Err(send_failed(result.error).into());
        }
        Ok(result.message_id)
    }

    async fn send_typing(&self, account_id: &str, to: &str) -> Result<()> {
        let client = self.client(account_id)?;
        let target = self.target(account_id, to)?;
        if target.chat_type == ChatType::Direct {
            set_input_status(client.as_ref(), &target.id, true).await;
        }
        Ok(())
    }
}
