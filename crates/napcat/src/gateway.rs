//! Per-account runtime: owns the WebSocket client, routes its events through
//! the group gate, owner commands and the debouncer, and tracks status.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    chrono::Utc,
    futures::FutureExt,
    napgate_channels::{
        commands::has_control_command,
        debounce::InboundDebouncer,
        history::HistoryEntry,
        pairing::PAIRING_APPROVED_MESSAGE,
    },
    napgate_config::ConfigProvider,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    CHANNEL_ID,
    client::{ClientEvents, WsClient, WsClientOptions},
    config::{
        LogoutResult, add_allowed_group, add_dm_allow, clear_credentials, debounce_window,
        history_limit, merge_dm_allow, resolve_account, set_self_id,
    },
    context::{AccountContext, ChannelDeps},
    error::{Error, Result},
    frame::{Event, MessageEvent},
    handler::{handle_inbound, preview},
    inbound::{NormalizedInbound, is_mentioning_bot, normalize_inbound, strip_bot_mention},
    media::MediaFetcher,
    notices::{handle_notice, handle_request, notify_owners, send_direct_text},
    outbound::{fetch_group_history, get_login_info},
    policy::{GroupGate, OwnerCommand, evaluate_group_gate, merge_debounced, parse_owner_command},
    state::{AccountState, BotIdentity},
};

const PROBE_ATTEMPTS: usize = 20;
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Forwards client callbacks into the account's event loop and keeps the
/// connection status current.
struct EventForwarder {
    state: Arc<AccountState>,
    events: mpsc::UnboundedSender<Event>,
}

impl ClientEvents for EventForwarder {
    fn on_connected(&self) {
        if !self.state.is_active() {
            return;
        }
        info!(account_id = %self.state.account_id, "NapCat connected");
        self.state.update_status(|s| {
            s.running = true;
            s.connected = true;
            s.last_start_at = Some(Utc::now());
            s.last_error = None;
        });
    }

    fn on_disconnected(&self) {
        if !self.state.is_active() {
            return;
        }
        warn!(account_id = %self.state.account_id, "NapCat disconnected");
        self.state.update_status(|s| {
            s.connected = false;
            s.last_stop_at = Some(Utc::now());
        });
    }

    fn on_event(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!(account_id = %self.state.account_id, "event loop gone, dropping event");
        }
    }
}

fn history_entry(inbound: &NormalizedInbound) -> HistoryEntry {
    let timestamp = if inbound.raw.time > 0 {
        inbound.raw.time * 1000
    } else {
        Utc::now().timestamp_millis()
    };
    HistoryEntry {
        sender: inbound.sender_name.clone(),
        body: inbound.text.clone(),
        timestamp: Some(timestamp),
        message_id: Some(inbound.message_id.clone()),
    }
}

fn group_request_text(inbound: &NormalizedInbound, group_id: &str) -> String {
    format!(
        "🔔 新群请求加入\n\n群名: {}\n群号: {group_id}\n来自: {} ({})\n\n回复: 批准群 {group_id}",
        inbound.group_label(),
        inbound.sender_name,
        inbound.sender_id
    )
}

/// Routes decoded events for one account. Message events pass the cheap
/// synchronous gates here; the turn itself runs from the debouncer.
pub struct EventRouter {
    ctx: Arc<AccountContext>,
    debouncer: InboundDebouncer<NormalizedInbound>,
}

impl EventRouter {
    pub fn new(ctx: Arc<AccountContext>, window: Duration) -> Self {
        let for_predicate = Arc::clone(&ctx);
        let for_flush = Arc::clone(&ctx);
        let debouncer = InboundDebouncer::new(
            window,
            |item: &NormalizedInbound| format!("{CHANNEL_ID}:{}:{}", item.chat_id, item.sender_id),
            move |item: &NormalizedInbound| {
                !item.text.trim().is_empty()
                    && !item.has_attachments()
                    && !has_control_command(&item.text, &for_predicate.account().command_prefix)
            },
            Arc::new(move |items: Vec<NormalizedInbound>| {
                let ctx = Arc::clone(&for_flush);
                async move {
                    if let Some(merged) = merge_debounced(items) {
                        handle_inbound(&ctx, merged).await;
                    }
                }
                .boxed()
            }),
        );
        Self { ctx, debouncer }
    }

    pub fn context(&self) -> &Arc<AccountContext> {
        &self.ctx
    }

    /// Drop buffered messages and refuse new ones.
    pub fn close(&self) {
        self.debouncer.close();
    }

    pub fn dispatch(&self, event: Event) {
        match event {
            Event::Meta(meta) => {
                if self.ctx.state.set_self_id_if_empty(&meta.self_id) {
                    info!(account_id = %self.ctx.account_id, self_id = %meta.self_id, "learned bot id from meta event");
                }
            },
            Event::Message(message) => self.on_message(normalize_inbound(&message)),
            Event::MessageSent(message) => self.on_message_sent(&message),
            Event::Notice(notice) => {
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move { handle_notice(&ctx, &notice).await });
            },
            Event::Request(request) => {
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move { handle_request(&ctx, &request).await });
            },
            Event::Other { post_type } => {
                debug!(account_id = %self.ctx.account_id, %post_type, "ignoring event");
            },
        }
    }

    /// The bot's own group messages are context for later turns.
    fn on_message_sent(&self, message: &MessageEvent) {
        let inbound = normalize_inbound(message);
        if inbound.is_group() && !inbound.text.is_empty() {
            self.ctx
                .state
                .record_history(&inbound.chat_id, history_entry(&inbound));
        }
    }

    fn on_message(&self, mut inbound: NormalizedInbound) {
        let ctx = &self.ctx;
        info!(
            account_id = %ctx.account_id,
            chat_id = %inbound.chat_id,
            sender_id = %inbound.sender_id,
            text = %preview(&inbound.text, 100),
            images = inbound.image_urls.len(),
            audio = inbound.audio_urls.len(),
            "inbound message"
        );

        let self_id = ctx.state.self_id();
        if !self_id.is_empty() && inbound.sender_id == self_id {
            debug!(account_id = %ctx.account_id, "ignoring own message");
            return;
        }
        if inbound.is_empty() {
            debug!(account_id = %ctx.account_id, chat_id = %inbound.chat_id, "ignoring empty message");
            return;
        }

        if inbound.is_group() {
            let account = ctx.account();
            let group_id = inbound.group_id.clone();
            let approved = group_id
                .as_deref()
                .is_some_and(|gid| ctx.state.is_group_approved(gid));
            let gate = evaluate_group_gate(
                &account,
                group_id.as_deref(),
                &inbound.sender_id,
                approved,
                is_mentioning_bot(&inbound, &self_id),
            );
            match gate {
                GroupGate::Suppress {
                    reason,
                    request_approval,
                } => {
                    ctx.state
                        .record_history(&inbound.chat_id, history_entry(&inbound));
                    if request_approval
                        && let Some(gid) = group_id
                        && ctx.state.mark_notified(&gid)
                    {
                        info!(account_id = %ctx.account_id, group_id = %gid, "asking owners to approve group");
                        let text = group_request_text(&inbound, &gid);
                        let owners = account.owner_ids();
                        let ctx = Arc::clone(ctx);
                        tokio::spawn(async move {
                            notify_owners(ctx.api.as_ref(), &owners, &text, None).await;
                        });
                    }
                    debug!(account_id = %ctx.account_id, chat_id = %inbound.chat_id, reason, "group message kept as history");
                    return;
                },
                GroupGate::Proceed { strip_mention } => {
                    if strip_mention {
                        inbound.text = strip_bot_mention(&inbound.text, &self_id);
                    }
                },
            }
        } else if ctx.owner_ids().contains(&inbound.sender_id)
            && let Some(command) = parse_owner_command(&inbound.text)
        {
            self.run_owner_command(command, inbound.sender_id);
            return;
        }

        self.debouncer.enqueue(inbound);
    }

    fn run_owner_command(&self, command: OwnerCommand, owner_id: String) {
        let ctx = Arc::clone(&self.ctx);
        match command {
            OwnerCommand::ApproveGroup(group_id) => {
                let policy = ctx.account().group_policy;
                if !policy.accepts_approvals() {
                    let text = format!(
                        "⚠️ 当前 groupPolicy=\"{}\"，批准群不会生效。请先设置 groupPolicy 为 pairing 或 allowlist。",
                        policy.as_str()
                    );
                    tokio::spawn(async move {
                        send_direct_text(ctx.api.as_ref(), &owner_id, &text).await;
                    });
                    return;
                }
                ctx.state.approve_group(&group_id);
                info!(account_id = %ctx.account_id, group_id = %group_id, "group approved by owner");
                tokio::spawn(async move {
                    persist_group_approval(&ctx, &group_id);
                    let text = format!("✅ 群 {group_id} 已批准，机器人现在会响应该群的 @消息。");
                    send_direct_text(ctx.api.as_ref(), &owner_id, &text).await;
                });
            },
            OwnerCommand::ApproveUser(user_id) => {
                tokio::spawn(async move {
                    approve_user(&ctx, &owner_id, &user_id).await;
                });
            },
        }
    }
}

fn persist_group_approval(ctx: &AccountContext, group_id: &str) {
    let account_id = ctx.account_id.as_str();
    match ctx
        .deps
        .config
        .update(&mut |doc| add_allowed_group(doc, account_id, group_id))
    {
        Ok(true) => info!(account_id, group_id, "persisted group to groupAllowFrom"),
        Ok(false) => {},
        Err(e) => warn!(account_id, group_id, error = %e, "failed to persist group approval"),
    }
}

async fn approve_user(ctx: &AccountContext, owner_id: &str, user_id: &str) {
    let account_id = ctx.account_id.as_str();
    let api = ctx.api.as_ref();
    match ctx
        .deps
        .config
        .update(&mut |doc| add_dm_allow(doc, account_id, user_id))
    {
        Ok(_) => {
            info!(account_id, user_id, "user approved by owner");
            let text = format!("✅ 用户 {user_id} 已批准（已写入 dm.allowFrom），现在可以和机器人私聊了。");
            send_direct_text(api, owner_id, &text).await;
            send_direct_text(api, user_id, PAIRING_APPROVED_MESSAGE).await;
        },
        Err(e) => {
            warn!(account_id, user_id, error = %e, "failed to approve user");
            send_direct_text(api, owner_id, &format!("❌ 批准用户 {user_id} 失败: {e}")).await;
        },
    }
}

/// A prepared account: client built, state seeded, not yet connected.
pub struct AccountRuntime {
    router: Arc<EventRouter>,
    client: Arc<WsClient>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl AccountRuntime {
    /// Build the runtime from the live config. Fails when the account has
    /// no `wsUrl`.
    pub fn prepare(deps: &ChannelDeps, account_id: &str) -> Result<Arc<Self>> {
        let cfg = deps.config.load()?;
        let account = resolve_account(&cfg, Some(account_id));
        if let Some(reason) = account.unconfigured_reason() {
            return Err(Error::message(format!(
                "NapCatQQ account \"{}\": {reason}",
                account.account_id
            )));
        }

        let state = Arc::new(AccountState::new(
            &account.account_id,
            account.self_id.clone(),
            account.approved_group_seed(),
            history_limit(&cfg, &account),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = Arc::new(EventForwarder {
            state: Arc::clone(&state),
            events: tx,
        });
        let options =
            WsClientOptions::new(account.ws_url.trim()).with_access_token(account.access_token.clone());
        let client = WsClient::new(options, forwarder);

        let ctx = Arc::new(AccountContext {
            account_id: account.account_id.clone(),
            state,
            api: client.clone(),
            deps: deps.clone(),
            media: MediaFetcher::new(),
        });
        Ok(Arc::new(Self {
            router: Arc::new(EventRouter::new(ctx, debounce_window(&cfg))),
            client,
            events: Mutex::new(Some(rx)),
        }))
    }

    pub fn state(&self) -> &Arc<AccountState> {
        &self.router.ctx.state
    }

    pub fn client(&self) -> &Arc<WsClient> {
        &self.client
    }

    /// Connect and process events until `cancel` fires, then tear down.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let ctx = Arc::clone(&self.router.ctx);
        let Some(mut events) = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Err(Error::message("account runtime already running"));
        };

        if let Some(previous) = ctx.deps.pool.register(&ctx.account_id, Arc::clone(&self.client)) {
            info!(account_id = %ctx.account_id, "replacing previous NapCat client");
            previous.stop();
        }
        info!(account_id = %ctx.account_id, url = %self.client.ws_url(), "starting NapCat account");
        ctx.state.update_status(|s| {
            s.running = true;
            s.last_start_at = Some(Utc::now());
        });
        self.client.start();

        let router = Arc::clone(&self.router);
        let loop_cancel = cancel.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => router.dispatch(event),
                        None => break,
                    },
                }
            }
        });
        let probe = tokio::spawn(probe_identity(Arc::clone(&ctx), cancel.child_token()));

        cancel.cancelled().await;
        info!(account_id = %ctx.account_id, "stopping NapCat account");
        ctx.state.deactivate();
        self.client.stop();
        ctx.deps.pool.unregister_if_same(&ctx.account_id, &self.client);
        self.router.close();
        probe.abort();
        let _ = event_loop.await;
        ctx.state.update_status(|s| {
            s.running = false;
            s.connected = false;
            s.last_stop_at = Some(Utc::now());
        });
        Ok(())
    }
}

/// Run an account until `cancel` fires.
pub async fn start_account(
    deps: &ChannelDeps,
    account_id: &str,
    cancel: CancellationToken,
) -> Result<()> {
    AccountRuntime::prepare(deps, account_id)?.run(cancel).await
}

/// Stop and unregister the account's client. `state`, when given, is marked
/// stopped.
pub fn stop_account(deps: &ChannelDeps, account_id: &str, state: Option<&AccountState>) -> bool {
    let stopped = match deps.pool.unregister(account_id) {
        Some(client) => {
            client.stop();
            true
        },
        None => false,
    };
    if let Some(state) = state {
        state.deactivate();
        state.update_status(|s| {
            s.running = false;
            s.connected = false;
            s.last_stop_at = Some(Utc::now());
        });
    }
    info!(account_id, stopped, "NapCat account stopped");
    stopped
}

/// Remove the account's connection secrets from config.
pub fn logout_account(config: &dyn ConfigProvider, account_id: &str) -> Result<LogoutResult> {
    let mut result = LogoutResult::default();
    config.update(&mut |doc| {
        let (outcome, changed) = clear_credentials(doc, account_id);
        result = outcome;
        changed
    })?;
    info!(account_id, cleared = result.cleared, "NapCat account logged out");
    Ok(result)
}

/// Poll `get_login_info` until the bot identity is known, then sync config
/// and preload group history.
async fn probe_identity(ctx: Arc<AccountContext>, cancel: CancellationToken) {
    for _ in 0..PROBE_ATTEMPTS {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(PROBE_INTERVAL) => {},
        }
        let Some(info) = get_login_info(ctx.api.as_ref()).await else {
            continue;
        };
        if info.user_id.is_empty() {
            continue;
        }
        ctx.state.set_self_id_if_empty(&info.user_id);
        let identity = BotIdentity {
            user_id: info.user_id.clone(),
            nickname: info.nickname.clone(),
        };
        info!(account_id = %ctx.account_id, bot = %identity.label(), "NapCat bot identified");
        ctx.state.update_status(|s| s.bot = Some(identity));
        sync_identity_config(&ctx, &info.user_id).await;
        preload_group_history(&ctx).await;
        return;
    }
    warn!(account_id = %ctx.account_id, "could not identify bot after {PROBE_ATTEMPTS} attempts");
}

/// Write `selfId` back and fold pairing-store approvals into `dm.allowFrom`.
async fn sync_identity_config(ctx: &AccountContext, self_id: &str) {
    let account_id = ctx.account_id.as_str();
    let store = ctx
        .deps
        .pairing
        .read_allow_from(CHANNEL_ID, account_id)
        .await
        .inspect_err(|e| warn!(account_id, error = %e, "failed to read pairing store"))
        .unwrap_or_default();
    let result = ctx.deps.config.update(&mut |doc| {
        let wrote_id = set_self_id(doc, account_id, self_id);
        let merged = merge_dm_allow(doc, account_id, &store);
        wrote_id || merged > 0
    });
    match result {
        Ok(true) => info!(account_id, self_id, "synced bot identity to config"),
        Ok(false) => {},
        Err(e) => warn!(account_id, error = %e, "failed to sync bot identity to config"),
    }
}

/// Seed history for allowlisted groups so the first turn has context.
async fn preload_group_history(ctx: &AccountContext) {
    let Some(cfg) = ctx.load_config() else {
        return;
    };
    let account = resolve_account(&cfg, Some(&ctx.account_id));
    let limit = history_limit(&cfg, &account);
    let self_id = ctx.state.self_id();
    for group_id in account.allowed_group_ids() {
        let chat_id = format!("{CHANNEL_ID}:g{group_id}");
        if ctx.state.history_len(&chat_id) > 0 {
            continue;
        }
        let mut loaded = 0usize;
        for event in fetch_group_history(ctx.api.as_ref(), &group_id, limit).await {
            let inbound = normalize_inbound(&event);
            if inbound.sender_id == self_id || inbound.text.is_empty() {
                continue;
            }
            ctx.state.record_history(&chat_id, history_entry(&inbound));
            loaded += 1;
        }
        debug!(account_id = %ctx.account_id, group_id = %group_id, loaded, "preloaded group history");
    }
}
