//! One inbound message through DM access, command gating, media and the
//! host's reply dispatch.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    napgate_channels::{
        commands::has_control_command,
        gating::DmPolicy,
        history::HistoryEntry,
        host::{
            Envelope, InboundContext, InboundHistoryItem, PeerRef, ReplyDeliver, ReplyDispatch,
            ReplyKind, TypingIndicator,
        },
    },
    napgate_common::{ChatType, ReplyPayload},
    tracing::{error, info, warn},
};

use crate::{
    CHANNEL_ID,
    client::OneBotApi,
    config::resolve_account,
    context::AccountContext,
    inbound::{NormalizedInbound, is_mentioning_bot},
    media::remove_audio,
    notices::{notify_owners, send_direct_text},
    outbound::{get_message, react_to_message, send_payload, set_input_status},
    policy::{DmAccess, DmDecision, resolve_command_gate, resolve_dm_access},
};

pub const PAIRING_PENDING_TEXT: &str = "⏳ 你的消息已收到，需要管理员批准后才能对话，请稍候。";

/// QQ face used for `emojiAck` (👌).
pub const ACK_EMOJI_ID: &str = "124";

const ENVELOPE_CHANNEL: &str = "QQ";
const PREVIEW_CHARS: usize = 100;

/// Whitespace collapsed, cut to `max` characters.
pub(crate) fn preview(text: &str, max: usize) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max)
        .collect()
}

/// Delivers agent replies back into the originating chat.
pub struct ChatReplier {
    api: Arc<dyn OneBotApi>,
    /// `<qq>` or `g<group>`.
    target: String,
}

impl ChatReplier {
    pub fn new(api: Arc<dyn OneBotApi>, chat_id: &str) -> Self {
        let target = chat_id
            .strip_prefix(&format!("{CHANNEL_ID}:"))
            .unwrap_or(chat_id)
            .to_string();
        Self { api, target }
    }
}

#[async_trait]
impl ReplyDeliver for ChatReplier {
    async fn deliver(&self, payload: ReplyPayload, kind: ReplyKind) -> anyhow::Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let result = send_payload(self.api.as_ref(), &self.target, &payload).await;
        if !result.ok {
            anyhow::bail!(
                "sendMessage failed: {}",
                result.error.unwrap_or_default()
            );
        }
        info!(
            target = %self.target,
            kind = ?kind,
            message_id = result.message_id.as_deref().unwrap_or_default(),
            "reply delivered"
        );
        Ok(())
    }
}

/// "Typing…" state in a private chat.
pub struct DirectTyping {
    api: Arc<dyn OneBotApi>,
    user_id: String,
}

#[async_trait]
impl TypingIndicator for DirectTyping {
    async fn start(&self) {
        if !set_input_status(self.api.as_ref(), &self.user_id, true).await {
            warn!(user_id = %self.user_id, "typing start failed");
        }
    }

    async fn stop(&self) {
        set_input_status(self.api.as_ref(), &self.user_id, false).await;
    }
}

/// Direct-chat access: allow, or run the pairing flow and drop.
async fn check_dm_access(
    ctx: &AccountContext,
    inbound: &NormalizedInbound,
    configured: &[String],
    policy: DmPolicy,
    owners: &[String],
) -> Option<DmAccess> {
    let store = ctx
        .deps
        .pairing
        .read_allow_from(CHANNEL_ID, &ctx.account_id)
        .await
        .unwrap_or_else(|e| {
            warn!(account_id = %ctx.account_id, error = %e, "failed to read pairing store");
            Vec::new()
        });
    let access = resolve_dm_access(policy, configured, &store, &inbound.sender_id);

    match access.decision {
        DmDecision::Allow => return Some(access),
        DmDecision::Block => {
            info!(
                account_id = %ctx.account_id,
                sender_id = %inbound.sender_id,
                reason = %access.reason,
                "dropping dm"
            );
            return None;
        },
        DmDecision::Pairing => {},
    }

    let request = ctx
        .deps
        .pairing
        .upsert_request(
            CHANNEL_ID,
            &ctx.account_id,
            &inbound.sender_id,
            Some(&inbound.sender_name),
        )
        .await
        .unwrap_or_else(|e| {
            warn!(account_id = %ctx.account_id, error = %e, "failed to create pairing request");
            None
        });
    if let Some(request) = request {
        info!(
            account_id = %ctx.account_id,
            sender_id = %inbound.sender_id,
            code = %request.code,
            "pairing request created"
        );
        let api = ctx.api.as_ref();
        send_direct_text(api, &inbound.sender_id, PAIRING_PENDING_TEXT).await;
        let hint = format!(
            "🔔 新用户请求私聊\n\n昵称: {}\nQQ号: {}\n消息: {}\n\n回复: 批准用户 {}",
            inbound.sender_name,
            inbound.sender_id,
            preview(&inbound.text, PREVIEW_CHARS),
            inbound.sender_id
        );
        notify_owners(api, owners, &hint, Some(&inbound.sender_id)).await;
    }
    info!(
        account_id = %ctx.account_id,
        sender_id = %inbound.sender_id,
        reason = %access.reason,
        "dropping dm (not allowlisted)"
    );
    None
}

/// Run one inbound message through the remaining gates and hand it to the
/// agent host.
pub async fn handle_inbound(ctx: &AccountContext, inbound: NormalizedInbound) {
    let Some(cfg) = ctx.load_config() else {
        return;
    };
    let account = resolve_account(&cfg, Some(&ctx.account_id));
    let host = ctx.deps.host.as_ref();
    let route = host.resolve_route(&cfg, CHANNEL_ID, &ctx.account_id, &PeerRef {
        kind: inbound.chat_type,
        id: inbound.chat_id.clone(),
    });

    let configured = account.resolve_allow_from();
    let effective_allow_from = if inbound.is_group() {
        configured
    } else {
        let owners = account.owner_ids();
        match check_dm_access(ctx, &inbound, &configured, account.dm.policy, &owners).await {
            Some(access) => access.effective_allow_from,
            None => return,
        }
    };

    let has_command = has_control_command(&inbound.text, &account.command_prefix);
    let command_gate =
        resolve_command_gate(&effective_allow_from, &inbound.sender_id, has_command);
    if command_gate.should_block {
        info!(
            account_id = %ctx.account_id,
            sender_id = %inbound.sender_id,
            reason = "control command (unauthorized)",
            "dropping message"
        );
        return;
    }

    if account.emoji_ack && !inbound.message_id.is_empty() {
        react_to_message(ctx.api.as_ref(), &inbound.message_id, ACK_EMOJI_ID).await;
    }

    let audio = ctx.media.download_audio(&inbound.audio_urls).await;

    let (reply_to_body, reply_to_sender) = match inbound.reply_to_message_id.as_deref() {
        Some(id) => match get_message(ctx.api.as_ref(), id).await {
            Some(quoted) => (
                Some(quoted.text).filter(|t| !t.is_empty()),
                Some(quoted.sender_name).filter(|n| !n.is_empty()),
            ),
            None => (None, None),
        },
        None => (None, None),
    };

    let store_path = host.resolve_store_path(&cfg, &route.agent_id);
    let previous_timestamp = host
        .session_updated_at(&store_path, &route.session_key)
        .await;
    let group_label = inbound.group_label();
    let envelope_from = if inbound.is_group() {
        format!("{}@{group_label}", inbound.sender_name)
    } else {
        inbound.sender_name.clone()
    };
    let now = Utc::now();
    let body = host.format_envelope(&Envelope {
        channel: ENVELOPE_CHANNEL,
        from: &envelope_from,
        body: &inbound.text,
        timestamp: Some(now),
        previous_timestamp,
    });

    let mut combined_body = body.clone();
    let mut inbound_history = Vec::new();
    if inbound.is_group() {
        let (context, entries) = ctx.state.with_history(|history| {
            let context = history.build_context(&inbound.chat_id, &body, |entry: &HistoryEntry| {
                host.format_envelope(&Envelope {
                    channel: ENVELOPE_CHANNEL,
                    from: &format!("{}@{group_label}", entry.sender),
                    body: &entry.body,
                    timestamp: entry.timestamp.and_then(DateTime::from_timestamp_millis),
                    previous_timestamp: None,
                })
            });
            let entries = history.entries(&inbound.chat_id);
            history.clear(&inbound.chat_id);
            (context, entries)
        });
        if let Some(context) = context {
            combined_body = context;
        }
        inbound_history = entries
            .into_iter()
            .map(|e| InboundHistoryItem {
                sender: e.sender,
                body: e.body,
                timestamp: e.timestamp,
            })
            .collect();
    }

    let mut inbound_ctx = InboundContext {
        body: combined_body,
        raw_body: inbound.text.clone(),
        command_body: inbound.text.clone(),
        inbound_history,
        from: inbound.sender_id.clone(),
        to: inbound.chat_id.clone(),
        session_key: route.session_key.clone(),
        account_id: route.account_id.clone(),
        chat_type: Some(inbound.chat_type),
        conversation_label: envelope_from,
        group_subject: inbound.is_group().then(|| group_label.clone()),
        sender_name: inbound.sender_name.clone(),
        sender_id: inbound.sender_id.clone(),
        provider: CHANNEL_ID.to_string(),
        message_sid: inbound.message_id.clone(),
        reply_to_id: inbound.reply_to_message_id.clone(),
        reply_to_body,
        reply_to_sender,
        timestamp: now.timestamp_millis(),
        was_mentioned: !inbound.is_group() || is_mentioning_bot(&inbound, &ctx.state.self_id()),
        command_authorized: command_gate.authorized,
        originating_to: inbound.chat_id.clone(),
        media_paths: audio
            .iter()
            .map(|a| a.path.display().to_string())
            .collect(),
        media_types: audio.iter().map(|a| a.mime_type.clone()).collect(),
        images: Vec::new(),
    };

    if let Err(e) = host
        .record_inbound_session(&store_path, &inbound_ctx.session_key, &inbound_ctx)
        .await
    {
        error!(account_id = %ctx.account_id, error = %e, "failed to record session");
    }

    let typing: Option<Arc<dyn TypingIndicator>> = (inbound.chat_type == ChatType::Direct)
        .then(|| {
            Arc::new(DirectTyping {
                api: Arc::clone(&ctx.api),
                user_id: inbound.sender_id.clone(),
            }) as Arc<dyn TypingIndicator>
        });
    let dispatch = ReplyDispatch {
        deliver: Arc::new(ChatReplier::new(Arc::clone(&ctx.api), &inbound.chat_id)),
        typing,
    };

    inbound_ctx.images = ctx.media.download_images(&inbound.image_urls).await;

    if let Err(e) = host.dispatch_reply(inbound_ctx, &cfg, dispatch).await {
        error!(account_id = %ctx.account_id, error = %e, "failed to dispatch inbound");
    }
    remove_audio(&audio).await;
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            frame::MessageEvent,
            inbound::normalize_inbound,
            testing::{Harness, RecordingApi},
        },
        serde_json::{Value, json},
    };

    fn private(user: i64, text: &str) -> NormalizedInbound {
        let event: MessageEvent = serde_json::from_value(json!({
            "message_type": "private",
            "message_id": 900,
            "user_id": user,
            "message": [{"type": "text", "data": {"text": text}}],
            "sender": {"user_id": user, "nickname": format!("user{user}")},
            "self_id": 10,
        }))
        .unwrap();
        normalize_inbound(&event)
    }

    fn group(user: i64, segments: Value) -> NormalizedInbound {
        let event: MessageEvent = serde_json::from_value(json!({
            "message_type": "group",
            "message_id": 901,
            "user_id": user,
            "group_id": 500,
            "group_name": "Rustaceans",
            "message": segments,
            "sender": {"user_id": user, "nickname": format!("user{user}")},
            "self_id": 10,
        }))
        .unwrap();
        normalize_inbound(&event)
    }

    fn owner_account(extra: Value) -> Value {
        let mut account = json!({
            "wsUrl": "ws://x",
            "allowFrom": ["1", "2"],
            "dm": {"policy": "pairing"},
        });
        if let (Some(base), Some(extra)) = (account.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        account
    }

    #[tokio::test]
    async fn unknown_dm_sender_gets_pairing_flow() {
        let h = Harness::new(owner_account(json!({})));
        handle_inbound(&h.ctx, private(77, "hello   there")).await;

        assert_eq!(h.api.texts_to("77"), vec![PAIRING_PENDING_TEXT]);
        let hint = "🔔 新用户请求私聊\n\n昵称: user77\nQQ号: 77\n消息: hello there\n\n回复: 批准用户 77";
        assert_eq!(h.api.texts_to("1"), vec![hint]);
        assert_eq!(h.api.texts_to("2"), vec![hint]);
        assert!(h.host.dispatched().is_empty());
        assert_eq!(h.pairing.pending(CHANNEL_ID, "default").len(), 1);
    }

    #[tokio::test]
    async fn owner_requesting_pairing_is_not_notified_about_self() {
        let h = Harness::new(owner_account(json!({"allowFrom": [], "dm": {"policy": "pairing", "allowFrom": []}})));
        handle_inbound(&h.ctx, private(1, "hi")).await;
        assert_eq!(h.api.texts_to("1"), vec![PAIRING_PENDING_TEXT]);
    }

    #[tokio::test]
    async fn closed_dm_policy_drops_silently() {
        let h = Harness::new(owner_account(json!({"dm": {"policy": "closed"}})));
        handle_inbound(&h.ctx, private(1, "hi")).await;
        assert!(h.api.calls().is_empty());
        assert!(h.host.dispatched().is_empty());
    }

    #[tokio::test]
    async fn paired_sender_reaches_host_with_typing() {
        let h = Harness::new(owner_account(json!({})));
        h.pairing.approve(CHANNEL_ID, "default", "77");
        h.host.reply_with(ReplyPayload::text("pong"));

        handle_inbound(&h.ctx, private(77, "ping")).await;

        let dispatched = h.host.dispatched();
        assert_eq!(dispatched.len(), 1);
        let ctx = &dispatched[0];
        assert_eq!(ctx.raw_body, "ping");
        assert_eq!(ctx.session_key, "napcatqq:default:napcatqq:77");
        assert_eq!(ctx.conversation_label, "user77");
        assert!(ctx.was_mentioned);
        assert!(ctx.command_authorized);
        assert!(ctx.body.starts_with("[QQ user77 "));
        assert_eq!(h.api.texts_to("77"), vec!["pong"]);

        let typing = h.api.calls_to("set_input_status");
        assert_eq!(typing.len(), 2);
        assert_eq!(typing[0]["event_type"], 1);
        assert_eq!(typing[1]["event_type"], 0);
        assert_eq!(h.host.recorded.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_control_command_is_dropped() {
        let h = Harness::new(owner_account(json!({"dm": {"policy": "open"}})));
        handle_inbound(&h.ctx, private(77, "/reset")).await;
        assert!(h.host.dispatched().is_empty());

        handle_inbound(&h.ctx, private(1, "/reset")).await;
        assert_eq!(h.host.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn group_turn_includes_buffered_history() {
        let h = Harness::new(owner_account(json!({"groupPolicy": "open"})));
        h.ctx.state.record_history("napcatqq:g500", HistoryEntry {
            sender: "bob".into(),
            body: "earlier".into(),
            timestamp: Some(0),
            message_id: None,
        });

        handle_inbound(
            &h.ctx,
            group(3, json!([{"type": "text", "data": {"text": "question"}}])),
        )
        .await;

        let dispatched = h.host.dispatched();
        let ctx = &dispatched[0];
        assert!(ctx.body.contains("bob@Rustaceans"));
        assert!(ctx.body.contains("earlier"));
        assert!(ctx.body.ends_with("question"));
        assert_eq!(ctx.inbound_history.len(), 1);
        assert_eq!(ctx.group_subject.as_deref(), Some("Rustaceans"));
        assert_eq!(ctx.conversation_label, "user3@Rustaceans");
        assert!(!ctx.command_authorized);
        assert_eq!(h.ctx.state.history_len("napcatqq:g500"), 0);
        assert!(h.api.calls_to("set_input_status").is_empty());
    }

    #[tokio::test]
    async fn quoted_message_and_emoji_ack() {
        let h = Harness::new(owner_account(json!({"emojiAck": true})));
        h.api.respond(
            "get_msg",
            json!({"message": [{"type": "text", "data": {"text": "original"}}], "sender": {"user_id": 5, "nickname": "carol"}}),
        );
        let event: MessageEvent = serde_json::from_value(json!({
            "message_type": "private",
            "message_id": 902,
            "user_id": 1,
            "message": [
                {"type": "reply", "data": {"id": "333"}},
                {"type": "text", "data": {"text": "what about this"}},
            ],
            "sender": {"user_id": 1, "nickname": "owner"},
        }))
        .unwrap();

        handle_inbound(&h.ctx, normalize_inbound(&event)).await;

        let reaction = h.api.calls_to("set_msg_emoji_like");
        assert_eq!(reaction.len(), 1);
        assert_eq!(reaction[0]["emoji_id"], ACK_EMOJI_ID);
        let ctx = &h.host.dispatched()[0];
        assert_eq!(ctx.reply_to_id.as_deref(), Some("333"));
        assert_eq!(ctx.reply_to_body.as_deref(), Some("original"));
        assert_eq!(ctx.reply_to_sender.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn failed_delivery_is_reported_to_host() {
        let h = Harness::new(owner_account(json!({})));
        h.host.reply_with(ReplyPayload::text("pong"));
        h.api.respond_with(
            "send_private_msg",
            json!({"status": "failed", "retcode": 1200, "data": null}),
        );

        handle_inbound(&h.ctx, private(1, "ping")).await;

        let errors = h.host.delivery_errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("sendMessage failed:"));
    }

    #[test]
    fn replier_strips_channel_prefix() {
        let api: Arc<dyn OneBotApi> = RecordingApi::new();
        assert_eq!(ChatReplier::new(Arc::clone(&api), "napcatqq:g5").target, "g5");
        assert_eq!(ChatReplier::new(api, "42").target, "42");
    }

    #[test]
    fn preview_collapses_whitespace() {
        assert_eq!(preview("a \n\t b", 100), "a b");
        assert_eq!(preview("abcdef", 3), "abc");
    }
}
