//! Platform notices and requests, relayed to the account owners.
//!
//! Owner messages are best-effort: failures are logged and dropped.

use tracing::{debug, info, warn};

use crate::{
    client::OneBotApi,
    config::remove_allowed_group,
    context::AccountContext,
    frame::{NoticeEvent, RequestEvent},
    outbound::{SendOptions, handle_friend_request, handle_group_request, send_message},
};

/// Send a plain direct message, logging failures.
pub(crate) async fn send_direct_text(api: &dyn OneBotApi, user_id: &str, text: &str) -> bool {
    let result = send_message(api, SendOptions::direct(user_id).with_text(text)).await;
    if !result.ok {
        warn!(
            user_id,
            error = result.error.as_deref().unwrap_or_default(),
            "failed to send direct message"
        );
    }
    result.ok
}

/// Message every owner except `skip`, one at a time.
pub(crate) async fn notify_owners(
    api: &dyn OneBotApi,
    owners: &[String],
    text: &str,
    skip: Option<&str>,
) {
    for owner in owners {
        if skip == Some(owner.as_str()) {
            continue;
        }
        send_direct_text(api, owner, text).await;
    }
}

fn or_unknown(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("未知")
}

pub async fn handle_notice(ctx: &AccountContext, notice: &NoticeEvent) {
    let self_id = ctx.state.self_id();
    let gid = notice.group_id.as_deref().unwrap_or_default();
    let operator = or_unknown(notice.operator_id.as_deref());
    let sub_type = notice.sub_type.as_deref().unwrap_or_default();

    let text = match notice.notice_type.as_str() {
        "group_decrease" if sub_type == "kick_me" && !gid.is_empty() => {
            ctx.state.revoke_group(gid);
            let account_id = ctx.account_id.clone();
            let group_id = gid.to_string();
            match ctx
                .deps
                .config
                .update(&mut |doc| remove_allowed_group(doc, &account_id, &group_id))
            {
                Ok(true) => info!(account_id = %ctx.account_id, group_id = gid, "removed group from groupAllowFrom"),
                Ok(false) => {},
                Err(e) => warn!(account_id = %ctx.account_id, error = %e, "failed to persist group removal"),
            }
            format!("⚠️ 机器人已被移出群 {gid}（操作者: {operator}）")
        },
        "group_ban" if notice.user_id.as_deref() == Some(self_id.as_str()) && !self_id.is_empty() => {
            match notice.duration.unwrap_or_default() {
                d if d > 0 => format!("🔇 机器人在群 {gid} 被禁言 {d} 秒（操作者: {operator}）"),
                _ => format!("🔊 机器人在群 {gid} 的禁言已解除"),
            }
        },
        "friend_add" => format!("👋 新好友: {}", or_unknown(notice.user_id.as_deref())),
        "bot_offline" => format!(
            "⚠️ 机器人已离线: {}",
            or_unknown(notice.message.as_deref().or(notice.tag.as_deref()))
        ),
        other => {
            debug!(account_id = %ctx.account_id, notice_type = other, sub_type, "ignoring notice");
            return;
        },
    };

    info!(account_id = %ctx.account_id, notice_type = %notice.notice_type, "relaying notice to owners");
    notify_owners(ctx.api.as_ref(), &ctx.owner_ids(), &text, None).await;
}

pub async fn handle_request(ctx: &AccountContext, request: &RequestEvent) {
    let account = ctx.account();
    let api = ctx.api.as_ref();
    let comment = or_unknown(request.comment.as_deref());
    let sub_type = request.sub_type.as_deref().unwrap_or_default();

    let text = match request.request_type.as_str() {
        "friend" => {
            let outcome = if !account.auto_accept_friend {
                "未开启自动同意，请手动处理。".to_string()
            } else if handle_friend_request(api, &request.flag, true, None).await {
                "✅ 已自动同意".to_string()
            } else {
                "❌ 自动同意失败".to_string()
            };
            format!(
                "📨 好友请求\n\nQQ号: {}\n验证消息: {comment}\n\n{outcome}",
                request.user_id
            )
        },
        "group" if sub_type == "invite" => {
            let outcome = if !account.auto_accept_group_invite {
                "未开启自动同意，请手动处理。".to_string()
            } else if handle_group_request(api, &request.flag, sub_type, true, None).await {
                "✅ 已自动同意".to_string()
            } else {
                "❌ 自动同意失败".to_string()
            };
            format!(
                "📨 入群邀请\n\n群号: {}\n邀请人: {}\n\n{outcome}",
                or_unknown(request.group_id.as_deref()),
                request.user_id
            )
        },
        "group" => format!(
            "📨 入群申请\n\n群号: {}\nQQ号: {}\n验证消息: {comment}\n\n请手动处理。",
            or_unknown(request.group_id.as_deref()),
            request.user_id
        ),
        other => {
            debug!(account_id = %ctx.account_id, request_type = other, "ignoring request");
            return;
        },
    };

    info!(
        account_id = %ctx.account_id,
        request_type = %request.request_type,
        user_id = %request.user_id,
        "relaying request to owners"
    );
    notify_owners(api, &ctx.owner_ids(), &text, None).await;
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::{RecordingApi, test_context},
        serde_json::{Value, json},
    };

    fn notice(v: Value) -> NoticeEvent {
        serde_json::from_value(v).unwrap()
    }

    fn request(v: Value) -> RequestEvent {
        serde_json::from_value(v).unwrap()
    }

    fn account() -> Value {
        json!({
            "wsUrl": "ws://x",
            "allowFrom": ["1"],
            "dm": {"allowFrom": ["2"]},
            "groupAllowFrom": ["g500", "600"],
        })
    }

    #[tokio::test]
    async fn kick_prunes_group_and_notifies_owners() {
        let api = RecordingApi::new();
        let (ctx, provider) = test_context(&api, account());
        ctx.state.approve_group("500");

        handle_notice(
            &ctx,
            &notice(json!({"notice_type": "group_decrease", "sub_type": "kick_me", "group_id": 500, "operator_id": 9})),
        )
        .await;

        assert!(!ctx.state.is_group_approved("500"));
        assert_eq!(
            provider.snapshot()["channels"]["napcatqq"]["accounts"]["default"]["groupAllowFrom"],
            json!(["600"])
        );
        let text = "⚠️ 机器人已被移出群 500（操作者: 9）";
        assert_eq!(api.texts_to("2"), vec![text]);
        assert_eq!(api.texts_to("1"), vec![text]);
    }

    #[tokio::test]
    async fn mute_and_unmute_of_the_bot() {
        let api = RecordingApi::new();
        let (ctx, _) = test_context(&api, account());
        ctx.state.set_self_id_if_empty("10");

        let ban = |duration: i64, user: i64| {
            notice(json!({"notice_type": "group_ban", "group_id": 7, "user_id": user, "operator_id": 3, "duration": duration}))
        };
        handle_notice(&ctx, &ban(60, 10)).await;
        handle_notice(&ctx, &ban(0, 10)).await;
        handle_notice(&ctx, &ban(60, 11)).await;

        assert_eq!(api.texts_to("1"), vec![
            "🔇 机器人在群 7 被禁言 60 秒（操作者: 3）",
            "🔊 机器人在群 7 的禁言已解除",
        ]);
    }

    #[tokio::test]
    async fn friend_add_and_offline() {
        let api = RecordingApi::new();
        let (ctx, _) = test_context(&api, account());
        handle_notice(&ctx, &notice(json!({"notice_type": "friend_add", "user_id": 77}))).await;
        handle_notice(&ctx, &notice(json!({"notice_type": "bot_offline", "tag": "kicked", "message": "账号在其他设备登录"}))).await;
        handle_notice(&ctx, &notice(json!({"notice_type": "group_recall"}))).await;
        assert_eq!(api.texts_to("1"), vec![
            "👋 新好友: 77",
            "⚠️ 机器人已离线: 账号在其他设备登录",
        ]);
    }

    #[tokio::test]
    async fn friend_request_auto_accept() {
        let api = RecordingApi::new();
        let mut acct = account();
        acct["autoAcceptFriend"] = json!(true);
        let (ctx, _) = test_context(&api, acct);

        handle_request(
            &ctx,
            &request(json!({"request_type": "friend", "user_id": 55, "comment": "hi", "flag": "f1"})),
        )
        .await;

        let accepted = api.calls_to("set_friend_add_request");
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0]["flag"], "f1");
        assert_eq!(accepted[0]["approve"], true);
        assert_eq!(api.texts_to("1"), vec![
            "📨 好友请求\n\nQQ号: 55\n验证消息: hi\n\n✅ 已自动同意"
        ]);
    }

    #[tokio::test]
    async fn group_invite_left_for_owner() {
        let api = RecordingApi::new();
        let (ctx, _) = test_context(&api, account());

        handle_request(
            &ctx,
            &request(json!({"request_type": "group", "sub_type": "invite", "user_id": 55, "group_id": 800, "flag": "g1"})),
        )
        .await;

        assert!(api.calls_to("set_group_add_request").is_empty());
        assert_eq!(api.texts_to("2"), vec![
            "📨 入群邀请\n\n群号: 800\n邀请人: 55\n\n未开启自动同意，请手动处理。"
        ]);
    }
}
