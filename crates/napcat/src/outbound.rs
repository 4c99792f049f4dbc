//! Outbound dispatch: send payloads and the auxiliary OneBot actions.
//!
//! Send functions report failures in [`SendResult`]; lookups return `None`
//! or an empty list and simple actions return `false`. Nothing here
//! propagates transport errors to callers.

use std::{path::Path, time::Duration};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    napgate_common::{ChatType, ReplyPayload},
    serde::Serialize,
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use crate::{
    client::OneBotApi,
    error::{Context, Error, Result},
    faces::face_id_for_emoji,
    frame::{ApiResponse, MessageEvent, Sender, value_to_id},
    segment::{Segment, field},
};

/// Longest text sent in one message.
pub const TEXT_CHUNK_LIMIT: usize = 4000;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub chat_type: ChatType,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub text: Option<String>,
    /// URL, local path, `data:` or `base64://` payload.
    pub image_url: Option<String>,
    pub voice_url: Option<String>,
    pub video_url: Option<String>,
    pub reply_to_message_id: Option<String>,
}

impl SendOptions {
    pub fn direct(user_id: impl Into<String>) -> Self {
        Self {
            chat_type: ChatType::Direct,
            user_id: Some(user_id.into()),
            group_id: None,
            text: None,
            image_url: None,
            voice_url: None,
            video_url: None,
            reply_to_message_id: None,
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            chat_type: ChatType::Group,
            user_id: None,
            group_id: Some(group_id.into()),
            ..Self::direct("")
        }
    }

    /// Target parsed from `<qq>` or `g<group>`, with or without the
    /// `napcatqq:` prefix.
    pub fn to_target(target: &str) -> Self {
        let raw = target.strip_prefix("napcatqq:").unwrap_or(target);
        match raw.strip_prefix('g').or_else(|| raw.strip_prefix('G')) {
            Some(gid) => Self::group(gid),
            None => Self::direct(raw),
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_image(mut self, source: impl Into<String>) -> Self {
        self.image_url = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to_message_id = Some(message_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub ok: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl SendResult {
    fn sent(message_id: Option<String>) -> Self {
        Self {
            ok: true,
            message_id,
            error: None,
        }
    }

    fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            message_id: None,
            error: Some(error.to_string()),
        }
    }
}

/// The message referenced by a quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedMessage {
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginInfo {
    pub user_id: String,
    pub nickname: String,
}

/// Friend or group from the bot's contact lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerEntry {
    /// `<qq>` for friends, `g<group>` for groups.
    pub id: String,
    pub name: Option<String>,
}

/// OneBot ids are numeric; non-numeric input is passed through as a string.
fn numeric_id(id: &str) -> Value {
    match id.trim().parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    }
}

/// Make a media reference transport-safe: remote URLs and inline payloads
/// pass through, local files are read and inlined as `base64://`.
pub async fn resolve_media_source(source: &str) -> Result<String> {
    let source = source.trim();
    if source.is_empty() {
        return Err(Error::message("empty media source"));
    }
    if source.starts_with("http://")
        || source.starts_with("https://")
        || source.starts_with("base64://")
    {
        return Ok(source.to_string());
    }
    if let Some(rest) = source.strip_prefix("data:") {
        return match rest.split_once(";base64,") {
            Some((_, payload)) => Ok(format!("base64://{payload}")),
            None => Ok(source.to_string()),
        };
    }

    let path = source.strip_prefix("file://").unwrap_or(source);
    let bytes = tokio::fs::read(Path::new(path))
        .await
        .with_context(|| format!("failed to read media file {path}"))?;
    Ok(format!("base64://{}", STANDARD.encode(bytes)))
}

async fn post_message(
    api: &dyn OneBotApi,
    chat_type: ChatType,
    target: &str,
    segments: Vec<Segment>,
) -> SendResult {
    let (action, key) = match chat_type {
        ChatType::Group => ("send_group_msg", "group_id"),
        ChatType::Direct => ("send_private_msg", "user_id"),
    };
    let message: Vec<Value> = segments.iter().map(Segment::to_value).collect();
    let params = json!({ key: numeric_id(target), "message": message });

    match api.call_api(action, params, None).await {
        Ok(resp) if resp.has_data() => {
            SendResult::sent(resp.data.get("message_id").map(value_to_id))
        },
        Ok(resp) => SendResult::failed(resp.failure()),
        Err(e) => SendResult::failed(e),
    }
}

/// Send a message to a QQ user or group.
///
/// Reply, text and image go out in one call. Voice and video cannot be
/// combined with other segments, so each is sent as its own call after it.
pub async fn send_message(api: &dyn OneBotApi, opts: SendOptions) -> SendResult {
    let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
    if !present(&opts.text)
        && !present(&opts.image_url)
        && !present(&opts.reply_to_message_id)
        && !present(&opts.voice_url)
        && !present(&opts.video_url)
    {
        return SendResult::failed("Nothing to send (no text, image, or reply)");
    }

    let target = match opts.chat_type {
        ChatType::Group => opts.group_id.as_deref().filter(|s| !s.is_empty()),
        ChatType::Direct => opts.user_id.as_deref().filter(|s| !s.is_empty()),
    };
    let Some(target) = target else {
        return SendResult::failed(match opts.chat_type {
            ChatType::Group => "Missing groupId for group message",
            ChatType::Direct => "Missing userId for private message",
        });
    };

    let mut segments = Vec::new();
    if let Some(id) = opts.reply_to_message_id.as_deref().filter(|s| !s.is_empty()) {
        segments.push(Segment::reply(id));
    }
    if let Some(text) = opts.text.as_deref().filter(|s| !s.is_empty()) {
        segments.push(Segment::text(text));
    }
    if let Some(image) = opts.image_url.as_deref().filter(|s| !s.is_empty()) {
        match resolve_media_source(image).await {
            Ok(file) => segments.push(Segment::image(file)),
            Err(e) => return SendResult::failed(e),
        }
    }

    let mut standalone = Vec::new();
    if let Some(voice) = opts.voice_url.as_deref().filter(|s| !s.is_empty()) {
        match resolve_media_source(voice).await {
            Ok(file) => standalone.push(Segment::record(file)),
            Err(e) => return SendResult::failed(e),
        }
    }
    if let Some(video) = opts.video_url.as_deref().filter(|s| !s.is_empty()) {
        match resolve_media_source(video).await {
            Ok(file) => standalone.push(Segment::video(file)),
            Err(e) => return SendResult::failed(e),
        }
    }

    // Voice and video refuse companion segments, so a reply marker with
    // nothing else to carry it is dropped.
    let reply_only = segments.len() == 1 && matches!(segments[0], Segment::Reply { .. });
    if reply_only && !standalone.is_empty() {
        debug!(
            peer = target,
            reply_to = ?opts.reply_to_message_id,
            "dropping reply marker: voice/video cannot quote a message"
        );
        segments.clear();
    }
    let mut first: Option<SendResult> = None;
    if !segments.is_empty() {
        let result = post_message(api, opts.chat_type, target, segments).await;
        if !result.ok {
            return result;
        }
        first = Some(result);
    }
    for segment in standalone {
        let result = post_message(api, opts.chat_type, target, vec![segment]).await;
        if !result.ok {
            return result;
        }
        first.get_or_insert(result);
    }
    first.unwrap_or_else(|| SendResult::failed("Nothing to send (no text, image, or reply)"))
}

/// Split text into chunks of at most `limit` characters, preferring
/// paragraph, then line, then word boundaries.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    if limit == 0 {
        return chunks;
    }
    let mut rest = text.trim();
    while rest.chars().count() > limit {
        let window_end = rest
            .char_indices()
            .nth(limit)
            .map_or(rest.len(), |(i, _)| i);
        let window = &rest[..window_end];
        let split = window
            .rfind("\n\n")
            .or_else(|| window.rfind('\n'))
            .or_else(|| window.rfind(char::is_whitespace))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);
        let (head, tail) = rest.split_at(split);
        let head = head.trim_end();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Deliver a host reply to `target` (`<qq>` or `g<group>`).
///
/// Long text goes out in [`TEXT_CHUNK_LIMIT`] chunks; the reply marker rides
/// on the first chunk and the media on the last. Stops at the first failed
/// send and reports the first message id otherwise.
pub async fn send_payload(api: &dyn OneBotApi, target: &str, payload: &ReplyPayload) -> SendResult {
    let media = payload.media_url.as_deref().filter(|m| !m.is_empty());
    let mut chunks = payload
        .text
        .as_deref()
        .map(|t| chunk_text(t, TEXT_CHUNK_LIMIT))
        .unwrap_or_default();
    if chunks.is_empty() {
        if media.is_none() {
            return SendResult::failed("Nothing to send (no text, image, or reply)");
        }
        chunks.push(String::new());
    }

    let last = chunks.len() - 1;
    let mut first: Option<SendResult> = None;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let mut opts = SendOptions::to_target(target);
        if !chunk.is_empty() {
            opts = opts.with_text(chunk);
        }
        if i == 0
            && let Some(reply_to) = payload.reply_to_id.as_deref()
        {
            opts = opts.with_reply_to(reply_to);
        }
        if i == last
            && let Some(media) = media
        {
            opts = opts.with_image(media);
        }
        let result = send_message(api, opts).await;
        if !result.ok {
            return result;
        }
        first.get_or_insert(result);
    }
    first.unwrap_or_default()
}

fn quoted_placeholder(segment: &Segment) -> String {
    match segment {
        Segment::Text { text } => text.clone(),
        Segment::Image(_) => "[图片]".into(),
        Segment::Face { .. } => "[表情]".into(),
        Segment::Record(_) => "[语音]".into(),
        Segment::Video(_) => "[视频]".into(),
        Segment::File(data) => format!("[文件: {}]", data.name.as_deref().unwrap_or_default()),
        Segment::At { qq } => format!("@{qq}"),
        Segment::Forward { .. } => "[转发消息]".into(),
        Segment::Json { .. } => "[卡片]".into(),
        Segment::Reply { .. } => String::new(),
        other if other.kind().is_empty() => String::new(),
        other => format!("[{}]", other.kind()),
    }
}

/// Fetch a message by id for quote context.
pub async fn get_message(api: &dyn OneBotApi, message_id: &str) -> Option<QuotedMessage> {
    let resp = api
        .call_api(
            "get_msg",
            json!({ "message_id": numeric_id(message_id) }),
            Some(LOOKUP_TIMEOUT),
        )
        .await
        .inspect_err(|e| debug!(message_id, error = %e, "get_msg failed"))
        .ok()?;
    if !resp.has_data() {
        return None;
    }

    let data = &resp.data;
    let text = match data.get("message") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|raw| quoted_placeholder(&Segment::from_value(raw)))
            .collect::<String>(),
        Some(Value::String(s)) => s.clone(),
        _ => data
            .get("raw_message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };

    let sender = data.get("sender").cloned().unwrap_or(Value::Null);
    let sender_id = field(&sender, "user_id").unwrap_or_default();
    let sender_name = field(&sender, "card")
        .or_else(|| field(&sender, "nickname"))
        .unwrap_or_else(|| sender_id.clone());

    Some(QuotedMessage {
        text: text.trim().to_string(),
        sender_id,
        sender_name,
    })
}

/// The bot's own QQ identity.
pub async fn get_login_info(api: &dyn OneBotApi) -> Option<LoginInfo> {
    let resp = api
        .call_api("get_login_info", json!({}), Some(LOOKUP_TIMEOUT))
        .await
        .inspect_err(|e| debug!(error = %e, "get_login_info failed"))
        .ok()?;
    if !resp.has_data() {
        return None;
    }
    Some(LoginInfo {
        user_id: field(&resp.data, "user_id").unwrap_or_default(),
        nickname: field(&resp.data, "nickname").unwrap_or_default(),
    })
}

/// Call an action whose only result is success or failure.
async fn call_simple(
    api: &dyn OneBotApi,
    action: &str,
    params: Value,
    timeout: Option<Duration>,
) -> bool {
    match api.call_api(action, params, timeout).await {
        Ok(resp) if resp.is_ok() => true,
        Ok(resp) => {
            warn!(action, error = %resp.failure(), "NapCat action rejected");
            false
        },
        Err(e) => {
            warn!(action, error = %e, "NapCat action failed");
            false
        },
    }
}

pub async fn delete_message(api: &dyn OneBotApi, message_id: &str) -> bool {
    call_simple(
        api,
        "delete_msg",
        json!({ "message_id": numeric_id(message_id) }),
        None,
    )
    .await
}

/// React to a message. `emoji` is a QQ face id or a glyph from the face table.
pub async fn react_to_message(api: &dyn OneBotApi, message_id: &str, emoji: &str) -> bool {
    let emoji_id = if !emoji.is_empty() && emoji.chars().all(|c| c.is_ascii_digit()) {
        emoji
    } else if let Some(id) = face_id_for_emoji(emoji) {
        id
    } else {
        debug!(emoji, "no QQ face for emoji");
        return false;
    };
    call_simple(
        api,
        "set_msg_emoji_like",
        json!({ "message_id": numeric_id(message_id), "emoji_id": emoji_id, "set": true }),
        None,
    )
    .await
}

pub async fn mark_read(api: &dyn OneBotApi, chat_type: ChatType, peer_id: &str) -> bool {
    let (action, params) = match chat_type {
        ChatType::Group => (
            "mark_group_msg_as_read",
            json!({ "group_id": numeric_id(peer_id) }),
        ),
        ChatType::Direct => (
            "mark_private_msg_as_read",
            json!({ "user_id": numeric_id(peer_id) }),
        ),
    };
    call_simple(api, action, params, None).await
}

pub async fn handle_friend_request(
    api: &dyn OneBotApi,
    flag: &str,
    approve: bool,
    remark: Option<&str>,
) -> bool {
    call_simple(
        api,
        "set_friend_add_request",
        json!({ "flag": flag, "approve": approve, "remark": remark.unwrap_or_default() }),
        None,
    )
    .await
}

/// `sub_type` is `add` or `invite`, as received in the request event.
pub async fn handle_group_request(
    api: &dyn OneBotApi,
    flag: &str,
    sub_type: &str,
    approve: bool,
    reason: Option<&str>,
) -> bool {
    call_simple(
        api,
        "set_group_add_request",
        json!({
            "flag": flag,
            "sub_type": sub_type,
            "approve": approve,
            "reason": reason.unwrap_or_default(),
        }),
        None,
    )
    .await
}

fn history_messages(resp: &ApiResponse) -> Vec<MessageEvent> {
    resp.data
        .get("messages")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|raw| {
                    serde_json::from_value::<MessageEvent>(raw.clone())
                        .inspect_err(|e| debug!(error = %e, "skipping malformed history entry"))
                        .ok()
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn fetch_history(api: &dyn OneBotApi, action: &str, params: Value) -> Vec<MessageEvent> {
    match api.call_api(action, params, Some(DIRECTORY_TIMEOUT)).await {
        Ok(resp) if resp.is_ok() => history_messages(&resp),
        Ok(resp) => {
            warn!(action, error = %resp.failure(), "history fetch rejected");
            Vec::new()
        },
        Err(e) => {
            warn!(action, error = %e, "history fetch failed");
            Vec::new()
        },
    }
}

/// Most recent `count` messages of a group, oldest first.
pub async fn fetch_group_history(
    api: &dyn OneBotApi,
    group_id: &str,
    count: usize,
) -> Vec<MessageEvent> {
    fetch_history(
        api,
        "get_group_msg_history",
        json!({ "group_id": numeric_id(group_id), "count": count }),
    )
    .await
}

pub async fn fetch_friend_history(
    api: &dyn OneBotApi,
    user_id: &str,
    count: usize,
) -> Vec<MessageEvent> {
    fetch_history(
        api,
        "get_friend_msg_history",
        json!({ "user_id": numeric_id(user_id), "count": count }),
    )
    .await
}

/// Upload a file into a private chat or group file area.
pub async fn upload_file(
    api: &dyn OneBotApi,
    chat_type: ChatType,
    peer_id: &str,
    file: &str,
    name: &str,
) -> SendResult {
    let file = match resolve_media_source(file).await {
        Ok(file) => file,
        Err(e) => return SendResult::failed(e),
    };
    let (action, key) = match chat_type {
        ChatType::Group => ("upload_group_file", "group_id"),
        ChatType::Direct => ("upload_private_file", "user_id"),
    };
    let params = json!({ key: numeric_id(peer_id), "file": file, "name": name });
    match api.call_api(action, params, Some(Duration::from_secs(60))).await {
        Ok(resp) if resp.is_ok() => SendResult::sent(
            resp.data
                .get("file_id")
                .map(value_to_id)
                .filter(|s| !s.is_empty()),
        ),
        Ok(resp) => SendResult::failed(resp.failure()),
        Err(e) => SendResult::failed(e),
    }
}

pub async fn get_group_member_info(
    api: &dyn OneBotApi,
    group_id: &str,
    user_id: &str,
) -> Option<Sender> {
    let resp = api
        .call_api(
            "get_group_member_info",
            json!({ "group_id": numeric_id(group_id), "user_id": numeric_id(user_id) }),
            Some(LOOKUP_TIMEOUT),
        )
        .await
        .inspect_err(|e| debug!(error = %e, "get_group_member_info failed"))
        .ok()?;
    if !resp.has_data() {
        return None;
    }
    serde_json::from_value(resp.data).ok()
}

pub async fn set_essence(api: &dyn OneBotApi, message_id: &str, enable: bool) -> bool {
    let action = if enable {
        "set_essence_msg"
    } else {
        "delete_essence_msg"
    };
    call_simple(
        api,
        action,
        json!({ "message_id": numeric_id(message_id) }),
        None,
    )
    .await
}

/// Show or clear the "typing" state in a private chat.
pub async fn set_input_status(api: &dyn OneBotApi, user_id: &str, typing: bool) -> bool {
    call_simple(
        api,
        "set_input_status",
        json!({ "user_id": numeric_id(user_id), "event_type": i32::from(typing) }),
        Some(LOOKUP_TIMEOUT),
    )
    .await
}

/// Download URL for a file handle (`get_file`).
pub async fn get_file_url(api: &dyn OneBotApi, file_id: &str) -> Option<String> {
    let resp = api
        .call_api("get_file", json!({ "file_id": file_id }), Some(LOOKUP_TIMEOUT))
        .await
        .inspect_err(|e| debug!(file_id, error = %e, "get_file failed"))
        .ok()?;
    if !resp.has_data() {
        return None;
    }
    field(&resp.data, "url").or_else(|| field(&resp.data, "file"))
}

async fn directory(api: &dyn OneBotApi, action: &str) -> Vec<Value> {
    match api.call_api(action, json!({}), Some(DIRECTORY_TIMEOUT)).await {
        Ok(resp) if resp.is_ok() => resp.data.as_array().cloned().unwrap_or_default(),
        Ok(resp) => {
            warn!(action, error = %resp.failure(), "directory lookup rejected");
            Vec::new()
        },
        Err(e) => {
            warn!(action, error = %e, "directory lookup failed");
            Vec::new()
        },
    }
}

/// Friends, named by remark then nickname.
pub async fn list_friends(api: &dyn OneBotApi) -> Vec<PeerEntry> {
    directory(api, "get_friend_list")
        .await
        .iter()
        .filter_map(|f| {
            let id = field(f, "user_id")?;
            Some(PeerEntry {
                id,
                name: field(f, "remark").or_else(|| field(f, "nickname")),
            })
        })
        .collect()
}

pub async fn list_groups(api: &dyn OneBotApi) -> Vec<PeerEntry> {
    directory(api, "get_group_list")
        .await
        .iter()
        .filter_map(|g| {
            let id = field(g, "group_id")?;
            Some(PeerEntry {
                id: format!("g{id}"),
                name: field(g, "group_name"),
            })
        })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::RecordingApi,
        rstest::rstest,
        std::io::Write,
    };

    #[tokio::test]
    async fn group_send_builds_reply_text_image() {
        let api = RecordingApi::new();
        let result = send_message(
            &*api,
            SendOptions::group("20002")
                .with_reply_to("77")
                .with_text("hello")
                .with_image("https://img/a.png"),
        )
        .await;
        assert!(result.ok);
        assert_eq!(result.message_id.as_deref(), Some("1"));

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "send_group_msg");
        assert_eq!(calls[0].1["group_id"], 20002);
        assert_eq!(
            calls[0].1["message"],
            json!([
                {"type": "reply", "data": {"id": "77"}},
                {"type": "text", "data": {"text": "hello"}},
                {"type": "image", "data": {"file": "https://img/a.png"}},
            ])
        );
    }

    #[tokio::test]
    async fn voice_and_video_go_out_separately() {
        let api = RecordingApi::new();
        let opts = SendOptions {
            voice_url: Some("https://a/v.amr".into()),
            video_url: Some("https://a/v.mp4".into()),
            ..SendOptions::direct("10001").with_text("listen")
        };
        let result = send_message(&*api, opts).await;
        assert!(result.ok);

        let calls = api.calls_to("send_private_msg");
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0]["user_id"], 10001);
        assert_eq!(calls[0]["message"][0]["type"], "text");
        assert_eq!(calls[1]["message"], json!([{"type": "record", "data": {"file": "https://a/v.amr"}}]));
        assert_eq!(calls[2]["message"][0]["type"], "video");
    }

    #[tokio::test]
    async fn reply_with_only_voice_sends_the_voice_alone() {
        let api = RecordingApi::new();
        let opts = SendOptions {
            voice_url: Some("https://a/v.amr".into()),
            ..SendOptions::group("30003").with_reply_to("88")
        };
        let result = send_message(&*api, opts).await;
        assert!(result.ok);

        let calls = api.calls_to("send_group_msg");
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0]["message"],
            json!([{"type": "record", "data": {"file": "https://a/v.amr"}}])
        );
    }

    #[rstest]
    #[case::image("image")]
    #[case::voice("voice")]
    #[case::video("video")]
    #[tokio::test]
    async fn missing_local_media_fails_before_any_call(#[case] field: &str) {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.bin").display().to_string();
        let mut opts = SendOptions::direct("10001").with_text("caption");
        match field {
            "image" => opts.image_url = Some(missing.clone()),
            "voice" => opts.voice_url = Some(format!("file://{missing}")),
            _ => opts.video_url = Some(missing.clone()),
        }

        let api = RecordingApi::new();
        let result = send_message(&*api, opts).await;
        assert!(!result.ok);
        let error = result.error.unwrap();
        assert!(
            error.starts_with(&format!("failed to read media file {missing}")),
            "unexpected error: {error}"
        );
        assert!(api.calls().is_empty());
    }

    #[rstest]
    #[case(SendOptions::group("1"), "Nothing to send (no text, image, or reply)")]
    #[case(SendOptions { group_id: None, ..SendOptions::group("").with_text("x") }, "Missing groupId for group message")]
    #[case(SendOptions { user_id: None, ..SendOptions::direct("").with_text("x") }, "Missing userId for private message")]
    #[tokio::test]
    async fn invalid_sends_are_rejected(#[case] opts: SendOptions, #[case] error: &str) {
        let api = RecordingApi::new();
        let result = send_message(&*api, opts).await;
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some(error));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_status_is_reported() {
        let api = RecordingApi::new();
        api.respond_with(
            "send_private_msg",
            json!({"status": "failed", "retcode": 1200, "data": null}),
        );
        let result = send_message(&*api, SendOptions::direct("5").with_text("x")).await;
        assert_eq!(
            result.error.as_deref(),
            Some("API returned status=failed retcode=1200")
        );
    }

    #[tokio::test]
    async fn transport_errors_are_reported() {
        let api = RecordingApi::new();
        api.set_connected(false);
        let result = send_message(&*api, SendOptions::direct("5").with_text("x")).await;
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("WebSocket not connected"));
    }

    #[tokio::test]
    async fn local_media_is_inlined() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"png!").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let inlined = resolve_media_source(&path).await.unwrap();
        assert_eq!(inlined, format!("base64://{}", STANDARD.encode(b"png!")));
        let via_url = resolve_media_source(&format!("file://{path}")).await.unwrap();
        assert_eq!(via_url, inlined);
    }

    #[rstest]
    #[case("https://x/y.png", "https://x/y.png")]
    #[case("base64://QUJD", "base64://QUJD")]
    #[case("data:image/png;base64,QUJD", "base64://QUJD")]
    #[tokio::test]
    async fn remote_media_passes_through(#[case] source: &str, #[case] expected: &str) {
        assert_eq!(resolve_media_source(source).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn missing_media_file_is_an_error() {
        let err = resolve_media_source("/definitely/not/here.png")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to read media file"));
    }

    #[tokio::test]
    async fn quoted_message_uses_compact_placeholders() {
        let api = RecordingApi::new();
        api.respond(
            "get_msg",
            json!({
                "message_id": 9,
                "sender": {"user_id": 10001, "nickname": "Alice", "card": ""},
                "message": [
                    {"type": "reply", "data": {"id": "1"}},
                    {"type": "at", "data": {"qq": 30003}},
                    {"type": "text", "data": {"text": " see "}},
                    {"type": "image", "data": {"url": "u"}},
                    {"type": "file", "data": {"name": "a.txt"}},
                    {"type": "json", "data": {"data": "{}"}},
                    {"type": "poke", "data": {}},
                ],
            }),
        );
        let quoted = get_message(&*api, "9").await.unwrap();
        assert_eq!(quoted.text, "@30003 see [图片][文件: a.txt][卡片][poke]");
        assert_eq!(quoted.sender_id, "10001");
        assert_eq!(quoted.sender_name, "Alice");
        assert_eq!(api.calls_to("get_msg")[0]["message_id"], 9);
    }

    #[tokio::test]
    async fn quoted_message_falls_back_to_raw_text() {
        let api = RecordingApi::new();
        api.respond("get_msg", json!({"raw_message": " plain ", "sender": {"user_id": 1}}));
        let quoted = get_message(&*api, "9").await.unwrap();
        assert_eq!(quoted.text, "plain");
        assert_eq!(quoted.sender_name, "1");

        api.respond_with("get_msg", json!({"status": "failed", "retcode": 100}));
        assert!(get_message(&*api, "9").await.is_none());
    }

    #[tokio::test]
    async fn reactions_map_glyphs_to_face_ids() {
        let api = RecordingApi::new();
        assert!(react_to_message(&*api, "5", "👌").await);
        assert!(react_to_message(&*api, "5", "76").await);
        assert!(!react_to_message(&*api, "5", "🦀🦀").await);
        let calls = api.calls_to("set_msg_emoji_like");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["emoji_id"], "124");
        assert_eq!(calls[1]["emoji_id"], "76");
        assert_eq!(calls[0]["set"], true);
    }

    #[tokio::test]
    async fn directory_lists_friends_and_groups() {
        let api = RecordingApi::new();
        api.respond(
            "get_friend_list",
            json!([{"user_id": 1, "nickname": "A", "remark": "Boss"}, {"user_id": 2, "nickname": "B"}]),
        );
        api.respond("get_group_list", json!([{"group_id": 3, "group_name": "G"}]));
        let friends = list_friends(&*api).await;
        assert_eq!(friends[0].name.as_deref(), Some("Boss"));
        assert_eq!(friends[1].name.as_deref(), Some("B"));
        let groups = list_groups(&*api).await;
        assert_eq!(groups, vec![PeerEntry {
            id: "g3".into(),
            name: Some("G".into())
        }]);

        api.set_connected(false);
        assert!(list_friends(&*api).await.is_empty());
    }

    #[tokio::test]
    async fn group_history_is_parsed() {
        let api = RecordingApi::new();
        api.respond(
            "get_group_msg_history",
            json!({"messages": [
                {"message_type": "group", "message_id": 1, "user_id": 5, "group_id": 7, "message": "hi"},
                "garbage",
            ]}),
        );
        let history = fetch_group_history(&*api, "7", 20).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_id, "5");
        assert_eq!(api.calls_to("get_group_msg_history")[0]["count"], 20);
    }

    #[tokio::test]
    async fn typing_status_sends_event_type() {
        let api = RecordingApi::new();
        assert!(set_input_status(&*api, "42", true).await);
        assert!(set_input_status(&*api, "42", false).await);
        let calls = api.calls_to("set_input_status");
        assert_eq!(calls[0], json!({"user_id": 42, "event_type": 1}));
        assert_eq!(calls[1]["event_type"], 0);
    }

    #[test]
    fn targets_parse_with_and_without_prefix() {
        let g = SendOptions::to_target("napcatqq:g123");
        assert_eq!(g.chat_type, ChatType::Group);
        assert_eq!(g.group_id.as_deref(), Some("123"));
        let d = SendOptions::to_target("456");
        assert_eq!(d.chat_type, ChatType::Direct);
        assert_eq!(d.user_id.as_deref(), Some("456"));
    }

    #[test]
    fn chunking_prefers_boundaries() {
        assert!(chunk_text("", 10).is_empty());
        assert_eq!(chunk_text("short", 10), vec!["short"]);
        assert_eq!(chunk_text("aaaaaaaaaa", 4), vec!["aaaa", "aaaa", "aa"]);
        assert_eq!(
            chunk_text("one two\n\nthree four", 12),
            vec!["one two", "three four"]
        );
        assert_eq!(chunk_text("你好世界你好世界", 4), vec!["你好世界", "你好世界"]);
        let long = "word ".repeat(2000);
        let chunks = chunk_text(&long, TEXT_CHUNK_LIMIT);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= TEXT_CHUNK_LIMIT));
    }

    #[tokio::test]
    async fn payload_chunks_long_text_and_attaches_media_last() {
        let api = RecordingApi::new();
        let text = format!("{}\n\n{}", "a".repeat(3000), "b".repeat(3000));
        let payload = ReplyPayload {
            text: Some(text),
            media_url: Some("https://img/x.png".into()),
            reply_to_id: Some("5".into()),
        };
        let result = send_payload(&*api, "g100", &payload).await;
        assert!(result.ok);
        assert_eq!(result.message_id.as_deref(), Some("1"));

        let calls = api.calls_to("send_group_msg");
        assert_eq!(calls.len(), 2);
        let kinds = |i: usize| -> Vec<String> {
            calls[i]["message"]
                .as_array()
                .unwrap()
                .iter()
                .map(|s| s["type"].as_str().unwrap().to_string())
                .collect()
        };
        assert_eq!(kinds(0), vec!["reply", "text"]);
        assert_eq!(kinds(1), vec!["text", "image"]);
    }

    #[tokio::test]
    async fn payload_with_media_only() {
        let api = RecordingApi::new();
        let payload = ReplyPayload {
            media_url: Some("https://img/x.png".into()),
            ..Default::default()
        };
        assert!(send_payload(&*api, "42", &payload).await.ok);
        assert_eq!(api.calls_to("send_private_msg").len(), 1);
        assert!(!send_payload(&*api, "42", &ReplyPayload::default()).await.ok);
    }
}
