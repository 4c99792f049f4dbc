//! Message events to one canonical inbound shape.
//!
//! Both wire encodings go through the same [`Segment`] model: segment arrays
//! are parsed directly, legacy CQ strings are split into text runs and CQ
//! codes first. Every segment kind renders a bracketed placeholder and/or
//! feeds a side list (media URLs, mentions, quoted id).

use std::sync::{Arc, LazyLock};

use {
    napgate_common::ChatType,
    regex::Regex,
    serde::Serialize,
    serde_json::{Map, Value},
};

use crate::{
    CHANNEL_ID,
    faces::face_emoji,
    frame::{MessageContent, MessageEvent},
    segment::{FileData, Segment},
};

/// Nested messages summarized from a merged-forward bundle.
const FORWARD_PREVIEW_LIMIT: usize = 5;

static CQ_CODE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[CQ:(\w+)((?:,[^,\]]+)*)\]").ok());

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub url: Option<String>,
    pub file_id: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NormalizedInbound {
    /// `napcatqq:<qq>` or `napcatqq:g<group>`.
    pub chat_id: String,
    pub chat_type: ChatType,
    pub sender_id: String,
    /// Group card, nickname, or the id.
    pub sender_name: String,
    /// Trimmed, placeholders included.
    pub text: String,
    pub message_id: String,
    pub reply_to_message_id: Option<String>,
    pub image_urls: Vec<String>,
    pub audio_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub file_infos: Vec<FileInfo>,
    pub mentions: Vec<String>,
    pub mentions_all: bool,
    pub group_id: Option<String>,
    pub raw: Arc<MessageEvent>,
}

impl NormalizedInbound {
    pub fn is_group(&self) -> bool {
        self.chat_type.is_group()
    }

    pub fn group_name(&self) -> Option<&str> {
        self.raw.group_name.as_deref().filter(|n| !n.is_empty())
    }

    /// Group name, or `群<id>` when NapCat did not send one.
    pub fn group_label(&self) -> String {
        match self.group_name() {
            Some(name) => name.to_string(),
            None => format!("群{}", self.group_id.as_deref().unwrap_or_default()),
        }
    }

    /// True when the message carries nothing: blank text and no media or files.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.image_urls.is_empty()
            && self.audio_urls.is_empty()
            && self.video_urls.is_empty()
            && self.file_infos.is_empty()
    }

    pub fn has_attachments(&self) -> bool {
        !(self.image_urls.is_empty()
            && self.audio_urls.is_empty()
            && self.video_urls.is_empty()
            && self.file_infos.is_empty())
    }
}

#[derive(Default)]
struct Collector {
    parts: Vec<String>,
    image_urls: Vec<String>,
    audio_urls: Vec<String>,
    video_urls: Vec<String>,
    file_infos: Vec<FileInfo>,
    mentions: Vec<String>,
    mentions_all: bool,
    reply_to: Option<String>,
}

impl Collector {
    fn push(&mut self, text: impl Into<String>) {
        self.parts.push(text.into());
    }

    fn add(&mut self, segment: &Segment) {
        match segment {
            Segment::Text { text } => self.push(text.as_str()),
            Segment::Markdown { content } => self.push(content.as_str()),
            Segment::At { qq } => {
                if qq == "all" {
                    self.mentions_all = true;
                } else if !qq.is_empty() {
                    self.mentions.push(qq.clone());
                }
            },
            Segment::Reply { id } => {
                if let Some(id) = id {
                    self.reply_to = Some(id.clone());
                }
            },
            Segment::Image(data) => {
                if let Some(src) = data.source() {
                    self.image_urls.push(src.to_string());
                }
                match &data.summary {
                    Some(summary) => self.push(format!("[图片: {summary}]")),
                    None => self.push("[图片]"),
                }
            },
            Segment::Record(data) => {
                if let Some(src) = data.source() {
                    self.audio_urls.push(src.to_string());
                }
                self.push("[语音消息]");
            },
            Segment::Video(data) => {
                if let Some(src) = data.source() {
                    self.video_urls.push(src.to_string());
                }
                self.push("[视频消息]");
            },
            Segment::File(data) => self.add_file(data),
            Segment::OnlineFile {
                file_name,
                file_size,
            } => {
                self.file_infos.push(FileInfo {
                    name: file_name.clone(),
                    size: Some(file_size.clone()),
                    ..Default::default()
                });
                self.push(format!(
                    "[文件: {file_name} ({})]",
                    format_file_size(file_size)
                ));
            },
            Segment::Face { id } => match face_emoji(id) {
                Some(emoji) => self.push(emoji),
                None if id.is_empty() => self.push("[QQ表情:?]"),
                None => self.push(format!("[QQ表情:{id}]")),
            },
            Segment::MFace { summary } => {
                self.push(summary.clone().unwrap_or_else(|| "[商城表情]".into()))
            },
            Segment::Poke => self.push("[戳一戳]"),
            Segment::Dice { result } => self.push(format!("[骰子: {result}]")),
            Segment::Rps { result } => {
                let hand = match result.as_str() {
                    "1" => "石头",
                    "2" => "剪刀",
                    "3" => "布",
                    other => other,
                };
                self.push(format!("[猜拳: {hand}]"));
            },
            Segment::Json { data } => self.push(card_summary(data)),
            Segment::Xml => self.push("[XML消息]"),
            Segment::MiniApp => self.push("[小程序消息]"),
            Segment::Location {
                lat,
                lon,
                title,
                content,
            } => {
                let title = title.as_deref().unwrap_or_default();
                let content = content
                    .as_deref()
                    .map(|c| format!(" {c}"))
                    .unwrap_or_default();
                self.push(format!("[位置: {title}{content} ({lat}, {lon})]"));
            },
            Segment::Music { kind, title } => {
                self.push(format!("[音乐: {}]", title.as_deref().unwrap_or(kind)))
            },
            Segment::Contact { kind, id } => {
                let label = if kind == "group" {
                    "群"
                } else {
                    "QQ"
                };
                self.push(format!("[联系人: {label}{id}]"));
            },
            Segment::Forward { content, .. } => {
                self.push("[合并转发消息]");
                if let Some(nodes) = content {
                    self.add_forward_preview(nodes);
                }
            },
            Segment::Node => {},
            Segment::FlashTransfer { .. } => self.push("[闪传文件]"),
            Segment::Unrecognized { kind, .. } => {
                if kind.is_empty() {
                    self.push("[未知消息]");
                } else {
                    self.push(format!("[{kind}]"));
                }
            },
        }
    }

    fn add_file(&mut self, data: &FileData) {
        let name = data
            .name
            .clone()
            .or_else(|| data.file.clone())
            .unwrap_or_else(|| "未知文件".into());
        self.push(format!("[文件: {name}]"));
        self.file_infos.push(FileInfo {
            name,
            url: data.url.clone(),
            file_id: data.file_id.clone(),
            size: None,
        });
    }

    fn add_forward_preview(&mut self, nodes: &[Value]) {
        for node in nodes.iter().take(FORWARD_PREVIEW_LIMIT) {
            let sender = forward_sender(node);
            let body: String = node
                .get("message")
                .and_then(Value::as_array)
                .map(|segs| {
                    segs.iter()
                        .map(|raw| compact_placeholder(&Segment::from_value(raw)))
                        .collect()
                })
                .unwrap_or_default();
            let body = body.trim();
            if !body.is_empty() {
                self.push(format!("\n  {sender}: {body}"));
            }
        }
        if nodes.len() > FORWARD_PREVIEW_LIMIT {
            self.push(format!(
                "\n  ...还有{}条消息",
                nodes.len() - FORWARD_PREVIEW_LIMIT
            ));
        }
    }
}

/// One-line rendering used inside forward previews.
fn compact_placeholder(segment: &Segment) -> String {
    match segment {
        Segment::Text { text } => text.clone(),
        Segment::Image(_) => "[图片]".into(),
        Segment::Face { id } => face_emoji(id).unwrap_or("[表情]").into(),
        Segment::Forward { .. } => "[合并转发消息]".into(),
        other if other.kind().is_empty() => String::new(),
        other => format!("[{}]", other.kind()),
    }
}

fn forward_sender(node: &Value) -> String {
    let sender = node.get("sender");
    let pick = |key: &str| {
        sender
            .and_then(|s| s.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    pick("nickname")
        .or_else(|| pick("card"))
        .unwrap_or_else(|| {
            node.get("user_id")
                .map(crate::frame::value_to_id)
                .unwrap_or_default()
        })
}

/// `[卡片: desc]` when the card JSON carries a description, else `[JSON卡片]`.
fn card_summary(data: &Value) -> String {
    let parsed = match data {
        Value::String(s) => serde_json::from_str::<Value>(s).unwrap_or(Value::Null),
        other => other.clone(),
    };
    let desc = [
        parsed.pointer("/meta/detail_1/desc"),
        parsed.pointer("/meta/news/desc"),
        parsed.get("prompt"),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .find(|s| !s.is_empty());
    match desc {
        Some(desc) => format!("[卡片: {desc}]"),
        None => "[JSON卡片]".into(),
    }
}

/// Human-readable byte count; non-numeric input is returned as is.
pub fn format_file_size(size: &str) -> String {
    let Ok(bytes) = size.trim().parse::<f64>() else {
        return size.to_string();
    };
    if !bytes.is_finite() || bytes < 0.0 {
        return size.to_string();
    }
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes / KB)
    } else if bytes < GB {
        format!("{:.1} MB", bytes / MB)
    } else {
        format!("{:.2} GB", bytes / GB)
    }
}

fn cq_unescape(s: &str) -> String {
    s.replace("&#44;", ",")
        .replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&amp;", "&")
}

/// Split a CQ-coded string into segments.
pub fn parse_cq_string(input: &str) -> Vec<Segment> {
    let Some(re) = CQ_CODE.as_ref() else {
        return vec![Segment::text(cq_unescape(input))];
    };
    let mut segments = Vec::new();
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let (Some(whole), Some(kind)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > last {
            segments.push(Segment::text(cq_unescape(&input[last..whole.start()])));
        }
        last = whole.end();

        let mut params = Map::new();
        if let Some(raw) = caps.get(2) {
            for pair in raw.as_str().split(',').filter(|p| !p.is_empty()) {
                if let Some((key, value)) = pair.split_once('=')
                    && !key.is_empty()
                {
                    params.insert(key.to_string(), Value::String(cq_unescape(value)));
                }
            }
        }
        segments.push(Segment::from_parts(kind.as_str(), &Value::Object(params)));
    }
    if last < input.len() {
        segments.push(Segment::text(cq_unescape(&input[last..])));
    }
    segments
}

pub fn normalize_inbound(event: &MessageEvent) -> NormalizedInbound {
    let is_group = event.is_group();
    let group_id = if is_group {
        Some(event.group_id.clone().unwrap_or_default())
    } else {
        None
    };
    let chat_id = match &group_id {
        Some(gid) => format!("{CHANNEL_ID}:g{gid}"),
        None => format!("{CHANNEL_ID}:{}", event.user_id),
    };

    let parsed;
    let segments: &[Segment] = match &event.message {
        MessageContent::Segments(segments) if !segments.is_empty() => segments,
        MessageContent::Segments(_) => &[],
        MessageContent::Text(text) => {
            let source = if text.is_empty() {
                &event.raw_message
            } else {
                text
            };
            parsed = parse_cq_string(source);
            &parsed
        },
    };

    let mut collector = Collector::default();
    for segment in segments {
        collector.add(segment);
    }

    let sender_name = [event.sender.card.as_deref(), Some(event.sender.nickname.as_str())]
        .into_iter()
        .flatten()
        .find(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| event.user_id.clone());

    NormalizedInbound {
        chat_id,
        chat_type: if is_group {
            ChatType::Group
        } else {
            ChatType::Direct
        },
        sender_id: event.user_id.clone(),
        sender_name,
        text: collector.parts.concat().trim().to_string(),
        message_id: event.message_id.clone(),
        reply_to_message_id: collector.reply_to,
        image_urls: collector.image_urls,
        audio_urls: collector.audio_urls,
        video_urls: collector.video_urls,
        file_infos: collector.file_infos,
        mentions: collector.mentions,
        mentions_all: collector.mentions_all,
        group_id,
        raw: Arc::new(event.clone()),
    }
}

/// Whether the bot is addressed: its id is mentioned or `@all` is set.
/// Without a known id only `@all` counts.
pub fn is_mentioning_bot(inbound: &NormalizedInbound, self_id: &str) -> bool {
    if self_id.is_empty() {
        return inbound.mentions_all;
    }
    inbound.mentions_all || inbound.mentions.iter().any(|m| m == self_id)
}

/// Remove every literal `@<self_id>` (and the whitespace after it), then trim.
pub fn strip_bot_mention(text: &str, self_id: &str) -> String {
    if self_id.is_empty() {
        return text.to_string();
    }
    match Regex::new(&format!(r"@{}\s*", regex::escape(self_id))) {
        Ok(re) => re.replace_all(text, "").trim().to_string(),
        Err(_) => text.to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn event(message: Value) -> MessageEvent {
        serde_json::from_value(json!({
            "post_type": "message",
            "message_type": "group",
            "message_id": 501,
            "user_id": 10001,
            "group_id": 20002,
            "group_name": "Rustaceans",
            "message": message,
            "raw_message": "",
            "sender": {"user_id": 10001, "nickname": "Alice", "card": ""},
            "self_id": 30003,
            "time": 1_700_000_000,
        }))
        .unwrap()
    }

    fn seg(kind: &str, data: Value) -> Value {
        json!({"type": kind, "data": data})
    }

    #[test]
    fn group_ids_and_sender_name() {
        let n = normalize_inbound(&event(json!([seg("text", json!({"text": " hi "}))])));
        assert_eq!(n.chat_id, "napcatqq:g20002");
        assert_eq!(n.chat_type, ChatType::Group);
        assert_eq!(n.group_id.as_deref(), Some("20002"));
        assert_eq!(n.sender_name, "Alice");
        assert_eq!(n.text, "hi");
        assert_eq!(n.message_id, "501");
        assert_eq!(n.group_label(), "Rustaceans");
    }

    #[test]
    fn direct_chat_id_uses_sender() {
        let mut e = event(json!("hello"));
        e.message_type = "private".into();
        e.group_id = None;
        let n = normalize_inbound(&e);
        assert_eq!(n.chat_id, "napcatqq:10001");
        assert_eq!(n.chat_type, ChatType::Direct);
        assert!(n.group_id.is_none());
    }

    #[rstest]
    #[case(seg("image", json!({"url": "https://img/a.png"})), "[图片]")]
    #[case(seg("image", json!({"file": "a.gif", "summary": "[动画表情]"})), "[图片: [动画表情]]")]
    #[case(seg("record", json!({"file": "a.amr"})), "[语音消息]")]
    #[case(seg("video", json!({"url": "https://v/1.mp4"})), "[视频消息]")]
    #[case(seg("file", json!({"file": "blob"})), "[文件: blob]")]
    #[case(seg("file", json!({})), "[文件: 未知文件]")]
    #[case(seg("onlinefile", json!({"fileName": "a.zip", "fileSize": "2048"})), "[文件: a.zip (2.0 KB)]")]
    #[case(seg("face", json!({"id": "76"})), "👍")]
    #[case(seg("face", json!({"id": "9999"})), "[QQ表情:9999]")]
    #[case(seg("mface", json!({"summary": "[开心]"})), "[开心]")]
    #[case(seg("mface", json!({})), "[商城表情]")]
    #[case(seg("poke", json!({})), "[戳一戳]")]
    #[case(seg("dice", json!({"result": 6})), "[骰子: 6]")]
    #[case(seg("rps", json!({"result": "3"})), "[猜拳: 布]")]
    #[case(seg("json", json!({"data": "{\"prompt\": \"[分享] 文章\"}"})), "[卡片: [分享] 文章]")]
    #[case(seg("json", json!({"data": "not json"})), "[JSON卡片]")]
    #[case(seg("xml", json!({"data": "<x/>"})), "[XML消息]")]
    #[case(seg("miniapp", json!({"data": "{}"})), "[小程序消息]")]
    #[case(seg("location", json!({"lat": 31.2, "lon": 121.5, "title": "外滩", "content": "上海"})), "[位置: 外滩 上海 (31.2, 121.5)]")]
    #[case(seg("music", json!({"type": "163"})), "[音乐: 163]")]
    #[case(seg("contact", json!({"type": "group", "id": "42"})), "[联系人: 群42]")]
    #[case(seg("flashtransfer", json!({"fileSetId": "x"})), "[闪传文件]")]
    #[case(seg("shake", json!({})), "[shake]")]
    #[case(json!({"data": {}}), "[未知消息]")]
    fn placeholders(#[case] segment: Value, #[case] expected: &str) {
        let n = normalize_inbound(&event(json!([segment])));
        assert_eq!(n.text, expected);
    }

    #[test]
    fn media_and_mentions_are_extracted() {
        let n = normalize_inbound(&event(json!([
            seg("reply", json!({"id": "400"})),
            seg("at", json!({"qq": 30003})),
            seg("at", json!({"qq": "all"})),
            seg("text", json!({"text": " look"})),
            seg("image", json!({"file": "a.jpg", "url": "https://img/a.jpg"})),
            seg("record", json!({"url": "https://a/1.amr"})),
            seg("file", json!({"name": "r.pdf", "url": "https://f/r.pdf", "file_id": "fid"})),
        ])));
        assert_eq!(n.reply_to_message_id.as_deref(), Some("400"));
        assert_eq!(n.mentions, vec!["30003"]);
        assert!(n.mentions_all);
        assert_eq!(n.image_urls, vec!["https://img/a.jpg"]);
        assert_eq!(n.audio_urls, vec!["https://a/1.amr"]);
        assert_eq!(n.file_infos[0].name, "r.pdf");
        assert_eq!(n.file_infos[0].file_id.as_deref(), Some("fid"));
        assert_eq!(n.text, "look[图片][语音消息][文件: r.pdf]");
    }

    #[test]
    fn forward_preview_is_capped() {
        let nodes: Vec<Value> = (0..7)
            .map(|i| {
                json!({
                    "sender": {"nickname": format!("u{i}")},
                    "message": [seg("text", json!({"text": format!("m{i}")})), seg("image", json!({}))],
                })
            })
            .collect();
        let n = normalize_inbound(&event(json!([seg(
            "forward",
            json!({"id": "f1", "content": nodes})
        )])));
        let lines: Vec<&str> = n.text.lines().collect();
        assert_eq!(lines[0], "[合并转发消息]");
        assert_eq!(lines[1], "  u0: m0[图片]");
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[6], "  ...还有2条消息");
    }

    #[test]
    fn forward_sender_falls_back_to_user_id() {
        let n = normalize_inbound(&event(json!([seg(
            "forward",
            json!({"id": "f1", "content": [
                {"user_id": 777, "message": [seg("face", json!({"id": "9999"}))]},
                {"sender": {"card": "Card"}, "message": [seg("dice", json!({}))]},
                {"sender": {"nickname": "Empty"}, "message": []},
            ]})
        )])));
        assert_eq!(n.text, "[合并转发消息]\n  777: [表情]\n  Card: [dice]");
    }

    #[test]
    fn array_and_cq_forms_agree() {
        let array = normalize_inbound(&event(json!([
            seg("reply", json!({"id": "88"})),
            seg("at", json!({"qq": "30003"})),
            seg("text", json!({"text": " hello "})),
            seg("face", json!({"id": "76"})),
            seg("image", json!({"url": "https://img/x.png"})),
        ])));
        let cq = normalize_inbound(&event(json!(
            "[CQ:reply,id=88][CQ:at,qq=30003] hello [CQ:face,id=76][CQ:image,file=x.png,url=https://img/x.png]"
        )));
        assert_eq!(array.text, cq.text);
        assert_eq!(array.mentions, cq.mentions);
        assert_eq!(array.reply_to_message_id, cq.reply_to_message_id);
        assert_eq!(array.image_urls, cq.image_urls);
    }

    #[test]
    fn cq_string_unescapes_and_keeps_unknown_codes() {
        let n = normalize_inbound(&event(json!("a &#91;b&#93; &amp; [CQ:at,qq=all][CQ:shake]")));
        assert_eq!(n.text, "a [b] & [shake]");
        assert!(n.mentions_all);
    }

    #[test]
    fn empty_string_falls_back_to_raw_message() {
        let mut e = event(json!(""));
        e.raw_message = "[CQ:face,id=124] ok".into();
        assert_eq!(normalize_inbound(&e).text, "👌 ok");
    }

    #[test]
    fn mention_detection() {
        let mut n = normalize_inbound(&event(json!([seg("at", json!({"qq": "30003"}))])));
        assert!(is_mentioning_bot(&n, "30003"));
        assert!(!is_mentioning_bot(&n, "40004"));
        assert!(!is_mentioning_bot(&n, ""));
        n.mentions.clear();
        n.mentions_all = true;
        assert!(is_mentioning_bot(&n, ""));
        assert!(is_mentioning_bot(&n, "40004"));
    }

    #[rstest]
    #[case("@30003 hello", "30003", "hello")]
    #[case("hi @30003   there @30003", "30003", "hi there")]
    #[case("@30003", "", "@30003")]
    #[case("@300031 x", "30003", "1 x")]
    fn strips_mention(#[case] text: &str, #[case] self_id: &str, #[case] expected: &str) {
        assert_eq!(strip_bot_mention(text, self_id), expected);
    }

    #[rstest]
    #[case("512", "512 B")]
    #[case("1536", "1.5 KB")]
    #[case("10485760", "10.0 MB")]
    #[case("3221225472", "3.00 GB")]
    #[case("big", "big")]
    #[case("-1", "-1")]
    fn file_sizes(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(format_file_size(raw), expected);
    }

    #[test]
    fn empty_message_detection() {
        let n = normalize_inbound(&event(json!([seg("text", json!({"text": "   "}))])));
        assert!(n.is_empty());
        let n = normalize_inbound(&event(json!([seg("image", json!({"url": "u"}))])));
        assert!(!n.is_empty());
        assert!(n.has_attachments());
    }
}
