//! OneBot v11 wire frames: API requests and responses, and the events NapCat
//! pushes over the same socket.

use {
    serde::{Deserialize, Deserializer, Serialize},
    serde_json::Value,
};

use crate::segment::Segment;

/// Outbound API call.
#[derive(Debug, Clone, Serialize)]
pub struct ApiRequest<'a> {
    pub action: &'a str,
    pub params: Value,
    pub echo: String,
}

/// Response to an [`ApiRequest`], matched by `echo`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiResponse {
    pub status: String,
    pub retcode: i64,
    pub data: Value,
    pub echo: Option<String>,
    pub message: Option<String>,
    pub wording: Option<String>,
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// `status == "ok"` with a non-null, non-empty payload.
    pub fn has_data(&self) -> bool {
        self.is_ok()
            && match &self.data {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::String(s) => !s.is_empty(),
                _ => true,
            }
    }

    pub fn failure(&self) -> crate::Error {
        crate::Error::Api {
            status: self.status.clone(),
            retcode: self.retcode,
        }
    }
}

/// `message` field of a message event: segment array or legacy CQ string.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Segments(Vec<Segment>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Array(items) => Self::Segments(items.iter().map(Segment::from_value).collect()),
            Value::String(s) => Self::Text(s),
            _ => Self::default(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Sender {
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    pub nickname: String,
    pub card: Option<String>,
    pub role: Option<String>,
}

/// `post_type = "message"` or `"message_sent"`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageEvent {
    /// `private` or `group`.
    pub message_type: String,
    pub sub_type: String,
    #[serde(deserialize_with = "id_string")]
    pub message_id: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    #[serde(deserialize_with = "opt_id_string")]
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub message: MessageContent,
    pub raw_message: String,
    pub sender: Sender,
    #[serde(deserialize_with = "id_string")]
    pub self_id: String,
    /// Unix seconds.
    pub time: i64,
    #[serde(deserialize_with = "opt_id_string")]
    pub target_id: Option<String>,
}

impl MessageEvent {
    pub fn is_group(&self) -> bool {
        self.message_type == "group"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetaEvent {
    /// `heartbeat` or `lifecycle`.
    pub meta_event_type: String,
    pub sub_type: Option<String>,
    #[serde(deserialize_with = "id_string")]
    pub self_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NoticeEvent {
    pub notice_type: String,
    pub sub_type: Option<String>,
    #[serde(deserialize_with = "id_string")]
    pub self_id: String,
    #[serde(deserialize_with = "opt_id_string")]
    pub group_id: Option<String>,
    #[serde(deserialize_with = "opt_id_string")]
    pub user_id: Option<String>,
    #[serde(deserialize_with = "opt_id_string")]
    pub operator_id: Option<String>,
    /// Mute duration in seconds (`group_ban`).
    pub duration: Option<i64>,
    /// Free-form reason (`bot_offline`).
    pub message: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestEvent {
    /// `friend` or `group`.
    pub request_type: String,
    /// `add` or `invite` for group requests.
    pub sub_type: Option<String>,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    #[serde(deserialize_with = "opt_id_string")]
    pub group_id: Option<String>,
    pub comment: Option<String>,
    pub flag: String,
    #[serde(deserialize_with = "id_string")]
    pub self_id: String,
}

/// A frame carrying `post_type`.
#[derive(Debug, Clone)]
pub enum Event {
    Message(MessageEvent),
    MessageSent(MessageEvent),
    Meta(MetaEvent),
    Notice(NoticeEvent),
    Request(RequestEvent),
    Other { post_type: String },
}

impl Event {
    /// Returns `None` when the frame has no `post_type`.
    pub fn from_value(value: Value) -> Option<serde_json::Result<Self>> {
        let post_type = value.get("post_type")?.as_str()?.to_string();
        Some(match post_type.as_str() {
            "message" => serde_json::from_value(value).map(Self::Message),
            "message_sent" => serde_json::from_value(value).map(Self::MessageSent),
            "meta_event" => serde_json::from_value(value).map(Self::Meta),
            "notice" => serde_json::from_value(value).map(Self::Notice),
            "request" => serde_json::from_value(value).map(Self::Request),
            _ => Ok(Self::Other { post_type }),
        })
    }

    pub fn post_type(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::MessageSent(_) => "message_sent",
            Self::Meta(_) => "meta_event",
            Self::Notice(_) => "notice",
            Self::Request(_) => "request",
            Self::Other { post_type } => post_type,
        }
    }
}

/// Render a JSON scalar as an id string. Numbers and strings are accepted;
/// anything else is empty.
pub(crate) fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(value_to_id(&Value::deserialize(deserializer)?))
}

fn opt_id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let id = value_to_id(&Value::deserialize(deserializer)?);
    Ok((!id.is_empty()).then_some(id))
}
