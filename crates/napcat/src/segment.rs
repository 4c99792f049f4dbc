//! Typed OneBot message segments.
//!
//! Parsing never fails: unknown kinds are kept as [`Segment::Unrecognized`]
//! and malformed fields fall back to empty values.

use serde_json::{Map, Value, json};

use crate::frame::value_to_id;

/// File-like payload shared by image, voice, video and file segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileData {
    /// Path, URL, `base64://` payload or NapCat file handle.
    pub file: Option<String>,
    pub url: Option<String>,
    pub name: Option<String>,
    pub file_id: Option<String>,
    /// Image summary, e.g. `[动画表情]`.
    pub summary: Option<String>,
}

impl FileData {
    /// `url`, falling back to `file`.
    pub fn source(&self) -> Option<&str> {
        self.url.as_deref().or(self.file.as_deref())
    }

    fn from_data(data: &Value) -> Self {
        Self {
            file: field(data, "file"),
            url: field(data, "url"),
            name: field(data, "name"),
            file_id: field(data, "file_id"),
            summary: field(data, "summary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text { text: String },
    Markdown { content: String },
    /// `qq` is a user id or `all`.
    At { qq: String },
    Reply { id: Option<String> },
    Image(FileData),
    Record(FileData),
    Video(FileData),
    File(FileData),
    OnlineFile { file_name: String, file_size: String },
    Face { id: String },
    MFace { summary: Option<String> },
    Poke,
    Dice { result: String },
    Rps { result: String },
    Json { data: Value },
    Xml,
    MiniApp,
    Location {
        lat: String,
        lon: String,
        title: Option<String>,
        content: Option<String>,
    },
    Music { kind: String, title: Option<String> },
    Contact { kind: String, id: String },
    /// Merged-forward bundle; `content` holds nested messages when inlined.
    Forward { id: String, content: Option<Vec<Value>> },
    Node,
    FlashTransfer { file_set_id: String },
    Unrecognized { kind: String, data: Value },
}

impl Segment {
    /// Parse a `{type, data}` object.
    pub fn from_value(value: &Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        Self::from_parts(kind, &data)
    }

    /// Build a segment from its kind and data object. Used for both array
    /// segments and CQ codes.
    pub fn from_parts(kind: &str, data: &Value) -> Self {
        match kind {
            "text" => Self::Text {
                text: raw_field(data, "text"),
            },
            "markdown" => Self::Markdown {
                content: raw_field(data, "content"),
            },
            "at" => Self::At {
                qq: field(data, "qq").unwrap_or_default(),
            },
            "reply" => Self::Reply {
                id: field(data, "id"),
            },
            "image" => Self::Image(FileData::from_data(data)),
            "record" => Self::Record(FileData::from_data(data)),
            "video" => Self::Video(FileData::from_data(data)),
            "file" => Self::File(FileData::from_data(data)),
            "onlinefile" => Self::OnlineFile {
                file_name: field(data, "fileName").unwrap_or_default(),
                file_size: field(data, "fileSize").unwrap_or_default(),
            },
            "face" => Self::Face {
                id: field(data, "id").unwrap_or_default(),
            },
            "mface" => Self::MFace {
                summary: field(data, "summary"),
            },
            "poke" => Self::Poke,
            "dice" => Self::Dice {
                result: field(data, "result").unwrap_or_default(),
            },
            "rps" => Self::Rps {
                result: field(data, "result").unwrap_or_default(),
            },
            "json" => Self::Json {
                data: data.get("data").cloned().unwrap_or(Value::Null),
            },
            "xml" => Self::Xml,
            "miniapp" => Self::MiniApp,
            "location" => Self::Location {
                lat: field(data, "lat").unwrap_or_default(),
                lon: field(data, "lon").unwrap_or_default(),
                title: field(data, "title"),
                content: field(data, "content"),
            },
            "music" => Self::Music {
                kind: field(data, "type").unwrap_or_default(),
                title: field(data, "title"),
            },
            "contact" => Self::Contact {
                kind: field(data, "type").unwrap_or_default(),
                id: field(data, "id").unwrap_or_default(),
            },
            "forward" => Self::Forward {
                id: field(data, "id").unwrap_or_default(),
                content: data.get("content").and_then(Value::as_array).cloned(),
            },
            "node" => Self::Node,
            "flashtransfer" => Self::FlashTransfer {
                file_set_id: field(data, "fileSetId").unwrap_or_default(),
            },
            other => Self::Unrecognized {
                kind: other.to_string(),
                data: data.clone(),
            },
        }
    }

    /// The wire `type` of this segment.
    pub fn kind(&self) -> &str {
        match self {
            Self::Text { .. } => "text",
            Self::Markdown { .. } => "markdown",
            Self::At { .. } => "at",
            Self::Reply { .. } => "reply",
            Self::Image(_) => "image",
            Self::Record(_) => "record",
            Self::Video(_) => "video",
            Self::File(_) => "file",
            Self::OnlineFile { .. } => "onlinefile",
            Self::Face { .. } => "face",
            Self::MFace { .. } => "mface",
            Self::Poke => "poke",
            Self::Dice { .. } => "dice",
            Self::Rps { .. } => "rps",
            Self::Json { .. } => "json",
            Self::Xml => "xml",
            Self::MiniApp => "miniapp",
            Self::Location { .. } => "location",
            Self::Music { .. } => "music",
            Self::Contact { .. } => "contact",
            Self::Forward { .. } => "forward",
            Self::Node => "node",
            Self::FlashTransfer { .. } => "flashtransfer",
            Self::Unrecognized { kind, .. } => kind,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reply(id: impl Into<String>) -> Self {
        Self::Reply {
            id: Some(id.into()),
        }
    }

    /// A file-carrying segment whose `file` is `source`.
    pub fn image(source: impl Into<String>) -> Self {
        Self::Image(FileData {
            file: Some(source.into()),
            ..Default::default()
        })
    }

    pub fn record(source: impl Into<String>) -> Self {
        Self::Record(FileData {
            file: Some(source.into()),
            ..Default::default()
        })
    }

    pub fn video(source: impl Into<String>) -> Self {
        Self::Video(FileData {
            file: Some(source.into()),
            ..Default::default()
        })
    }

    /// Wire form used in `send_*_msg` payloads.
    pub fn to_value(&self) -> Value {
        let data = match self {
            Self::Text { text } => json!({ "text": text }),
            Self::Markdown { content } => json!({ "content": content }),
            Self::At { qq } => json!({ "qq": qq }),
            Self::Reply { id } => json!({ "id": id }),
            Self::Image(f) | Self::Record(f) | Self::Video(f) | Self::File(f) => {
                let mut map = Map::new();
                for (key, value) in [
                    ("file", &f.file),
                    ("url", &f.url),
                    ("name", &f.name),
                    ("file_id", &f.file_id),
                    ("summary", &f.summary),
                ] {
                    if let Some(value) = value {
                        map.insert(key.into(), Value::String(value.clone()));
                    }
                }
                Value::Object(map)
            },
            Self::Face { id } => json!({ "id": id }),
            Self::Json { data } => json!({ "data": data }),
            Self::Unrecognized { data, .. } => data.clone(),
            _ => json!({}),
        };
        json!({ "type": self.kind(), "data": data })
    }
}

/// Non-empty string or number field, trimmed.
pub(crate) fn field(data: &Value, key: &str) -> Option<String> {
    let value = value_to_id(data.get(key)?);
    (!value.is_empty()).then_some(value)
}

/// String field kept verbatim (text content keeps its whitespace).
fn raw_field(data: &Value, key: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other @ Value::Number(_)) => other.to_string(),
        _ => String::new(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(json!({"type": "text", "data": {"text": " hi "}}), Segment::Text { text: " hi ".into() })]
    #[case(json!({"type": "at", "data": {"qq": 12345}}), Segment::At { qq: "12345".into() })]
    #[case(json!({"type": "reply", "data": {"id": "77"}}), Segment::Reply { id: Some("77".into()) })]
    #[case(json!({"type": "face", "data": {"id": 76}}), Segment::Face { id: "76".into() })]
    #[case(json!({"type": "poke", "data": {"type": "1", "id": "1"}}), Segment::Poke)]
    #[case(json!({"type": "rps", "data": {"result": 2}}), Segment::Rps { result: "2".into() })]
    fn parses_known_segments(#[case] raw: Value, #[case] expected: Segment) {
        assert_eq!(Segment::from_value(&raw), expected);
    }

    #[test]
    fn unknown_kind_is_kept() {
        let seg = Segment::from_value(&json!({"type": "shake", "data": {"x": 1}}));
        assert_eq!(seg.kind(), "shake");
        assert!(matches!(seg, Segment::Unrecognized { ref data, .. } if data["x"] == 1));
    }

    #[test]
    fn malformed_segment_never_panics() {
        let seg = Segment::from_value(&json!("not an object"));
        assert_eq!(seg.kind(), "");
        let img = Segment::from_value(&json!({"type": "image", "data": null}));
        assert_eq!(img, Segment::Image(FileData::default()));
    }

    #[test]
    fn image_source_prefers_url() {
        let Segment::Image(data) = Segment::from_value(&json!({
            "type": "image",
            "data": {"file": "abc.jpg", "url": "https://x/abc.jpg"}
        })) else {
            panic!("expected image");
        };
        assert_eq!(data.source(), Some("https://x/abc.jpg"));
    }

    #[test]
    fn wire_form_skips_missing_file_fields() {
        assert_eq!(
            Segment::image("base64://AAAA").to_value(),
            json!({"type": "image", "data": {"file": "base64://AAAA"}})
        );
        assert_eq!(
            Segment::reply("9").to_value(),
            json!({"type": "reply", "data": {"id": "9"}})
        );
    }
}
