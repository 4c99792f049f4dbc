//! Contract with the agent host: routing, sessions, envelopes and reply
//! dispatch. The host owns all of these; channels only call through.

use std::sync::Arc;

use {
    anyhow::Result,
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    napgate_common::{ChatType, ReplyPayload},
    serde::Serialize,
};

/// The peer a conversation is routed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRef {
    pub kind: ChatType,
    pub id: String,
}

/// Result of host routing for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRoute {
    pub agent_id: String,
    pub session_key: String,
    pub account_id: String,
}

/// Input to envelope formatting.
#[derive(Debug, Clone)]
pub struct Envelope<'a> {
    pub channel: &'a str,
    pub from: &'a str,
    pub body: &'a str,
    pub timestamp: Option<DateTime<Utc>>,
    pub previous_timestamp: Option<DateTime<Utc>>,
}

/// One buffered message replayed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundHistoryItem {
    pub sender: String,
    pub body: String,
    pub timestamp: Option<i64>,
}

/// Inline image handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundImage {
    /// Base64 payload without any `data:` prefix.
    pub data: String,
    pub mime_type: String,
}

/// Everything the host needs to run one agent turn for an inbound message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundContext {
    pub body: String,
    pub raw_body: String,
    pub command_body: String,
    pub inbound_history: Vec<InboundHistoryItem>,
    pub from: String,
    pub to: String,
    pub session_key: String,
    pub account_id: String,
    pub chat_type: Option<ChatType>,
    pub conversation_label: String,
    pub group_subject: Option<String>,
    pub sender_name: String,
    pub sender_id: String,
    pub provider: String,
    pub message_sid: String,
    pub reply_to_id: Option<String>,
    pub reply_to_body: Option<String>,
    pub reply_to_sender: Option<String>,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub was_mentioned: bool,
    pub command_authorized: bool,
    pub originating_to: String,
    pub media_paths: Vec<String>,
    pub media_types: Vec<String>,
    pub images: Vec<InboundImage>,
}

/// Which kind of reply a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    Tool,
    Block,
    Final,
}

/// Channel-side sink for agent replies.
#[async_trait]
pub trait ReplyDeliver: Send + Sync {
    async fn deliver(&self, payload: ReplyPayload, kind: ReplyKind) -> Result<()>;
}

/// Typing indicator hooks driven by the host while a turn runs.
#[async_trait]
pub trait TypingIndicator: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
}

/// Channel callbacks for one reply dispatch.
#[derive(Clone)]
pub struct ReplyDispatch {
    pub deliver: Arc<dyn ReplyDeliver>,
    pub typing: Option<Arc<dyn TypingIndicator>>,
}

/// The routing / session / reply subsystem of the agent host.
#[async_trait]
pub trait ChannelHost: Send + Sync {
    fn resolve_route(
        &self,
        cfg: &serde_json::Value,
        channel: &str,
        account_id: &str,
        peer: &PeerRef,
    ) -> ResolvedRoute;

    /// Session store location for an agent.
    fn resolve_store_path(&self, cfg: &serde_json::Value, agent_id: &str) -> String;

    /// When the session was last updated, if it exists.
    async fn session_updated_at(&self, store_path: &str, session_key: &str)
    -> Option<DateTime<Utc>>;

    async fn record_inbound_session(
        &self,
        store_path: &str,
        session_key: &str,
        ctx: &InboundContext,
    ) -> Result<()>;

    fn format_envelope(&self, envelope: &Envelope<'_>) -> String {
        format_agent_envelope(envelope)
    }

    /// Run the agent for `ctx`, delivering zero or more replies.
    async fn dispatch_reply(
        &self,
        ctx: InboundContext,
        cfg: &serde_json::Value,
        dispatch: ReplyDispatch,
    ) -> Result<()>;
}

/// Default envelope: `[channel from +elapsed timestamp] body`.
pub fn format_agent_envelope(envelope: &Envelope<'_>) -> String {
    let mut header = vec![envelope.channel.to_string()];
    if !envelope.from.is_empty() {
        header.push(envelope.from.to_string());
    }
    if let (Some(ts), Some(prev)) = (envelope.timestamp, envelope.previous_timestamp) {
        let elapsed = ts.signed_duration_since(prev);
        if elapsed.num_seconds() >= 0 {
            header.push(format!("+{}", format_elapsed(elapsed.num_seconds())));
        }
    }
    if let Some(ts) = envelope.timestamp {
        header.push(ts.format("%Y-%m-%d %H:%M UTC").to_string());
    }
    format!("[{}] {}", header.join(" "), envelope.body)
}

fn format_elapsed(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    #[test]
    fn envelope_includes_sender_and_time() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        let text = format_agent_envelope(&Envelope {
            channel: "QQ",
            from: "Alice@群1",
            body: "hello",
            timestamp: Some(ts),
            previous_timestamp: None,
        });
        assert_eq!(text, "[QQ Alice@群1 2026-03-01 08:30 UTC] hello");
    }

    #[test]
    fn envelope_shows_elapsed_since_previous() {
        let prev = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 8, 5, 0).unwrap();
        let text = format_agent_envelope(&Envelope {
            channel: "QQ",
            from: "Bob",
            body: "hi",
            timestamp: Some(ts),
            previous_timestamp: Some(prev),
        });
        assert!(text.starts_with("[QQ Bob +5m "));
    }

    #[test]
    fn envelope_without_metadata() {
        let text = format_agent_envelope(&Envelope {
            channel: "QQ",
            from: "",
            body: "x",
            timestamp: None,
            previous_timestamp: None,
        });
        assert_eq!(text, "[QQ] x");
    }
}
