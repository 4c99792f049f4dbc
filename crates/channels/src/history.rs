//! Bounded per-chat buffer of messages the bot saw but did not answer.
//!
//! Suppressed group messages are kept here and replayed as context the next
//! time the bot is addressed in the same chat.

use std::collections::{HashMap, VecDeque};

/// Default number of entries kept per chat.
pub const DEFAULT_GROUP_HISTORY_LIMIT: usize = 50;

/// Maximum number of chats tracked at once; the least recently written chat
/// is dropped beyond this.
pub const MAX_HISTORY_KEYS: usize = 1000;

pub const HISTORY_CONTEXT_MARKER: &str = "[Chat messages since your last reply - for context]";
pub const CURRENT_MESSAGE_MARKER: &str = "[Current message - respond to this]";

/// A message kept for later context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sender: String,
    pub body: String,
    /// Unix milliseconds.
    pub timestamp: Option<i64>,
    pub message_id: Option<String>,
}

#[derive(Debug)]
pub struct GroupHistory {
    limit: usize,
    max_keys: usize,
    chats: HashMap<String, VecDeque<HistoryEntry>>,
    /// Chat keys, least recently written first.
    order: VecDeque<String>,
}

impl GroupHistory {
    /// A `limit` of zero is raised to one.
    pub fn new(limit: usize) -> Self {
        Self::with_max_keys(limit, MAX_HISTORY_KEYS)
    }

    pub fn with_max_keys(limit: usize, max_keys: usize) -> Self {
        Self {
            limit: limit.max(1),
            max_keys: max_keys.max(1),
            chats: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append an entry, evicting the oldest entry of the chat on overflow and
    /// the least recently written chat when too many chats are tracked.
    pub fn record(&mut self, key: &str, entry: HistoryEntry) {
        let entries = self.chats.entry(key.to_string()).or_default();
        entries.push_back(entry);
        while entries.len() > self.limit {
            entries.pop_front();
        }
        self.touch(key);
        self.evict_old_keys();
    }

    pub fn entries(&self, key: &str) -> Vec<HistoryEntry> {
        self.chats
            .get(key)
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, key: &str) -> usize {
        self.chats.get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    pub fn clear(&mut self, key: &str) {
        self.chats.remove(key);
        self.order.retain(|k| k != key);
    }

    /// Render buffered entries followed by the current message.
    ///
    /// Returns `None` when the chat has no buffered entries, in which case the
    /// caller uses the current message as is.
    pub fn build_context(
        &self,
        key: &str,
        current_message: &str,
        format_entry: impl Fn(&HistoryEntry) -> String,
    ) -> Option<String> {
        let entries = self.chats.get(key)?;
        if entries.is_empty() {
            return None;
        }
        let lines: Vec<String> = entries.iter().map(format_entry).collect();
        Some(format!(
            "{HISTORY_CONTEXT_MARKER}\n{}\n\n{CURRENT_MESSAGE_MARKER}\n{current_message}",
            lines.join("\n")
        ))
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn evict_old_keys(&mut self) {
        while self.order.len() > self.max_keys {
            if let Some(oldest) = self.order.pop_front() {
                self.chats.remove(&oldest);
            }
        }
    }
}

impl Default for GroupHistory {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_HISTORY_LIMIT)
    }
}
