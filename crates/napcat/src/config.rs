//! Account configuration under `channels.napcatqq.accounts.<id>`.
//!
//! The host config is a plain JSON document; this module reads typed views
//! out of it and applies the small in-place edits the channel performs
//! (approvals, setup, logout).

use std::time::Duration;

use {
    napgate_channels::{
        debounce::DEFAULT_DEBOUNCE_WINDOW,
        gating::{DmPolicy, GroupPolicy, normalize_allowlist},
    },
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Deserializer},
    serde_json::{Map, Value},
    tracing::warn,
};

use crate::{CHANNEL_ID, frame::value_to_id};

pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Buffered group messages per chat when nothing else is configured.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DmConfig {
    pub policy: DmPolicy,
    /// `None` when the key is absent, which makes approvals fall back to
    /// the top-level `allowFrom`.
    #[serde(deserialize_with = "opt_id_list")]
    pub allow_from: Option<Vec<String>>,
}

/// Configuration for one NapCat (QQ) bot account.
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NapCatAccountConfig {
    #[serde(skip)]
    pub account_id: String,
    pub enabled: bool,
    /// NapCat forward WebSocket, `ws://` or `wss://`.
    pub ws_url: String,
    /// OneBot access token, sent as a bearer header.
    #[serde(deserialize_with = "opt_secret")]
    pub access_token: Option<Secret<String>>,
    /// Bot QQ number, written back after the first successful probe.
    #[serde(deserialize_with = "opt_id")]
    pub self_id: Option<String>,
    pub require_mention: bool,
    pub command_prefix: String,
    /// Owner QQ numbers: approvals and control commands.
    #[serde(deserialize_with = "id_list")]
    pub allow_from: Vec<String>,
    pub group_policy: GroupPolicy,
    /// Approved groups, `g<id>` or bare ids.
    #[serde(deserialize_with = "id_list")]
    pub group_allow_from: Vec<String>,
    pub history_limit: Option<usize>,
    pub dm: DmConfig,
    #[serde(deserialize_with = "opt_id")]
    pub default_to: Option<String>,
    pub auto_accept_friend: bool,
    pub auto_accept_group_invite: bool,
    pub emoji_ack: bool,
}

impl Default for NapCatAccountConfig {
    fn default() -> Self {
        Self {
            account_id: DEFAULT_ACCOUNT_ID.into(),
            enabled: true,
            ws_url: String::new(),
            access_token: None,
            self_id: None,
            require_mention: true,
            command_prefix: "/".into(),
            allow_from: Vec::new(),
            group_policy: GroupPolicy::default(),
            group_allow_from: Vec::new(),
            history_limit: None,
            dm: DmConfig::default(),
            default_to: None,
            auto_accept_friend: false,
            auto_accept_group_invite: false,
            emoji_ack: false,
        }
    }
}

impl std::fmt::Debug for NapCatAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NapCatAccountConfig")
            .field("account_id", &self.account_id)
            .field("enabled", &self.enabled)
            .field("ws_url", &self.ws_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("group_policy", &self.group_policy)
            .field("dm_policy", &self.dm.policy)
            .finish_non_exhaustive()
    }
}

impl NapCatAccountConfig {
    pub fn is_configured(&self) -> bool {
        !self.ws_url.trim().is_empty()
    }

    pub fn unconfigured_reason(&self) -> Option<&'static str> {
        (!self.is_configured()).then_some("Missing wsUrl (NapCat WebSocket address)")
    }

    pub fn access_token_str(&self) -> Option<&str> {
        self.access_token
            .as_ref()
            .map(|t| t.expose_secret().as_str())
            .filter(|t| !t.is_empty())
    }

    /// `dm.allowFrom` followed by `allowFrom`, without duplicates. Doubles as
    /// the owner list.
    pub fn resolve_allow_from(&self) -> Vec<String> {
        let mut merged: Vec<String> = Vec::new();
        for id in self.dm.allow_from.iter().flatten().chain(&self.allow_from) {
            if !merged.contains(id) {
                merged.push(id.clone());
            }
        }
        merged
    }

    /// Ids that receive approval requests and notices.
    pub fn owner_ids(&self) -> Vec<String> {
        self.resolve_allow_from()
            .into_iter()
            .filter(|id| id != "*")
            .collect()
    }

    /// Seed for the in-memory approved-group set: `g<id>` and bare numeric
    /// entries of `groupAllowFrom`.
    pub fn approved_group_seed(&self) -> Vec<String> {
        self.group_allow_from
            .iter()
            .filter(|e| e.starts_with('g') || is_digits(e))
            .cloned()
            .collect()
    }

    /// Numeric group ids listed in `groupAllowFrom`.
    pub fn allowed_group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for entry in &self.group_allow_from {
            let id = entry.strip_prefix('g').unwrap_or(entry);
            if is_digits(id) && !ids.iter().any(|i| i == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

pub(crate) fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Trimmed, lowercased account id; empty becomes `default`.
pub fn normalize_account_id(raw: Option<&str>) -> String {
    let id = raw.unwrap_or_default().trim().to_lowercase();
    if id.is_empty() {
        DEFAULT_ACCOUNT_ID.into()
    } else {
        id
    }
}

fn accounts(cfg: &Value) -> Option<&Map<String, Value>> {
    cfg.pointer("/channels/napcatqq/accounts")?.as_object()
}

fn accounts_mut(cfg: &mut Value) -> Option<&mut Map<String, Value>> {
    cfg.pointer_mut("/channels/napcatqq/accounts")?.as_object_mut()
}

pub fn list_account_ids(cfg: &Value) -> Vec<String> {
    accounts(cfg)
        .map(|a| a.keys().cloned().collect())
        .unwrap_or_default()
}

/// `default` when present, else the first configured id, else `default`.
pub fn default_account_id(cfg: &Value) -> String {
    let ids = list_account_ids(cfg);
    if ids.iter().any(|id| id == DEFAULT_ACCOUNT_ID) {
        return DEFAULT_ACCOUNT_ID.into();
    }
    ids.into_iter()
        .next()
        .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.into())
}

/// The raw JSON entry of an account.
pub fn account_value<'a>(cfg: &'a Value, account_id: &str) -> Option<&'a Value> {
    accounts(cfg)?.get(&normalize_account_id(Some(account_id)))
}

/// Typed account view. Missing accounts resolve to defaults; a malformed
/// entry is logged and also resolves to defaults.
pub fn resolve_account(cfg: &Value, account_id: Option<&str>) -> NapCatAccountConfig {
    let id = normalize_account_id(account_id);
    let mut account = match accounts(cfg).and_then(|a| a.get(&id)) {
        Some(raw) => serde_json::from_value::<NapCatAccountConfig>(raw.clone()).unwrap_or_else(|e| {
            warn!(account_id = %id, error = %e, "invalid NapCat account config, using defaults");
            NapCatAccountConfig::default()
        }),
        None => NapCatAccountConfig::default(),
    };
    account.account_id = id;
    account
}

/// The account's JSON object, creating `channels.napcatqq.accounts.<id>`
/// on the way. `None` when the document root is not an object.
pub fn account_entry_mut<'a>(
    cfg: &'a mut Value,
    account_id: &str,
) -> Option<&'a mut Map<String, Value>> {
    let id = normalize_account_id(Some(account_id));
    let mut node = cfg;
    for key in ["channels", CHANNEL_ID, "accounts", id.as_str()] {
        let map = node.as_object_mut()?;
        let child = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        node = child;
    }
    node.as_object_mut()
}

/// Returns whether anything changed.
pub fn set_account_enabled(cfg: &mut Value, account_id: &str, enabled: bool) -> bool {
    let Some(entry) = account_entry_mut(cfg, account_id) else {
        return false;
    };
    if entry.get("enabled").and_then(Value::as_bool) == Some(enabled) {
        return false;
    }
    entry.insert("enabled".into(), Value::Bool(enabled));
    true
}

pub fn delete_account(cfg: &mut Value, account_id: &str) -> bool {
    accounts_mut(cfg)
        .and_then(|a| a.remove(&normalize_account_id(Some(account_id))))
        .is_some()
}

/// Set `enabled = false` on every configured account.
pub fn disable_all(cfg: &mut Value) -> bool {
    let mut changed = false;
    for id in list_account_ids(cfg) {
        changed |= set_account_enabled(cfg, &id, false);
    }
    changed
}

/// Trim entries and drop empty ones.
pub fn format_allow_from(entries: &[String]) -> Vec<String> {
    normalize_allowlist(entries)
}

pub fn resolve_default_to(cfg: &Value, account_id: &str) -> Option<String> {
    resolve_account(cfg, Some(account_id)).default_to
}

/// Account limit, then `messages.groupChat.historyLimit`, then 50; never 0.
pub fn history_limit(cfg: &Value, account: &NapCatAccountConfig) -> usize {
    account
        .history_limit
        .or_else(|| {
            cfg.pointer("/messages/groupChat/historyLimit")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
        })
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .max(1)
}

/// `channels.napcatqq.debounceMs`, then `messages.inbound.debounceMs`,
/// then the shared default window.
pub fn debounce_window(cfg: &Value) -> Duration {
    cfg.pointer("/channels/napcatqq/debounceMs")
        .and_then(Value::as_u64)
        .or_else(|| {
            cfg.pointer("/messages/inbound/debounceMs")
                .and_then(Value::as_u64)
        })
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_DEBOUNCE_WINDOW)
}

/// Append `id` to a string list stored under `key`, keeping existing entries
/// (numbers are rendered as strings). Returns whether the list changed.
pub(crate) fn push_unique(map: &mut Map<String, Value>, key: &str, base: &[String], id: &str) -> bool {
    if base.iter().any(|e| e == id) {
        return false;
    }
    let mut list: Vec<Value> = base.iter().cloned().map(Value::String).collect();
    list.push(Value::String(id.to_string()));
    map.insert(key.to_string(), Value::Array(list));
    true
}

/// Read a list of ids (strings or numbers) out of a JSON value.
pub(crate) fn ids_from_value(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(value_to_id)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// An existing account entry; unlike [`account_entry_mut`] nothing is created.
fn existing_entry_mut<'a>(cfg: &'a mut Value, account_id: &str) -> Option<&'a mut Map<String, Value>> {
    accounts_mut(cfg)?
        .get_mut(&normalize_account_id(Some(account_id)))?
        .as_object_mut()
}

/// Persist a group approval as `g<id>` unless the group is already listed
/// in either form.
pub fn add_allowed_group(cfg: &mut Value, account_id: &str, group_id: &str) -> bool {
    let Some(entry) = existing_entry_mut(cfg, account_id) else {
        return false;
    };
    let existing = ids_from_value(entry.get("groupAllowFrom"));
    let prefixed = format!("g{group_id}");
    if existing.iter().any(|e| *e == prefixed || e == group_id) {
        return false;
    }
    push_unique(entry, "groupAllowFrom", &existing, &prefixed)
}

/// Drop both forms of a group id from `groupAllowFrom`.
pub fn remove_allowed_group(cfg: &mut Value, account_id: &str, group_id: &str) -> bool {
    let Some(entry) = existing_entry_mut(cfg, account_id) else {
        return false;
    };
    let existing = ids_from_value(entry.get("groupAllowFrom"));
    let prefixed = format!("g{group_id}");
    let kept: Vec<Value> = existing
        .iter()
        .filter(|e| **e != prefixed && *e != group_id)
        .cloned()
        .map(Value::String)
        .collect();
    if kept.len() == existing.len() {
        return false;
    }
    entry.insert("groupAllowFrom".into(), Value::Array(kept));
    true
}

fn dm_entry_mut(entry: &mut Map<String, Value>) -> Option<&mut Map<String, Value>> {
    let dm = entry
        .entry("dm")
        .or_insert_with(|| Value::Object(Map::new()));
    if !dm.is_object() {
        *dm = Value::Object(Map::new());
    }
    dm.as_object_mut()
}

/// Approve a DM sender: append to `dm.allowFrom`, seeded from the top-level
/// `allowFrom` when `dm.allowFrom` is absent.
pub fn add_dm_allow(cfg: &mut Value, account_id: &str, user_id: &str) -> bool {
    let Some(entry) = existing_entry_mut(cfg, account_id) else {
        return false;
    };
    let dm_list = entry.get("dm").and_then(|dm| dm.get("allowFrom"));
    let base = match dm_list {
        Some(list) if list.is_array() => ids_from_value(Some(list)),
        _ => ids_from_value(entry.get("allowFrom")),
    };
    if base.iter().any(|e| e == user_id) {
        return false;
    }
    dm_entry_mut(entry).is_some_and(|dm| push_unique(dm, "allowFrom", &base, user_id))
}

/// Merge pairing-store ids into `dm.allowFrom`. Returns how many were added.
pub fn merge_dm_allow(cfg: &mut Value, account_id: &str, ids: &[String]) -> usize {
    let Some(dm) = existing_entry_mut(cfg, account_id).and_then(dm_entry_mut) else {
        return 0;
    };
    let mut merged = ids_from_value(dm.get("allowFrom"));
    let before = merged.len();
    for id in ids {
        if !id.is_empty() && !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    let added = merged.len() - before;
    if added > 0 {
        dm.insert(
            "allowFrom".into(),
            Value::Array(merged.into_iter().map(Value::String).collect()),
        );
    }
    added
}

/// Record the bot's QQ number on an existing account entry.
pub fn set_self_id(cfg: &mut Value, account_id: &str, self_id: &str) -> bool {
    let Some(entry) = existing_entry_mut(cfg, account_id) else {
        return false;
    };
    if self_id.is_empty() || entry.get("selfId").map(value_to_id).as_deref() == Some(self_id) {
        return false;
    }
    entry.insert("selfId".into(), Value::String(self_id.to_string()));
    true
}

/// Result of removing connection secrets from an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutResult {
    /// A non-empty `accessToken` or `wsUrl` was removed.
    pub cleared: bool,
    pub logged_out: bool,
}

/// Remove `accessToken` and `wsUrl`; an entry left empty is deleted.
/// Returns the outcome and whether the document changed.
pub fn clear_credentials(cfg: &mut Value, account_id: &str) -> (LogoutResult, bool) {
    let id = normalize_account_id(Some(account_id));
    let Some(accounts) = accounts_mut(cfg) else {
        return (LogoutResult::default(), false);
    };
    let Some(entry) = accounts.get_mut(&id).and_then(Value::as_object_mut) else {
        return (LogoutResult::default(), false);
    };
    let mut cleared = false;
    let mut changed = false;
    for key in ["accessToken", "wsUrl"] {
        if let Some(old) = entry.remove(key) {
            changed = true;
            cleared |= match old {
                Value::Null | Value::Bool(false) => false,
                Value::String(s) => !s.is_empty(),
                _ => true,
            };
        }
    }
    if entry.is_empty() {
        accounts.remove(&id);
    }
    (
        LogoutResult {
            cleared,
            logged_out: cleared,
        },
        changed,
    )
}

fn id_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(ids_from_value(Some(&value)))
}

fn opt_id_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<String>>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.is_array().then(|| ids_from_value(Some(&value))))
}

fn opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let id = value_to_id(&Value::deserialize(deserializer)?);
    Ok((!id.is_empty()).then_some(id))
}

fn opt_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Secret<String>>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.is_empty())
        .map(Secret::new))
}
