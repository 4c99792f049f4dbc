//! Operator-facing helpers: target parsing, security warnings, status
//! summaries, setup and onboarding edits of the config document.

use {
    napgate_channels::gating::{DmPolicy, GroupPolicy},
    napgate_common::ChatType,
    serde::Serialize,
    serde_json::{Map, Value},
};

use crate::{
    CHANNEL_ID,
    config::{NapCatAccountConfig, account_entry_mut, is_digits, list_account_ids, resolve_account},
    state::AccountStatus,
};

/// Hint shown next to target prompts.
pub const TARGET_HINT: &str = "QQ号 (如 12345678) 或群号 (如 g87654321)";

/// A parsed send target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTarget {
    pub chat_type: ChatType,
    /// Bare QQ number or group number.
    pub id: String,
}

impl OutboundTarget {
    /// `<qq>` or `g<group>`.
    pub fn as_target(&self) -> String {
        match self.chat_type {
            ChatType::Group => format!("g{}", self.id),
            ChatType::Direct => self.id.clone(),
        }
    }
}

fn strip_channel_prefix(raw: &str) -> &str {
    let prefix = CHANNEL_ID.len();
    match raw.get(..prefix) {
        Some(head) if head.eq_ignore_ascii_case(CHANNEL_ID) && raw[prefix..].starts_with(':') => {
            &raw[prefix + 1..]
        },
        _ => raw,
    }
}

/// Canonical target: digits for a user, lowercase `g<digits>` for a group.
/// An optional `napcatqq:` prefix is accepted.
pub fn normalize_target(raw: &str) -> Option<String> {
    let trimmed = strip_channel_prefix(raw.trim()).trim();
    if is_digits(trimmed) {
        return Some(trimmed.to_string());
    }
    let group = trimmed
        .strip_prefix('g')
        .or_else(|| trimmed.strip_prefix('G'))?;
    is_digits(group).then(|| format!("g{group}"))
}

pub fn looks_like_id(raw: &str) -> bool {
    normalize_target(raw).is_some()
}

pub fn parse_target(raw: &str) -> Option<OutboundTarget> {
    let target = normalize_target(raw)?;
    Some(match target.strip_prefix('g') {
        Some(gid) => OutboundTarget {
            chat_type: ChatType::Group,
            id: gid.to_string(),
        },
        None => OutboundTarget {
            chat_type: ChatType::Direct,
            id: target,
        },
    })
}

/// `群<id>` for groups, `QQ<id>` for users; a known display name wins.
pub fn format_target_display(target: &str, display: Option<&str>) -> String {
    if let Some(display) = display.filter(|d| !d.is_empty()) {
        return display.to_string();
    }
    match target.strip_prefix('g') {
        Some(gid) => format!("群{gid}"),
        None => format!("QQ{target}"),
    }
}

/// Configurations that let anyone reach the bot.
pub fn collect_warnings(account: &NapCatAccountConfig) -> Vec<String> {
    let id = &account.account_id;
    let allow_from = account
        .dm
        .allow_from
        .clone()
        .unwrap_or_else(|| account.allow_from.clone());
    let mut warnings = Vec::new();
    if account.dm.policy == DmPolicy::Open && allow_from.is_empty() {
        warnings.push(format!(
            "- NapCatQQ ({id}): dm.policy=\"open\" with no allowFrom, any QQ user can trigger the bot. Set dm.policy=\"pairing\" or configure allowFrom."
        ));
    }
    if allow_from.iter().any(|e| e == "*") {
        warnings.push(format!(
            "- NapCatQQ ({id}): allowFrom contains \"*\", any QQ user can trigger the bot without pairing."
        ));
    }
    if account.group_policy == GroupPolicy::Open {
        warnings.push(format!(
            "- NapCatQQ ({id}): groupPolicy=\"open\", any group can trigger the bot (mention-gated). Set groupPolicy=\"allowlist\" + groupAllowFrom to restrict."
        ));
    }
    warnings
}

/// Warnings for every configured account.
pub fn collect_all_warnings(cfg: &Value) -> Vec<String> {
    list_account_ids(cfg)
        .iter()
        .flat_map(|id| collect_warnings(&resolve_account(cfg, Some(id))))
        .collect()
}

/// Per-account status merged with its config.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub enabled: bool,
    pub configured: bool,
    #[serde(flatten)]
    pub status: AccountStatus,
}

impl AccountSnapshot {
    pub fn new(account: &NapCatAccountConfig, status: Option<AccountStatus>) -> Self {
        let status = status.unwrap_or_else(|| AccountStatus {
            account_id: account.account_id.clone(),
            ..Default::default()
        });
        Self {
            enabled: account.enabled,
            configured: account.is_configured(),
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    /// `connected`, `connecting` or `stopped`.
    pub status: &'static str,
    pub bot: Option<String>,
    pub configured: bool,
    pub connected: bool,
}

pub fn channel_summary(snapshot: &AccountSnapshot) -> ChannelSummary {
    let status = &snapshot.status;
    let label = if status.connected {
        "connected"
    } else if status.running {
        "connecting"
    } else {
        "stopped"
    };
    ChannelSummary {
        status: label,
        bot: status.bot.as_ref().map(|b| b.label()),
        configured: snapshot.configured,
        connected: status.connected,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Config,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusIssue {
    pub account_id: String,
    pub kind: IssueKind,
    pub message: String,
    pub fix: String,
}

pub fn collect_status_issues(snapshots: &[AccountSnapshot]) -> Vec<StatusIssue> {
    let mut issues = Vec::new();
    for snap in snapshots {
        let id = &snap.status.account_id;
        if !snap.configured {
            issues.push(StatusIssue {
                account_id: id.clone(),
                kind: IssueKind::Config,
                message: "NapCat WebSocket URL not configured".into(),
                fix: format!("Set channels.{CHANNEL_ID}.accounts.{id}.wsUrl"),
            });
        }
        if snap.enabled && snap.configured && !snap.status.connected && !snap.status.running {
            issues.push(StatusIssue {
                account_id: id.clone(),
                kind: IssueKind::Runtime,
                message: "Account enabled but not running".into(),
                fix: "Check the gateway logs or restart the account".into(),
            });
        }
    }
    issues
}

/// Input of the non-interactive `setup` command.
#[derive(Debug, Clone, Default)]
pub struct SetupInput {
    pub url: Option<String>,
    pub token: Option<String>,
}

pub fn validate_setup_input(input: &SetupInput) -> Result<(), String> {
    if input.url.as_deref().is_none_or(|u| u.trim().is_empty()) {
        return Err("NapCatQQ requires a WebSocket URL (--url wss://...).".into());
    }
    Ok(())
}

/// Merge `enabled`, `wsUrl` and an optional `accessToken` into the account,
/// keeping its other keys.
pub fn apply_setup(cfg: &mut Value, account_id: &str, input: &SetupInput) -> bool {
    let Some(entry) = account_entry_mut(cfg, account_id) else {
        return false;
    };
    entry.insert("enabled".into(), Value::Bool(true));
    entry.insert(
        "wsUrl".into(),
        Value::String(input.url.as_deref().unwrap_or_default().trim().to_string()),
    );
    if let Some(token) = input.token.as_deref().filter(|t| !t.is_empty()) {
        entry.insert("accessToken".into(), Value::String(token.to_string()));
    }
    true
}

pub fn validate_ws_url(url: &str) -> Result<(), String> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err("Must start with ws:// or wss://".into())
    }
}

pub fn validate_owner_id(owner: &str) -> Result<(), String> {
    if is_digits(owner.trim()) {
        Ok(())
    } else {
        Err("Please enter a valid QQ number (digits only)".into())
    }
}

/// Answers collected by the interactive onboarding flow.
#[derive(Debug, Clone)]
pub struct OnboardingAnswers {
    pub ws_url: String,
    pub access_token: Option<String>,
    pub dm_policy: DmPolicy,
    pub owner_id: String,
    pub group_policy: GroupPolicy,
    /// Ignored when groups are disabled.
    pub require_mention: bool,
}

impl OnboardingAnswers {
    pub fn validate(&self) -> Result<(), String> {
        validate_ws_url(&self.ws_url)?;
        validate_owner_id(&self.owner_id)
    }
}

/// Replace the account entry with the onboarding answers.
pub fn apply_onboarding(
    cfg: &mut Value,
    account_id: &str,
    answers: &OnboardingAnswers,
) -> Result<(), String> {
    answers.validate()?;
    let entry = account_entry_mut(cfg, account_id).ok_or("config root must be an object")?;
    let mut fresh = Map::new();
    fresh.insert("enabled".into(), Value::Bool(true));
    fresh.insert("wsUrl".into(), Value::String(answers.ws_url.clone()));
    if let Some(token) = answers.access_token.as_deref().filter(|t| !t.is_empty()) {
        fresh.insert("accessToken".into(), Value::String(token.to_string()));
    }
    let mut dm = Map::new();
    dm.insert("policy".into(), Value::String(answers.dm_policy.as_str().into()));
    fresh.insert("dm".into(), Value::Object(dm));
    fresh.insert(
        "allowFrom".into(),
        Value::Array(vec![Value::String(answers.owner_id.trim().to_string())]),
    );
    fresh.insert(
        "groupPolicy".into(),
        Value::String(answers.group_policy.as_str().into()),
    );
    if answers.group_policy != GroupPolicy::Disabled {
        fresh.insert("requireMention".into(), Value::Bool(answers.require_mention));
    }
    *entry = fresh;
    Ok(())
}

/// One line per account, or a single line when none exist.
pub fn onboarding_status(cfg: &Value) -> Vec<String> {
    let ids = list_account_ids(cfg);
    if ids.is_empty() {
        return vec!["No accounts configured.".into()];
    }
    ids.iter()
        .map(|id| {
            let account = resolve_account(cfg, Some(id));
            if account.is_configured() {
                format!("✅ {id}: {}", account.ws_url)
            } else {
                format!("❌ {id}: wsUrl not set")
            }
        })
        .collect()
}
