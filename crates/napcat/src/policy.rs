//! Access decisions for inbound messages.
//!
//! Everything here is synchronous and side-effect free; the gateway applies
//! the decisions (history buffering, owner notifications, persistence).

use std::sync::LazyLock;

use {
    napgate_channels::gating::{DmPolicy, GroupPolicy, allowlist_matches},
    regex::Regex,
};

use crate::{config::NapCatAccountConfig, inbound::NormalizedInbound};

static APPROVE_GROUP: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:批准群|(?i:approve\s+group))\s*(\d+)\s*$").ok()
});

static APPROVE_USER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:批准用户|(?i:approve\s+user))\s*(\d+)\s*$").ok()
});

/// Outcome of the group policy and mention gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupGate {
    /// Handle the message. `strip_mention` is set when mention gating
    /// applied and the `@bot` token should be removed.
    Proceed { strip_mention: bool },
    /// Keep the message as history only.
    Suppress {
        reason: &'static str,
        /// The group is unapproved under `pairing`; owners should be asked
        /// (once per group).
        request_approval: bool,
    },
}

/// Whether a group passes `groupAllowFrom` or the runtime approvals.
///
/// With an empty list only `pairing` consults the approved set; an empty
/// allowlist admits nothing.
pub fn group_allowed(
    policy: GroupPolicy,
    group_allow_from: &[String],
    group_id: &str,
    sender_id: &str,
    approved: bool,
) -> bool {
    if group_allow_from.is_empty() {
        return policy == GroupPolicy::Pairing && approved;
    }
    let prefixed = format!("g{group_id}");
    group_allow_from.iter().any(|entry| {
        entry == "*" || entry == group_id || *entry == prefixed || entry == sender_id
    }) || approved
}

/// Evaluate group policy, then mention gating, for a group message.
///
/// `approved` is the runtime approval state of the group and `mentioned`
/// whether the bot was addressed.
pub fn evaluate_group_gate(
    account: &NapCatAccountConfig,
    group_id: Option<&str>,
    sender_id: &str,
    approved: bool,
    mentioned: bool,
) -> GroupGate {
    let policy = account.group_policy;
    if policy == GroupPolicy::Disabled {
        return GroupGate::Suppress {
            reason: "groupPolicy=disabled",
            request_approval: false,
        };
    }

    if let (GroupPolicy::Allowlist | GroupPolicy::Pairing, Some(gid)) = (policy, group_id)
        && !group_allowed(policy, &account.group_allow_from, gid, sender_id, approved)
    {
        return GroupGate::Suppress {
            reason: "group not allowed",
            request_approval: policy == GroupPolicy::Pairing,
        };
    }

    if account.require_mention {
        if !mentioned {
            return GroupGate::Suppress {
                reason: "no mention",
                request_approval: false,
            };
        }
        return GroupGate::Proceed {
            strip_mention: true,
        };
    }
    GroupGate::Proceed {
        strip_mention: false,
    }
}

/// Shortcut commands an owner can send the bot in a direct chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerCommand {
    ApproveGroup(String),
    ApproveUser(String),
}

pub fn parse_owner_command(text: &str) -> Option<OwnerCommand> {
    let capture = |re: &LazyLock<Option<Regex>>| {
        re.as_ref()?
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };
    capture(&APPROVE_GROUP)
        .map(OwnerCommand::ApproveGroup)
        .or_else(|| capture(&APPROVE_USER).map(OwnerCommand::ApproveUser))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmDecision {
    Allow,
    /// Unknown sender under `pairing`: create a request and tell owners.
    Pairing,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmAccess {
    pub decision: DmDecision,
    /// Configured entries followed by pairing-store entries.
    pub effective_allow_from: Vec<String>,
    pub reason: String,
}

/// Resolve direct-chat access for `sender_id`.
pub fn resolve_dm_access(
    policy: DmPolicy,
    configured: &[String],
    store: &[String],
    sender_id: &str,
) -> DmAccess {
    let mut effective_allow_from = configured.to_vec();
    for id in store {
        if !effective_allow_from.contains(id) {
            effective_allow_from.push(id.clone());
        }
    }

    let (decision, reason) = match policy {
        DmPolicy::Closed => (DmDecision::Block, "dmPolicy=disabled".to_string()),
        DmPolicy::Open => (DmDecision::Allow, "dmPolicy=open".to_string()),
        DmPolicy::Pairing if allowlist_matches(sender_id, &effective_allow_from) => {
            (DmDecision::Allow, "dmPolicy=pairing (allowlisted)".to_string())
        },
        DmPolicy::Pairing => (
            DmDecision::Pairing,
            "dmPolicy=pairing (not allowlisted)".to_string(),
        ),
    };
    DmAccess {
        decision,
        effective_allow_from,
        reason,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandGate {
    pub authorized: bool,
    pub should_block: bool,
}

/// Control commands need a configured allow-list that names the sender.
pub fn resolve_command_gate(
    effective_allow_from: &[String],
    sender_id: &str,
    has_control_command: bool,
) -> CommandGate {
    let authorized =
        !effective_allow_from.is_empty() && allowlist_matches(sender_id, effective_allow_from);
    CommandGate {
        authorized,
        should_block: has_control_command && !authorized,
    }
}

/// Coalesce a debounced burst into one message.
///
/// A single item is returned untouched. Otherwise the last item is the base,
/// non-empty texts are joined with newlines and media lists concatenated;
/// `None` when the joined text is blank.
pub fn merge_debounced(mut items: Vec<NormalizedInbound>) -> Option<NormalizedInbound> {
    if items.len() <= 1 {
        return items.pop();
    }
    let text = items
        .iter()
        .map(|i| i.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return None;
    }
    let mut image_urls = Vec::new();
    let mut audio_urls = Vec::new();
    let mut video_urls = Vec::new();
    let mut file_infos = Vec::new();
    for item in &mut items {
        image_urls.append(&mut item.image_urls);
        audio_urls.append(&mut item.audio_urls);
        video_urls.append(&mut item.video_urls);
        file_infos.append(&mut item.file_infos);
    }
    let mut merged = items.pop()?;
    merged.text = text;
    merged.image_urls = image_urls;
    merged.audio_urls = audio_urls;
    merged.video_urls = video_urls;
    merged.file_infos = file_infos;
    Some(merged)
}
