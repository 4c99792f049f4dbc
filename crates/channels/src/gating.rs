use serde::{Deserialize, Serialize};

/// Check whether a sender matches an allow-list.
///
/// An empty list matches nobody; callers decide what an empty list means
/// for their policy. Entries are trimmed and compared case-insensitively,
/// `*` alone admits everyone and glob-style `*` wildcards are supported.
pub fn allowlist_matches(peer_id: &str, allowlist: &[String]) -> bool {
    let peer_lower = peer_id.trim().to_lowercase();
    if peer_lower.is_empty() {
        return false;
    }
    allowlist.iter().any(|pattern| {
        let pat = pattern.trim().to_lowercase();
        if pat.is_empty() {
            return false;
        }
        if pat.contains('*') {
            glob_match(&pat, &peer_lower)
        } else {
            pat == peer_lower
        }
    })
}

/// Simple glob matching supporting `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => {
                // First segment is anchored at the start
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            },
            None => return false,
        }
    }
    // Last segment is anchored at the end unless the pattern ends with *
    if !parts.last().unwrap_or(&"").is_empty() {
        pos == text.len()
    } else {
        true
    }
}

/// Normalize a raw allow-list: trim entries and drop empty ones.
pub fn normalize_allowlist<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .map(|e| e.as_ref().trim().to_string())
        .filter(|e| !e.is_empty())
        .collect()
}

/// Direct message access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Unknown senders must be approved by an owner first.
    #[default]
    Pairing,
    /// Anyone can DM the bot.
    Open,
    /// DMs are dropped.
    #[serde(alias = "disabled")]
    Closed,
}

impl DmPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pairing => "pairing",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for DmPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pairing" => Ok(Self::Pairing),
            "open" => Ok(Self::Open),
            "closed" | "disabled" => Ok(Self::Closed),
            other => Err(format!("unknown dm policy: {other}")),
        }
    }
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Group messages are only kept as history.
    #[default]
    Disabled,
    /// Every group may trigger the bot.
    Open,
    /// Only groups on the allow-list.
    Allowlist,
    /// New groups need an owner's approval.
    Pairing,
}

impl GroupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Open => "open",
            Self::Allowlist => "allowlist",
            Self::Pairing => "pairing",
        }
    }

    /// Whether approving a group has any effect under this policy.
    pub fn accepts_approvals(self) -> bool {
        matches!(self, Self::Allowlist | Self::Pairing)
    }
}

impl std::str::FromStr for GroupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "open" => Ok(Self::Open),
            "allowlist" => Ok(Self::Allowlist),
            "pairing" => Ok(Self::Pairing),
            other => Err(format!("unknown group policy: {other}")),
        }
    }
}

impl std::fmt::Display for GroupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for DmPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
