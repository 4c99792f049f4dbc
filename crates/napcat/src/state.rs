//! Mutable per-account state shared by the event loop, the handler and the
//! status surface. All locks are synchronous and never held across `.await`.

use std::{
    collections::HashSet,
    sync::{
        Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    chrono::{DateTime, Utc},
    napgate_channels::history::{GroupHistory, HistoryEntry},
    serde::Serialize,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotIdentity {
    pub user_id: String,
    pub nickname: String,
}

impl BotIdentity {
    /// Nickname, or `QQ <id>` when NapCat reports none.
    pub fn label(&self) -> String {
        if self.nickname.is_empty() {
            format!("QQ {}", self.user_id)
        } else {
            self.nickname.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountStatus {
    pub account_id: String,
    pub running: bool,
    pub connected: bool,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_stop_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub bot: Option<BotIdentity>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct AccountState {
    pub account_id: String,
    self_id: RwLock<String>,
    /// Cleared on abort; callbacks from a stopped client check it first.
    active: AtomicBool,
    approved_groups: Mutex<HashSet<String>>,
    notified_groups: Mutex<HashSet<String>>,
    history: Mutex<GroupHistory>,
    status: RwLock<AccountStatus>,
}

impl AccountState {
    pub fn new(
        account_id: impl Into<String>,
        self_id: Option<String>,
        approved_seed: impl IntoIterator<Item = String>,
        history_limit: usize,
    ) -> Self {
        let account_id = account_id.into();
        Self {
            status: RwLock::new(AccountStatus {
                account_id: account_id.clone(),
                ..Default::default()
            }),
            account_id,
            self_id: RwLock::new(self_id.unwrap_or_default()),
            active: AtomicBool::new(true),
            approved_groups: Mutex::new(approved_seed.into_iter().collect()),
            notified_groups: Mutex::new(HashSet::new()),
            history: Mutex::new(GroupHistory::new(history_limit)),
        }
    }

    pub fn self_id(&self) -> String {
        self.self_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Set the bot id unless one is already known. Returns whether it was set.
    pub fn set_self_id_if_empty(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        let mut current = self.self_id.write().unwrap_or_else(|e| e.into_inner());
        if !current.is_empty() {
            return false;
        }
        *current = id.to_string();
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the group (bare or `g`-prefixed) was approved at runtime or
    /// seeded from config.
    pub fn is_group_approved(&self, group_id: &str) -> bool {
        let approved = lock(&self.approved_groups);
        approved.contains(group_id) || approved.contains(&format!("g{group_id}"))
    }

    pub fn approve_group(&self, group_id: &str) {
        {
            let mut approved = lock(&self.approved_groups);
            approved.insert(group_id.to_string());
            approved.insert(format!("g{group_id}"));
        }
        lock(&self.notified_groups).remove(group_id);
    }

    pub fn revoke_group(&self, group_id: &str) {
        let mut approved = lock(&self.approved_groups);
        approved.remove(group_id);
        approved.remove(&format!("g{group_id}"));
    }

    pub fn has_approved_groups(&self) -> bool {
        !lock(&self.approved_groups).is_empty()
    }

    /// Mark a group as notified. Returns true only for the first call per
    /// group, so owners are asked once.
    pub fn mark_notified(&self, group_id: &str) -> bool {
        lock(&self.notified_groups).insert(group_id.to_string())
    }

    pub fn record_history(&self, chat_id: &str, entry: HistoryEntry) {
        lock(&self.history).record(chat_id, entry);
    }

    pub fn history_len(&self, chat_id: &str) -> usize {
        lock(&self.history).len(chat_id)
    }

    /// Run `f` against the history buffer under its lock.
    pub fn with_history<R>(&self, f: impl FnOnce(&mut GroupHistory) -> R) -> R {
        f(&mut lock(&self.history))
    }

    pub fn status(&self) -> AccountStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update_status(&self, f: impl FnOnce(&mut AccountStatus)) {
        f(&mut self.status.write().unwrap_or_else(|e| e.into_inner()));
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AccountState {
        AccountState::new("default", None, vec!["g100".to_string()], 10)
    }

    #[test]
    fn self_id_is_set_once() {
        let s = state();
        assert!(s.set_self_id_if_empty("42"));
        assert!(!s.set_self_id_if_empty("43"));
        assert_eq!(s.self_id(), "42");
        assert!(!s.set_self_id_if_empty(""));
    }

    #[test]
    fn approvals_cover_both_id_forms() {
        let s = state();
        assert!(s.is_group_approved("100"));
        assert!(!s.is_group_approved("200"));
        assert!(s.mark_notified("200"));
        assert!(!s.mark_notified("200"));
        s.approve_group("200");
        assert!(s.is_group_approved("200"));
        assert!(s.mark_notified("200"));
        s.revoke_group("100");
        assert!(!s.is_group_approved("100"));
    }

    #[test]
    fn bot_label_falls_back_to_id() {
        let bot = BotIdentity {
            user_id: "42".into(),
            nickname: String::new(),
        };
        assert_eq!(bot.label(), "QQ 42");
    }
}
