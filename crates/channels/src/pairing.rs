use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    rand::{Rng, distr::Alphanumeric},
};

/// Message sent to a user once an owner approved them.
pub const PAIRING_APPROVED_MESSAGE: &str =
    "✅ Access approved. Send a message to start chatting.";

/// Maximum pending requests kept per channel account.
pub const MAX_PENDING_REQUESTS: usize = 3;

const PAIRING_CODE_LEN: usize = 8;

/// A pending DM pairing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub id: String,
    pub code: String,
    /// Display name or other metadata supplied by the channel.
    pub name: Option<String>,
    /// False when an existing request for the same id was refreshed.
    pub created: bool,
}

/// Host-owned store of approved senders and pending pairing requests.
#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Ids approved through pairing for a channel account.
    async fn read_allow_from(&self, channel: &str, account_id: &str) -> Result<Vec<String>>;

    /// Create or refresh a pending request. Returns `None` when the store
    /// refuses new requests (too many pending).
    async fn upsert_request(
        &self,
        channel: &str,
        account_id: &str,
        id: &str,
        name: Option<&str>,
    ) -> Result<Option<PairingRequest>>;
}

#[derive(Default)]
struct ScopeState {
    approved: Vec<String>,
    pending: Vec<PairingRequest>,
}

/// In-process pairing store.
#[derive(Default, Clone)]
pub struct MemoryPairingStore {
    scopes: Arc<Mutex<HashMap<(String, String), ScopeState>>>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an id approved, dropping any pending request for it.
    pub fn approve(&self, channel: &str, account_id: &str, id: &str) {
        let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        let scope = scopes
            .entry((channel.to_string(), account_id.to_string()))
            .or_default();
        scope.pending.retain(|r| r.id != id);
        if !scope.approved.iter().any(|a| a == id) {
            scope.approved.push(id.to_string());
        }
    }

    pub fn pending(&self, channel: &str, account_id: &str) -> Vec<PairingRequest> {
        let scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        scopes
            .get(&(channel.to_string(), account_id.to_string()))
            .map(|s| s.pending.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PairingStore for MemoryPairingStore {
    async fn read_allow_from(&self, channel: &str, account_id: &str) -> Result<Vec<String>> {
        let scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(scopes
            .get(&(channel.to_string(), account_id.to_string()))
            .map(|s| s.approved.clone())
            .unwrap_or_default())
    }

    async fn upsert_request(
        &self,
        channel: &str,
        account_id: &str,
        id: &str,
        name: Option<&str>,
    ) -> Result<Option<PairingRequest>> {
        let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        let scope = scopes
            .entry((channel.to_string(), account_id.to_string()))
            .or_default();

        if let Some(existing) = scope.pending.iter_mut().find(|r| r.id == id) {
            if let Some(name) = name {
                existing.name = Some(name.to_string());
            }
            let mut refreshed = existing.clone();
            refreshed.created = false;
            return Ok(Some(refreshed));
        }

        if scope.pending.len() >= MAX_PENDING_REQUESTS {
            return Ok(None);
        }

        let request = PairingRequest {
            id: id.to_string(),
            code: generate_code(),
            name: name.map(str::to_string),
            created: true,
        };
        scope.pending.push(request.clone());
        Ok(Some(request))
    }
}

fn generate_code() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PAIRING_CODE_LEN)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect()
}
