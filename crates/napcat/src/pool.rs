//! Account → client lookup shared by the runtime, outbound sends and the
//! directory.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::client::WsClient;

/// One live client per account id.
#[derive(Clone, Default)]
pub struct ClientPool {
    clients: Arc<RwLock<HashMap<String, Arc<WsClient>>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, returning the one it replaces.
    pub fn register(&self, account_id: &str, client: Arc<WsClient>) -> Option<Arc<WsClient>> {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_id.to_string(), client)
    }

    pub fn unregister(&self, account_id: &str) -> Option<Arc<WsClient>> {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(account_id)
    }

    /// Remove the entry only if it still points at `client`, so a stale
    /// runtime never evicts its replacement.
    pub fn unregister_if_same(&self, account_id: &str, client: &Arc<WsClient>) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        if clients
            .get(account_id)
            .is_some_and(|current| Arc::ptr_eq(current, client))
        {
            clients.remove(account_id);
            return true;
        }
        false
    }

    pub fn get(&self, account_id: &str) -> Option<Arc<WsClient>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(account_id)
            .cloned()
    }

    /// Any registered client, preferring connected ones. Ordered by account
    /// id for stable results.
    pub fn first_available(&self) -> Option<(String, Arc<WsClient>)> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = clients.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .iter()
            .find(|(_, c)| c.is_connected())
            .or_else(|| entries.first())
            .map(|(id, c)| ((*id).clone(), Arc::clone(c)))
    }

    pub fn account_ids(&self) -> Vec<String> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = clients.keys().cloned().collect();
        ids.sort();
        ids
    }
}
