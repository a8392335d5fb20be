//! Outbound sessions of a client-mode processor, keyed by service

use crate::rpc::RpcClient;
use crate::{MinionError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// At most one live session per service
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, RpcClient>>,
}

impl SessionTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, RpcClient>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `client` as the session for its service
    ///
    /// Returns `false` if a live session for that service is already
    /// recorded; a stale closed one is replaced.
    pub fn insert(&self, client: RpcClient) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(client.service()) {
            Some(existing) if !existing.is_closed() => false,
            _ => {
                sessions.insert(client.service().to_string(), client);
                true
            }
        }
    }

    /// Forget `client`, unless it has already been replaced
    pub fn remove(&self, client: &RpcClient) {
        let mut sessions = self.sessions();
        if sessions
            .get(client.service())
            .is_some_and(|existing| existing.same_session(client))
        {
            sessions.remove(client.service());
        }
    }

    /// Session for `service`
    pub fn get(&self, service: &str) -> Result<RpcClient> {
        self.sessions()
            .get(service)
            .filter(|client| !client.is_closed())
            .cloned()
            .ok_or_else(|| MinionError::Connection("No client connection".to_string()))
    }

    /// Number of recorded sessions
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Whether no sessions are recorded
    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Close every recorded session
    pub fn close_all(&self) {
        for client in self.sessions().drain().map(|(_, client)| client) {
            client.close();
        }
    }
}
