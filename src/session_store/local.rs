// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Error;
use crate::types::NodeId;

use super::{SessionStore, StoredSession};

/// In-memory session store: a single-process map of `ClientId ->
/// StoredSession` plus an owner map, generalized from the dispatcher's
/// local-only cached-sessions idiom to the full session-store contract.
#[derive(Debug, Default)]
pub struct LocalSessionStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
    owners: RwLock<HashMap<String, NodeId>>,
}

impl LocalSessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn create_session(
        &self,
        client_id: &str,
        node_id: &str,
        clean_session: bool,
        now_ms: u64,
    ) -> Result<StoredSession, Error> {
        if clean_session {
            self.sessions.write().expect("session store lock poisoned").remove(client_id);
            return Ok(StoredSession::new(client_id.to_string(), node_id.to_string(), true, now_ms));
        }
        if let Some(existing) = self.sessions.read().expect("session store lock poisoned").get(client_id) {
            return Ok(existing.clone());
        }
        Ok(StoredSession::new(client_id.to_string(), node_id.to_string(), false, now_ms))
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>, Error> {
        Ok(self.sessions.read().expect("session store lock poisoned").get(client_id).cloned())
    }

    async fn update_session(&self, session: &StoredSession) -> Result<(), Error> {
        self.sessions
            .write()
            .expect("session store lock poisoned")
            .insert(session.client_id.clone(), session.clone());
        Ok(())
    }

    async fn remove_session(&self, client_id: &str, permanent: bool) -> Result<(), Error> {
        if permanent {
            self.sessions.write().expect("session store lock poisoned").remove(client_id);
        }
        self.owners.write().expect("owner map lock poisoned").remove(client_id);
        Ok(())
    }

    async fn is_client_connected(&self, client_id: &str) -> Result<bool, Error> {
        Ok(self.owners.read().expect("owner map lock poisoned").contains_key(client_id))
    }

    async fn get_client_node(&self, client_id: &str) -> Result<Option<NodeId>, Error> {
        Ok(self.owners.read().expect("owner map lock poisoned").get(client_id).cloned())
    }

    async fn set_client_node(&self, client_id: &str, node_id: &str, _ttl_secs: u64) -> Result<(), Error> {
        self.owners
            .write()
            .expect("owner map lock poisoned")
            .insert(client_id.to_string(), node_id.to_string());
        Ok(())
    }

    async fn get_session_count(&self) -> Result<usize, Error> {
        Ok(self.sessions.read().expect("session store lock poisoned").len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clean_session_discards_prior_state() {
        let store = LocalSessionStore::new();
        let mut session = store.create_session("c1", "node-1", false, 1000).await.unwrap();
        session.subscriptions.insert("a/b".to_string(), codec::QoS::AtMostOnce);
        store.update_session(&session).await.unwrap();

        let fresh = store.create_session("c1", "node-1", true, 2000).await.unwrap();
        assert!(fresh.subscriptions.is_empty());
        assert!(store.get_session("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_clean_session_restores_prior_state() {
        let store = LocalSessionStore::new();
        let mut session = store.create_session("c1", "node-1", false, 1000).await.unwrap();
        session.subscriptions.insert("a/b".to_string(), codec::QoS::AtLeastOnce);
        store.update_session(&session).await.unwrap();

        let restored = store.create_session("c1", "node-1", false, 2000).await.unwrap();
        assert_eq!(restored.subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn test_owner_tracking() {
        let store = LocalSessionStore::new();
        assert!(!store.is_client_connected("c1").await.unwrap());
        store.set_client_node("c1", "node-1", 60).await.unwrap();
        assert!(store.is_client_connected("c1").await.unwrap());
        assert_eq!(store.get_client_node("c1").await.unwrap().as_deref(), Some("node-1"));
    }
}
