// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{Error, ErrorKind};
use crate::types::NodeId;

use super::local::LocalSessionStore;
use super::{SessionStore, StoredSession};

fn session_key(client_id: &str) -> String {
    format!("dynamq:session:{client_id}")
}

fn connection_key(client_id: &str) -> String {
    format!("dynamq:connection:{client_id}")
}

/// Two records per client in the shared store: the session record
/// (`dynamq:session:{clientId}`, TTL-bounded by session-expiry for
/// persistent sessions, absent for clean ones) and the connection record
/// (`dynamq:connection:{clientId}`, short TTL refreshed by the owning
/// node). A local read-through cache accelerates `get_session`.
pub struct SharedSessionStore {
    conn: ConnectionManager,
    cache: LocalSessionStore,
    session_expiry_secs: u64,
}

impl SharedSessionStore {
    #[must_use]
    pub fn new(conn: ConnectionManager, session_expiry_secs: u64) -> Self {
        Self {
            conn,
            cache: LocalSessionStore::new(),
            session_expiry_secs,
        }
    }

    fn encode(session: &StoredSession) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(session).map_err(|err| Error::from_string(ErrorKind::SharedStoreError, format!("{err}")))
    }

    fn decode(bytes: &[u8]) -> Result<StoredSession, Error> {
        serde_json::from_slice(bytes).map_err(|err| Error::from_string(ErrorKind::SharedStoreError, format!("{err}")))
    }
}

#[async_trait]
impl SessionStore for SharedSessionStore {
    async fn create_session(
        &self,
        client_id: &str,
        node_id: &str,
        clean_session: bool,
        now_ms: u64,
    ) -> Result<StoredSession, Error> {
        if clean_session {
            self.remove_session(client_id, true).await?;
            return Ok(StoredSession::new(client_id.to_string(), node_id.to_string(), true, now_ms));
        }
        if let Some(existing) = self.get_session(client_id).await? {
            return Ok(existing);
        }
        Ok(StoredSession::new(client_id.to_string(), node_id.to_string(), false, now_ms))
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>, Error> {
        if let Some(cached) = self.cache.get_session(client_id).await? {
            return Ok(Some(cached));
        }
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(session_key(client_id)).await?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let session = Self::decode(&bytes)?;
                self.cache.update_session(&session).await?;
                Ok(Some(session))
            }
        }
    }

    async fn update_session(&self, session: &StoredSession) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let encoded = Self::encode(session)?;
        if session.clean_session {
            let _: () = conn.set(session_key(&session.client_id), encoded).await?;
        } else {
            let _: () = conn
                .set_ex(session_key(&session.client_id), encoded, self.session_expiry_secs)
                .await?;
        }
        self.cache.update_session(session).await
    }

    async fn remove_session(&self, client_id: &str, permanent: bool) -> Result<(), Error> {
        if permanent {
            let mut conn = self.conn.clone();
            let _: () = conn.del(session_key(client_id)).await?;
        }
        self.cache.remove_session(client_id, permanent).await?;
        let mut conn = self.conn.clone();
        let _: () = conn.del(connection_key(client_id)).await?;
        Ok(())
    }

    async fn is_client_connected(&self, client_id: &str) -> Result<bool, Error> {
        Ok(self.get_client_node(client_id).await?.is_some())
    }

    async fn get_client_node(&self, client_id: &str) -> Result<Option<NodeId>, Error> {
        let mut conn = self.conn.clone();
        let node_id: Option<String> = conn.get(connection_key(client_id)).await?;
        Ok(node_id)
    }

    async fn set_client_node(&self, client_id: &str, node_id: &str, ttl_secs: u64) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(connection_key(client_id), node_id, ttl_secs).await?;
        Ok(())
    }

    async fn get_session_count(&self) -> Result<usize, Error> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("dynamq:session:*").await?;
        Ok(keys.len())
    }
}
