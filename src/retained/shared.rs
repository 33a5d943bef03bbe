// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;

use async_trait::async_trait;
use codec::QoS;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::NodeId;

use super::local::LocalRetainedStore;
use super::{filter_matches, RetainedMessage, RetainedStore};

const KEY_PREFIX: &str = "dynamq:retain:";
const SYNC_CHANNEL: &str = "dynamq:retain:sync";

#[derive(Debug, Serialize, Deserialize)]
struct SyncEvent {
    action: SyncAction,
    topic: String,
    source_node: NodeId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum SyncAction {
    Store,
    Remove,
}

fn key_for(topic: &str) -> String {
    format!("{KEY_PREFIX}{topic}")
}

/// Redis-backed retained store with a per-process read-through cache.
/// Every store/remove is both written to the shared key and broadcast on
/// `dynamq:retain:sync` so peer nodes invalidate their own cache entry.
/// The node that performed the write does not invalidate its own entry —
/// it already holds the fresh value.
pub struct SharedRetainedStore {
    conn: ConnectionManager,
    cache: LocalRetainedStore,
    node_id: NodeId,
}

impl SharedRetainedStore {
    #[must_use]
    pub fn new(conn: ConnectionManager, node_id: NodeId) -> Self {
        Self {
            conn,
            cache: LocalRetainedStore::new(),
            node_id,
        }
    }

    async fn publish_sync(&self, action: SyncAction, topic: &str) -> Result<(), Error> {
        let event = SyncEvent {
            action,
            topic: topic.to_string(),
            source_node: self.node_id.clone(),
        };
        let payload = serde_json::to_vec(&event)
            .map_err(|err| Error::from_string(crate::error::ErrorKind::SharedStoreError, format!("{err}")))?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(SYNC_CHANNEL, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl RetainedStore for SharedRetainedStore {
    async fn store(&self, topic: &str, payload: Vec<u8>, qos: QoS, now_ms: u64) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        if payload.is_empty() {
            let _: () = conn.del(key_for(topic)).await?;
            self.cache.invalidate(topic);
            self.publish_sync(SyncAction::Remove, topic).await?;
        } else {
            let message = RetainedMessage { payload, qos, timestamp: now_ms };
            let encoded = serde_json::to_vec(&message)
                .map_err(|err| Error::from_string(crate::error::ErrorKind::SharedStoreError, format!("{err}")))?;
            let _: () = conn.set(key_for(topic), encoded).await?;
            self.cache.populate(topic.to_string(), message);
            self.publish_sync(SyncAction::Store, topic).await?;
        }
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>, Error> {
        if let Some(cached) = self.cache.get(topic).await? {
            return Ok(Some(cached));
        }
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(key_for(topic)).await?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let message: RetainedMessage = serde_json::from_slice(&bytes)
                    .map_err(|err| Error::from_string(crate::error::ErrorKind::SharedStoreError, format!("{err}")))?;
                self.cache.populate(topic.to_string(), message.clone());
                Ok(Some(message))
            }
        }
    }

    async fn remove(&self, topic: &str) -> Result<(), Error> {
        self.store(topic, Vec::new(), QoS::AtMostOnce, 0).await
    }

    async fn get_matching(&self, filter: &str) -> Result<Vec<(String, RetainedMessage)>, Error> {
        let mut conn = self.conn.clone();
        let pattern = format!("{KEY_PREFIX}*");
        let keys: Vec<String> = conn.keys(pattern).await?;
        let mut out = Vec::new();
        for key in keys {
            let Some(topic) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            if !filter_matches(filter, topic) {
                continue;
            }
            if let Some(message) = self.get(topic).await? {
                out.push((topic.to_string(), message));
            }
        }
        Ok(out)
    }

    /// Invoked by `cluster::subscriber::run_loop` for every payload
    /// received on [`SYNC_CHANNEL`]. Drops the local cache entry unless
    /// the event originated from this same node.
    fn handle_remote_sync_event(&self, payload: &[u8]) {
        let Ok(event) = serde_json::from_slice::<SyncEvent>(payload) else {
            log::warn!("retained: malformed sync event on {SYNC_CHANNEL}");
            return;
        };
        if event.source_node == self.node_id {
            return;
        }
        self.cache.invalidate(&event.topic);
    }
}

/// Shared handle, cloned into the sync-channel listener task and into the
/// broker context.
pub type SharedRetainedStoreHandle = Arc<SharedRetainedStore>;
