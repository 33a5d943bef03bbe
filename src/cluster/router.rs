// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Routes broker-to-broker traffic over the shared store's publish/
//! subscribe channels, generalized from the dispatcher's actor-channel
//! fan-out (`listener_senders: HashMap<ListenerId, Sender<_>>`) to a
//! `tokio::sync::broadcast` in-process bus that both local deliveries and
//! cluster-inbound events feed into uniformly.

use codec::QoS;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Error;
use crate::types::{ClientId, NodeId};

#[cfg(feature = "cluster")]
use redis::aio::ConnectionManager;
#[cfg(feature = "cluster")]
use redis::AsyncCommands;

const BROADCAST_CHANNEL: &str = "dynamq:cluster:publish";
const KICK_CHANNEL: &str = "dynamq:cluster:kick";
fn node_channel(node_id: &str) -> String {
    format!("dynamq:node:{node_id}")
}

const LOCAL_BUS_CAPACITY: usize = 1024;

/// Wire shape of a broadcast publication, serialized onto
/// [`BROADCAST_CHANNEL`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub topic: String,
    pub payload: Vec<u8>,
    #[serde(with = "qos_u8")]
    pub qos: QoS,
    pub retain: bool,
    pub exclude_client_id: Option<ClientId>,
    pub source_node: NodeId,
}

/// Wire shape of a targeted unicast delivery, serialized onto a
/// per-node channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnicastEnvelope {
    pub client_id: ClientId,
    pub topic: String,
    pub payload: Vec<u8>,
    #[serde(with = "qos_u8")]
    pub qos: QoS,
    pub retain: bool,
    pub source_node: NodeId,
}

/// Wire shape of an eviction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickEnvelope {
    pub client_id: ClientId,
    pub target_node: NodeId,
    pub source_node: NodeId,
}

mod qos_u8 {
    use codec::QoS;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::convert::TryFrom;

    pub fn serialize<S: Serializer>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*qos as u8)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<QoS, D::Error> {
        let value = u8::deserialize(deserializer)?;
        QoS::try_from(value).map_err(|_| serde::de::Error::custom("invalid qos"))
    }
}

/// Event fed onto the in-process bus, whether it originated from a local
/// publish or arrived over a cluster channel. Every component that cares
/// about "a message should now reach locally-owned client X" subscribes
/// to this bus instead of distinguishing local vs. remote origin.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// Re-run local fan-out for `topic`, skipping `exclude_client_id` (the
    /// original publisher) and skipping events this node itself produced.
    Broadcast(BroadcastEnvelope),

    /// Deliver directly to `client_id`, if it's owned by this node.
    Unicast(UnicastEnvelope),

    /// Close `client_id`'s connection if it is owned by this node.
    Kick(KickEnvelope),
}

/// Routes publications and eviction requests across the cluster. When
/// cluster mode is disabled, broadcasts are no-ops and targeted delivery
/// never leaves the local process (the "local-only fallback").
pub struct ClusterRouter {
    node_id: NodeId,
    enabled: bool,
    #[cfg(feature = "cluster")]
    conn: Option<ConnectionManager>,
    bus: broadcast::Sender<ClusterEvent>,
}

impl ClusterRouter {
    #[must_use]
    #[cfg(feature = "cluster")]
    pub fn new(node_id: NodeId, enabled: bool, conn: Option<ConnectionManager>) -> Self {
        let (bus, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { node_id, enabled, conn, bus }
    }

    /// Without the `cluster` feature there is no shared-store client to
    /// route through, so `enabled` is always forced to `false` regardless
    /// of configuration (the local-only fallback).
    #[must_use]
    #[cfg(not(feature = "cluster"))]
    pub fn new(node_id: NodeId, _enabled: bool) -> Self {
        let (bus, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { node_id, enabled: false, bus }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Subscribes to the in-process bus. Every local component that acts
    /// on delivered/evicted clients holds one of these.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.bus.subscribe()
    }

    /// Publishes `envelope` to every node's local subscribers, including
    /// this one's (callers are expected to skip `source_node == self` and
    /// `exclude_client_id` at the point of local fan-out, exactly as the
    /// remote nodes do).
    ///
    /// # Errors
    ///
    /// Returns error if the shared store rejects the publish.
    pub async fn broadcast(&self, envelope: BroadcastEnvelope) -> Result<(), Error> {
        self.feed_local(ClusterEvent::Broadcast(envelope.clone()));
        #[cfg(feature = "cluster")]
        if self.enabled {
            if let Some(conn) = &self.conn {
                let mut conn = conn.clone();
                let encoded = serde_json::to_vec(&envelope)
                    .map_err(|err| Error::from_string(crate::error::ErrorKind::SharedStoreError, format!("{err}")))?;
                let _: () = conn.publish(BROADCAST_CHANNEL, encoded).await?;
            }
        }
        Ok(())
    }

    /// Delivers to a single client, wherever it lives. If `target_node`
    /// is this node, the "same-process shortcut" applies: the shared
    /// store is never touched.
    ///
    /// # Errors
    ///
    /// Returns error if the shared store rejects the publish.
    pub async fn unicast(&self, target_node: &str, envelope: UnicastEnvelope) -> Result<(), Error> {
        if target_node == self.node_id || !self.enabled {
            self.feed_local(ClusterEvent::Unicast(envelope));
            return Ok(());
        }
        #[cfg(feature = "cluster")]
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            let encoded = serde_json::to_vec(&envelope)
                .map_err(|err| Error::from_string(crate::error::ErrorKind::SharedStoreError, format!("{err}")))?;
            let _: () = conn.publish(node_channel(target_node), encoded).await?;
        }
        #[cfg(not(feature = "cluster"))]
        let _ = envelope;
        Ok(())
    }

    /// Requests eviction of `client_id` from `target_node`.
    ///
    /// # Errors
    ///
    /// Returns error if the shared store rejects the publish.
    pub async fn evict(&self, target_node: &str, client_id: ClientId) -> Result<(), Error> {
        let envelope = KickEnvelope {
            client_id,
            target_node: target_node.to_string(),
            source_node: self.node_id.clone(),
        };
        if target_node == self.node_id || !self.enabled {
            self.feed_local(ClusterEvent::Kick(envelope));
            return Ok(());
        }
        #[cfg(feature = "cluster")]
        if let Some(conn) = &self.conn {
            let mut conn = conn.clone();
            let encoded = serde_json::to_vec(&envelope)
                .map_err(|err| Error::from_string(crate::error::ErrorKind::SharedStoreError, format!("{err}")))?;
            let _: () = conn.publish(KICK_CHANNEL, encoded).await?;
        }
        #[cfg(not(feature = "cluster"))]
        let _ = envelope;
        Ok(())
    }

    fn feed_local(&self, event: ClusterEvent) {
        // No local subscribers yet (e.g. during startup) is not an error.
        let _ = self.bus.send(event);
    }

    /// Feeds an event received from a remote cluster channel onto the
    /// local bus, after filtering out loopback of this node's own
    /// broadcasts. Called by `cluster::subscriber::run_loop`.
    pub fn handle_remote_broadcast(&self, envelope: BroadcastEnvelope) {
        if envelope.source_node == self.node_id {
            return;
        }
        self.feed_local(ClusterEvent::Broadcast(envelope));
    }

    pub fn handle_remote_unicast(&self, envelope: UnicastEnvelope) {
        self.feed_local(ClusterEvent::Unicast(envelope));
    }

    pub fn handle_remote_kick(&self, envelope: KickEnvelope) {
        if envelope.target_node != self.node_id {
            return;
        }
        self.feed_local(ClusterEvent::Kick(envelope));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "cluster"))]
    #[tokio::test]
    async fn test_local_only_fallback_delivers_without_shared_store() {
        let router = ClusterRouter::new("node-1".to_string(), true);
        let mut rx = router.subscribe();
        router
            .unicast(
                "node-1",
                UnicastEnvelope {
                    client_id: "c1".to_string(),
                    topic: "a/b".to_string(),
                    payload: b"hi".to_vec(),
                    qos: QoS::AtMostOnce,
                    retain: false,
                    source_node: "node-1".to_string(),
                },
            )
            .await
            .unwrap();
        let event = rx.try_recv().unwrap();
        matches!(event, ClusterEvent::Unicast(_));
    }

    #[cfg(not(feature = "cluster"))]
    #[tokio::test]
    async fn test_loopback_broadcast_is_filtered_by_remote_handler() {
        let router = ClusterRouter::new("node-1".to_string(), true);
        let mut rx = router.subscribe();
        router.handle_remote_broadcast(BroadcastEnvelope {
            topic: "a".to_string(),
            payload: vec![],
            qos: QoS::AtMostOnce,
            retain: false,
            exclude_client_id: None,
            source_node: "node-1".to_string(),
        });
        assert!(rx.try_recv().is_err());
    }
}
