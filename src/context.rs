// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-process Broker Context: the one place that owns every shared
//! subsystem, threaded into every component instead of relying on
//! static/global state (see the design notes on global mutable process
//! state).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use codec::v3::PublishPacket;
use codec::QoS;
use tokio::sync::{mpsc, RwLock};

use crate::cluster::health::HealthTicker;
use crate::cluster::router::{BroadcastEnvelope, ClusterEvent, ClusterRouter, UnicastEnvelope};
use crate::commands::ListenerToSessionCmd;
use crate::config::Config;
use crate::permission::{AllowAll, PermissionProvider};
use crate::retained::{LocalRetainedStore, RetainedStore};
use crate::session_store::{LocalSessionStore, SessionStore};
use crate::sink::{NullSink, Sink};
use crate::subscription::SubscriptionTrie;
use crate::types::{ClientId, NodeId};

#[cfg(feature = "cluster")]
use crate::retained::SharedRetainedStore;
#[cfg(feature = "cluster")]
use crate::session_store::SharedSessionStore;

/// Returns the current time as epoch milliseconds. The one place in the
/// crate allowed to call `SystemTime::now()` directly; everything else
/// takes `now_ms` as a parameter so it stays testable.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// One instance per running broker process. Every `Session`, `Listener`
/// and background ticker holds an `Arc<BrokerContext>` rather than
/// reaching through statics.
pub struct BrokerContext {
    pub node_id: NodeId,
    pub config: Config,
    pub subscription_trie: RwLock<SubscriptionTrie>,
    pub retained_store: Arc<dyn RetainedStore>,
    pub session_store: Arc<dyn SessionStore>,
    pub permission: Arc<dyn PermissionProvider>,
    pub sink: Arc<dyn Sink>,
    pub cluster_router: Arc<ClusterRouter>,
    pub health_ticker: Arc<HealthTicker>,
    /// `ClientId -> inbound command sender`, for every session currently
    /// connected on this node. Consulted by the cluster-event loop to
    /// turn a `Broadcast`/`Unicast`/`Kick` into a delivery to the right
    /// local `Session` actor.
    registry: RwLock<HashMap<ClientId, mpsc::Sender<ListenerToSessionCmd>>>,
}

impl BrokerContext {
    /// Builds the context for a standalone (non-cluster) node.
    #[must_use]
    pub fn new_standalone(config: Config) -> Self {
        let node_id = config.general().node_id().to_string();
        #[cfg(feature = "cluster")]
        let cluster_router = Arc::new(ClusterRouter::new(node_id.clone(), false, None));
        #[cfg(not(feature = "cluster"))]
        let cluster_router = Arc::new(ClusterRouter::new(node_id.clone(), false));
        #[cfg(feature = "cluster")]
        let health_ticker = Arc::new(HealthTicker::new(node_id.clone(), config.cluster().heartbeat_interval(), None));
        #[cfg(not(feature = "cluster"))]
        let health_ticker = Arc::new(HealthTicker::new(node_id.clone(), config.cluster().heartbeat_interval()));

        Self {
            node_id,
            config,
            subscription_trie: RwLock::new(SubscriptionTrie::new()),
            retained_store: Arc::new(LocalRetainedStore::new()),
            session_store: Arc::new(LocalSessionStore::new()),
            permission: Arc::new(AllowAll),
            sink: Arc::new(NullSink),
            cluster_router,
            health_ticker,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Builds the context for a clustered node, wiring the shared stores
    /// and the cluster router through the same Redis `ConnectionManager`.
    #[cfg(feature = "cluster")]
    #[must_use]
    pub fn new_clustered(config: Config, conn: redis::aio::ConnectionManager) -> Self {
        let node_id = config.general().node_id().to_string();
        let cluster_router = Arc::new(ClusterRouter::new(node_id.clone(), config.cluster().enabled(), Some(conn.clone())));
        let health_ticker = Arc::new(HealthTicker::new(
            node_id.clone(),
            config.cluster().heartbeat_interval(),
            Some(conn.clone()),
        ));
        let session_expiry = u64::from(config.general().session_expiry_interval());

        Self {
            node_id,
            config,
            subscription_trie: RwLock::new(SubscriptionTrie::new()),
            retained_store: Arc::new(SharedRetainedStore::new(conn.clone(), node_id_string(&cluster_router))),
            session_store: Arc::new(SharedSessionStore::new(conn, session_expiry)),
            permission: Arc::new(AllowAll),
            sink: Arc::new(NullSink),
            cluster_router,
            health_ticker,
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, client_id: ClientId, sender: mpsc::Sender<ListenerToSessionCmd>) {
        self.registry.write().await.insert(client_id, sender);
    }

    pub async fn unregister(&self, client_id: &str) {
        self.registry.write().await.remove(client_id);
    }

    /// Disconnects a locally-owned session, used when a new `CONNECT` for
    /// the same client id supersedes it.
    pub async fn kick(&self, client_id: &str) {
        self.deliver_local(client_id, ListenerToSessionCmd::Kick).await;
    }

    async fn deliver_local(&self, client_id: &str, cmd: ListenerToSessionCmd) {
        let sender = self.registry.read().await.get(client_id).cloned();
        if let Some(sender) = sender {
            if let Err(err) = sender.send(cmd).await {
                log::error!("context: failed to deliver to session {client_id}: {err:?}");
            }
        }
    }

    /// Matches `topic` against the subscription index and delivers to
    /// every locally-owned subscriber, applying QoS down-grading. Used
    /// both for locally-published messages and for `Broadcast` events
    /// arriving from peer nodes.
    pub async fn fan_out_local(&self, publish: &PublishPacket, exclude_client_id: Option<&str>) {
        let subscribers = self.subscription_trie.read().await.match_topic(publish.topic());
        for (client_id, granted_qos) in subscribers {
            if Some(client_id.as_str()) == exclude_client_id {
                continue;
            }
            let effective_qos = std::cmp::min(publish.qos(), granted_qos);
            let mut delivered = match PublishPacket::new(publish.topic(), effective_qos, publish.message()) {
                Ok(packet) => packet,
                Err(err) => {
                    log::error!("context: failed to build delivery packet: {err:?}");
                    continue;
                }
            };
            // The server must set retain to false when delivering to an
            // already-connected subscriber; only replay deliveries set it.
            delivered.set_retain(false);
            self.deliver_local(&client_id, ListenerToSessionCmd::Publish(delivered)).await;
        }
    }

    /// Entry point for an accepted inbound `PUBLISH`: updates the
    /// retained store if needed, fans out locally, broadcasts to peers,
    /// and forwards to the external sink.
    pub async fn handle_publish(&self, client_id: &str, publish: &PublishPacket) {
        if publish.retain() {
            if let Err(err) = self
                .retained_store
                .store(publish.topic(), publish.message().to_vec(), publish.qos(), now_ms())
                .await
            {
                log::error!("context: failed to update retained store for {}: {err:?}", publish.topic());
            }
        }

        self.fan_out_local(publish, Some(client_id)).await;

        let envelope = BroadcastEnvelope {
            topic: publish.topic().to_string(),
            payload: publish.message().to_vec(),
            qos: publish.qos(),
            retain: publish.retain(),
            exclude_client_id: Some(client_id.to_string()),
            source_node: self.node_id.clone(),
        };
        if let Err(err) = self.cluster_router.broadcast(envelope).await {
            log::error!("context: failed to broadcast publish: {err:?}");
        }

        if let Err(err) = self.sink.publish(client_id, publish.topic(), publish.message()).await {
            log::error!("context: sink publish failed: {err:?}");
        }
    }

    /// Replays every retained message matching `filter` to `client_id`,
    /// as required after a successful `SUBSCRIBE`.
    pub async fn replay_retained(&self, client_id: &str, filter: &str, granted_qos: QoS) {
        let matches = match self.retained_store.get_matching(filter).await {
            Ok(matches) => matches,
            Err(err) => {
                log::error!("context: failed to read retained store for {filter}: {err:?}");
                return;
            }
        };
        for (topic, message) in matches {
            let effective_qos = std::cmp::min(message.qos, granted_qos);
            let mut packet = match PublishPacket::new(&topic, effective_qos, &message.payload) {
                Ok(packet) => packet,
                Err(err) => {
                    log::error!("context: failed to build retained delivery for {topic}: {err:?}");
                    continue;
                }
            };
            packet.set_retain(true);
            self.deliver_local(client_id, ListenerToSessionCmd::Publish(packet)).await;
        }
    }

    /// Drives the in-process cluster bus: `Broadcast` events repeat local
    /// fan-out (skipping messages this node itself produced); `Unicast`
    /// and `Kick` events are delivered straight to the targeted session.
    /// Runs for the lifetime of the process.
    pub async fn run_cluster_event_loop(self: Arc<Self>) {
        let mut events = self.cluster_router.subscribe();
        loop {
            match events.recv().await {
                Ok(ClusterEvent::Broadcast(envelope)) => self.handle_broadcast_event(envelope).await,
                Ok(ClusterEvent::Unicast(envelope)) => self.handle_unicast_event(envelope).await,
                Ok(ClusterEvent::Kick(envelope)) => {
                    self.deliver_local(&envelope.client_id, ListenerToSessionCmd::Kick).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("context: cluster event loop lagged, skipped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_broadcast_event(&self, envelope: BroadcastEnvelope) {
        if envelope.source_node == self.node_id {
            return;
        }
        let Ok(publish) = build_publish(&envelope.topic, envelope.qos, &envelope.payload, envelope.retain) else {
            return;
        };
        self.fan_out_local(&publish, envelope.exclude_client_id.as_deref()).await;
    }

    async fn handle_unicast_event(&self, envelope: UnicastEnvelope) {
        let Ok(packet) = build_publish(&envelope.topic, envelope.qos, &envelope.payload, envelope.retain) else {
            return;
        };
        self.deliver_local(&envelope.client_id, ListenerToSessionCmd::Publish(packet)).await;
    }
}

fn build_publish(topic: &str, qos: QoS, payload: &[u8], retain: bool) -> Result<PublishPacket, codec::EncodeError> {
    let mut packet = PublishPacket::new(topic, qos, payload)?;
    packet.set_retain(retain);
    Ok(packet)
}

#[cfg(feature = "cluster")]
fn node_id_string(router: &ClusterRouter) -> NodeId {
    router.node_id().to_string()
}
