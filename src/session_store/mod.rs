// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Resolves "where is client X connected?" and enforces single ownership
//! of a `ClientId` across the cluster.

mod local;
#[cfg(feature = "cluster")]
mod shared;

pub use local::LocalSessionStore;
#[cfg(feature = "cluster")]
pub use shared::SharedSessionStore;

use async_trait::async_trait;
use codec::QoS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Error;
use crate::types::{ClientId, NodeId};

/// Persisted shape of a client's session, restored verbatim on a
/// `CONNECT` with `cleanSession = false` arriving within the expiry
/// window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub client_id: ClientId,
    pub node_id: NodeId,
    pub clean_session: bool,
    #[serde(deserialize_with = "crate::types::epoch_millis::deserialize")]
    pub connected_at: u64,
    #[serde(deserialize_with = "crate::types::epoch_millis::deserialize")]
    pub last_activity_at: u64,
    /// `topicFilter -> grantedQoS`, re-seeded into the subscription index
    /// on restore.
    #[serde(default, with = "qos_map")]
    pub subscriptions: HashMap<String, QoS>,
}

mod qos_map {
    use codec::QoS;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::convert::TryFrom;

    pub fn serialize<S: Serializer>(map: &HashMap<String, QoS>, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (filter, qos) in map {
            out.serialize_entry(filter, &(*qos as u8))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HashMap<String, QoS>, D::Error> {
        let raw: HashMap<String, u8> = HashMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(filter, value)| {
                QoS::try_from(value)
                    .map(|qos| (filter, qos))
                    .map_err(|_| serde::de::Error::custom("invalid qos in stored subscriptions"))
            })
            .collect()
    }
}

impl StoredSession {
    #[must_use]
    pub fn new(client_id: ClientId, node_id: NodeId, clean_session: bool, now_ms: u64) -> Self {
        Self {
            client_id,
            node_id,
            clean_session,
            connected_at: now_ms,
            last_activity_at: now_ms,
            subscriptions: HashMap::new(),
        }
    }
}

/// Contract shared by the local and cluster-backed session stores.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// If `clean_session` is true, discards any stored state and returns a
    /// fresh session; otherwise restores the prior one if present.
    async fn create_session(
        &self,
        client_id: &str,
        node_id: &str,
        clean_session: bool,
        now_ms: u64,
    ) -> Result<StoredSession, Error>;

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>, Error>;

    async fn update_session(&self, session: &StoredSession) -> Result<(), Error>;

    /// `permanent = true` drops the stored session record entirely (clean
    /// disconnect); `false` leaves it for restore within its expiry.
    async fn remove_session(&self, client_id: &str, permanent: bool) -> Result<(), Error>;

    async fn is_client_connected(&self, client_id: &str) -> Result<bool, Error>;

    async fn get_client_node(&self, client_id: &str) -> Result<Option<NodeId>, Error>;

    /// Records that `client_id` is now owned by `node_id`, with a
    /// keep-alive-scaled TTL refreshed by the owning node.
    async fn set_client_node(&self, client_id: &str, node_id: &str, ttl_secs: u64) -> Result<(), Error>;

    async fn get_session_count(&self) -> Result<usize, Error>;
}
