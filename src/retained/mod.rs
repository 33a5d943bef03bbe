// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-topic last-message persistence with new-subscriber replay.

mod local;
#[cfg(feature = "cluster")]
mod shared;

pub use local::LocalRetainedStore;
#[cfg(feature = "cluster")]
pub use shared::SharedRetainedStore;

use async_trait::async_trait;
use codec::QoS;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::subscription::SubscriptionTrie;

/// The last publication to a topic with its retain flag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedMessage {
    pub payload: Vec<u8>,
    #[serde(with = "qos_u8")]
    pub qos: QoS,
    pub timestamp: u64,
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

/// Contract shared by the local and cluster-backed retained stores. An
/// empty `payload` passed to `store` means "delete"; `get`/`get_matching`
/// never return empty-payload entries.
#[async_trait]
pub trait RetainedStore: Send + Sync {
    /// Upserts `topic`, or deletes it if `payload` is empty.
    async fn store(&self, topic: &str, payload: Vec<u8>, qos: QoS, now_ms: u64) -> Result<(), Error>;

    /// Returns at most one message.
    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>, Error>;

    async fn remove(&self, topic: &str) -> Result<(), Error>;

    /// Returns every stored message whose topic matches `filter` under
    /// MQTT 3.1.1 wildcard rules.
    async fn get_matching(&self, filter: &str) -> Result<Vec<(String, RetainedMessage)>, Error>;

    /// Invoked for every payload received on the retained-store sync
    /// channel. `LocalRetainedStore` has no peer cache to invalidate, so
    /// the default is a no-op; `SharedRetainedStore` overrides it.
    fn handle_remote_sync_event(&self, _payload: &[u8]) {}
}

/// Matches a concrete (wildcard-free) topic against a subscription filter
/// by reusing the trie's single-shot matcher: a throwaway trie with one
/// subscriber at `filter` turns `filter.matches(topic)` into a trie walk,
/// keeping exactly one wildcard-matching algorithm in the crate.
pub(crate) fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut trie = SubscriptionTrie::new();
    if trie.add("probe".to_string(), filter, QoS::AtMostOnce).is_err() {
        return false;
    }
    trie.match_topic(topic).contains_key("probe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_delegates_to_trie_rules() {
        assert!(filter_matches("lamp/#", "lamp/1"));
        assert!(!filter_matches("lamp/#", "kitchen/1"));
    }
}
