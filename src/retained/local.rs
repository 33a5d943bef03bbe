// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use codec::QoS;

use crate::error::Error;

use super::{filter_matches, RetainedMessage, RetainedStore};

/// In-memory retained store, used standalone or as the read-through cache
/// behind [`super::SharedRetainedStore`].
#[derive(Debug, Default)]
pub struct LocalRetainedStore {
    messages: RwLock<HashMap<String, RetainedMessage>>,
}

impl LocalRetainedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the cached entry for `topic`, without consulting any backing
    /// store. Used by the shared variant to react to invalidation events.
    pub fn invalidate(&self, topic: &str) {
        self.messages.write().expect("retained cache lock poisoned").remove(topic);
    }

    pub fn populate(&self, topic: String, message: RetainedMessage) {
        self.messages.write().expect("retained cache lock poisoned").insert(topic, message);
    }
}

#[async_trait]
impl RetainedStore for LocalRetainedStore {
    async fn store(&self, topic: &str, payload: Vec<u8>, qos: QoS, now_ms: u64) -> Result<(), Error> {
        let mut messages = self.messages.write().expect("retained cache lock poisoned");
        if payload.is_empty() {
            messages.remove(topic);
        } else {
            messages.insert(
                topic.to_string(),
                RetainedMessage {
                    payload,
                    qos,
                    timestamp: now_ms,
                },
            );
        }
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>, Error> {
        Ok(self.messages.read().expect("retained cache lock poisoned").get(topic).cloned())
    }

    async fn remove(&self, topic: &str) -> Result<(), Error> {
        self.messages.write().expect("retained cache lock poisoned").remove(topic);
        Ok(())
    }

    async fn get_matching(&self, filter: &str) -> Result<Vec<(String, RetainedMessage)>, Error> {
        let messages = self.messages.read().expect("retained cache lock poisoned");
        Ok(messages
            .iter()
            .filter(|(topic, _)| filter_matches(filter, topic))
            .map(|(topic, message)| (topic.clone(), message.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_then_get_round_trips() {
        let store = LocalRetainedStore::new();
        store.store("lamp/1", b"on".to_vec(), QoS::AtMostOnce, 1000).await.unwrap();
        let got = store.get("lamp/1").await.unwrap().unwrap();
        assert_eq!(got.payload, b"on");
    }

    #[tokio::test]
    async fn test_empty_payload_deletes() {
        let store = LocalRetainedStore::new();
        store.store("lamp/1", b"on".to_vec(), QoS::AtMostOnce, 1000).await.unwrap();
        store.store("lamp/1", Vec::new(), QoS::AtMostOnce, 2000).await.unwrap();
        assert!(store.get("lamp/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_matching_applies_wildcard_filter() {
        let store = LocalRetainedStore::new();
        store.store("lamp/1", b"on".to_vec(), QoS::AtMostOnce, 1000).await.unwrap();
        store.store("kitchen/1", b"off".to_vec(), QoS::AtMostOnce, 1000).await.unwrap();
        let matches = store.get_matching("lamp/#").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, "lamp/1");
    }
}
