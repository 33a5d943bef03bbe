// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End-to-end coverage of the subscription index and retained store
//! working together the way a real `SUBSCRIBE` does: a new subscriber
//! should immediately receive every previously retained message matching
//! its filter, at the QoS granted by the subscription.

use codec::QoS;
use dynamq::retained::{LocalRetainedStore, RetainedStore};
use dynamq::subscription::SubscriptionTrie;

#[tokio::test]
async fn test_retained_replay_respects_wildcard_and_granted_qos() {
    let retained = LocalRetainedStore::new();
    retained.store("sensors/kitchen/temp", b"21.5".to_vec(), QoS::ExactOnce, 1_000).await.unwrap();
    retained.store("sensors/hall/temp", b"19.0".to_vec(), QoS::AtLeastOnce, 1_000).await.unwrap();
    retained.store("sensors/kitchen/humidity", b"40".to_vec(), QoS::AtMostOnce, 1_000).await.unwrap();

    let mut trie = SubscriptionTrie::new();
    trie.add("client-a".to_string(), "sensors/+/temp", QoS::AtMostOnce).unwrap();

    let matches = retained.get_matching("sensors/+/temp").await.unwrap();
    assert_eq!(matches.len(), 2);
    let topics: Vec<&str> = matches.iter().map(|(topic, _)| topic.as_str()).collect();
    assert!(topics.contains(&"sensors/kitchen/temp"));
    assert!(topics.contains(&"sensors/hall/temp"));

    // Delivery QoS is min(retained QoS, granted QoS); granted here is
    // AtMostOnce so both retained messages must be downgraded.
    let subscribers = trie.match_topic("sensors/kitchen/temp");
    let granted = *subscribers.get("client-a").unwrap();
    for (_, message) in &matches {
        let effective = std::cmp::min(message.qos, granted);
        assert_eq!(effective, QoS::AtMostOnce);
    }
}

#[tokio::test]
async fn test_empty_payload_clears_a_retained_message() {
    let retained = LocalRetainedStore::new();
    retained.store("a/b", b"v1".to_vec(), QoS::AtMostOnce, 1_000).await.unwrap();
    assert!(retained.get("a/b").await.unwrap().is_some());

    retained.store("a/b", Vec::new(), QoS::AtMostOnce, 2_000).await.unwrap();
    assert!(retained.get("a/b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_hash_wildcard_does_not_cross_subscriber_boundaries() {
    let mut trie = SubscriptionTrie::new();
    trie.add("a".to_string(), "home/#", QoS::AtLeastOnce).unwrap();
    trie.add("b".to_string(), "home/kitchen/+", QoS::ExactOnce).unwrap();

    let subscribers = trie.match_topic("home/kitchen/light");
    assert_eq!(subscribers.len(), 2);
    assert_eq!(subscribers["a"], QoS::AtLeastOnce);
    assert_eq!(subscribers["b"], QoS::ExactOnce);

    let subscribers = trie.match_topic("home/garage/door");
    assert_eq!(subscribers.len(), 1);
    assert!(subscribers.contains_key("a"));
}
