// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A genuine level-indexed trie over `/`-separated topic filters, with
//! `+`/`#` wildcard children kept as dedicated slots rather than scanned
//! for. This is the data structure the dispatcher's flat per-client scan
//! should have been: `match_topic` walks the published topic level by
//! level instead of testing every subscriber's filter against it.

use std::collections::HashMap;

use codec::QoS;

use crate::error::Error;
use crate::types::ClientId;

use super::validate_filter;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    plus: Option<Box<Node>>,
    hash: Option<Box<Node>>,
    subscribers: HashMap<ClientId, QoS>,
}

impl Node {
    fn child_mut(&mut self, level: &str) -> &mut Node {
        match level {
            "+" => self.plus.get_or_insert_with(|| Box::new(Node::default())),
            "#" => self.hash.get_or_insert_with(|| Box::new(Node::default())),
            lit => self.children.entry(lit.to_string()).or_default(),
        }
    }

    /// `true` if this node (after some mutation) has nothing left under it.
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.plus.is_none() && self.hash.is_none() && self.subscribers.is_empty()
    }
}

/// Maintains the set of active subscriptions and answers, for any concrete
/// topic, which clients are subscribed and at what granted QoS.
#[derive(Debug, Default)]
pub struct SubscriptionTrie {
    root: Node,
    /// `clientId -> {filter -> qos}`, kept alongside the trie so
    /// `subscriptions_of`/`remove_all` don't require a full tree walk.
    by_client: HashMap<ClientId, HashMap<String, QoS>>,
}

impl SubscriptionTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: a repeat subscription to the same filter replaces the
    /// granted QoS rather than adding a second entry.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` is not a well-formed topic filter.
    pub fn add(&mut self, client_id: ClientId, filter: &str, qos: QoS) -> Result<(), Error> {
        validate_filter(filter)?;
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.child_mut(level);
        }
        node.subscribers.insert(client_id.clone(), qos);
        self.by_client.entry(client_id).or_default().insert(filter.to_string(), qos);
        Ok(())
    }

    /// No-op if the client held no subscription to `filter`.
    pub fn remove(&mut self, client_id: &str, filter: &str) {
        if let Some(filters) = self.by_client.get_mut(client_id) {
            filters.remove(filter);
            if filters.is_empty() {
                self.by_client.remove(client_id);
            }
        }
        Self::remove_path(&mut self.root, filter.split('/'), client_id);
    }

    fn remove_path<'a>(node: &mut Node, mut levels: impl Iterator<Item = &'a str>, client_id: &str) -> bool {
        match levels.next() {
            None => {
                node.subscribers.remove(client_id);
            }
            Some("+") => {
                if let Some(child) = node.plus.as_mut() {
                    if Self::remove_path(child, levels, client_id) {
                        node.plus = None;
                    }
                }
            }
            Some("#") => {
                if let Some(child) = node.hash.as_mut() {
                    if Self::remove_path(child, levels, client_id) {
                        node.hash = None;
                    }
                }
            }
            Some(lit) => {
                let mut drop_child = false;
                if let Some(child) = node.children.get_mut(lit) {
                    drop_child = Self::remove_path(child, levels, client_id);
                }
                if drop_child {
                    node.children.remove(lit);
                }
            }
        }
        node.is_empty()
    }

    /// Removes every subscription owned by `client_id`.
    pub fn remove_all(&mut self, client_id: &str) {
        if let Some(filters) = self.by_client.remove(client_id) {
            for filter in filters.keys() {
                Self::remove_path(&mut self.root, filter.split('/'), client_id);
            }
        }
    }

    /// Enumerates filters currently held by `client_id`.
    #[must_use]
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<(String, QoS)> {
        self.by_client
            .get(client_id)
            .map(|filters| filters.iter().map(|(f, q)| (f.clone(), *q)).collect())
            .unwrap_or_default()
    }

    /// Returns every client whose currently present filters match `topic`,
    /// along with the highest granted QoS among matching filters.
    #[must_use]
    pub fn match_topic(&self, topic: &str) -> HashMap<ClientId, QoS> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut out = HashMap::new();
        Self::walk(&self.root, &levels, &mut out);
        out
    }

    fn walk(node: &Node, levels: &[&str], out: &mut HashMap<ClientId, QoS>) {
        if let Some(hash) = &node.hash {
            Self::merge(&hash.subscribers, out);
        }

        let Some((head, rest)) = levels.split_first() else {
            Self::merge(&node.subscribers, out);
            return;
        };

        if let Some(child) = node.children.get(*head) {
            Self::walk(child, rest, out);
        }
        if let Some(plus) = &node.plus {
            Self::walk(plus, rest, out);
        }
    }

    fn merge(subscribers: &HashMap<ClientId, QoS>, out: &mut HashMap<ClientId, QoS>) {
        for (client_id, qos) in subscribers {
            out.entry(client_id.clone())
                .and_modify(|existing| {
                    if *qos > *existing {
                        *existing = *qos;
                    }
                })
                .or_insert(*qos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plus_matches_single_level() {
        let mut trie = SubscriptionTrie::new();
        trie.add("c1".to_string(), "a/+/c", QoS::AtLeastOnce).unwrap();
        assert!(trie.match_topic("a/b/c").contains_key("c1"));
        assert!(!trie.match_topic("a/b/d/c").contains_key("c1"));
    }

    #[test]
    fn test_hash_matches_own_level_and_below() {
        let mut trie = SubscriptionTrie::new();
        trie.add("c1".to_string(), "a/#", QoS::AtMostOnce).unwrap();
        assert!(trie.match_topic("a").contains_key("c1"));
        assert!(trie.match_topic("a/b").contains_key("c1"));
        assert!(trie.match_topic("a/b/c").contains_key("c1"));
        assert!(!trie.match_topic("x").contains_key("c1"));
    }

    #[test]
    fn test_bare_hash_matches_every_nonempty_topic() {
        let mut trie = SubscriptionTrie::new();
        trie.add("c1".to_string(), "#", QoS::AtMostOnce).unwrap();
        assert!(trie.match_topic("a").contains_key("c1"));
        assert!(trie.match_topic("a/b/c").contains_key("c1"));
    }

    #[test]
    fn test_repeat_subscribe_replaces_qos_without_duplicating() {
        let mut trie = SubscriptionTrie::new();
        trie.add("c1".to_string(), "a/b", QoS::AtMostOnce).unwrap();
        trie.add("c1".to_string(), "a/b", QoS::ExactOnce).unwrap();
        assert_eq!(trie.subscriptions_of("c1").len(), 1);
        assert_eq!(trie.match_topic("a/b").get("c1"), Some(&QoS::ExactOnce));
    }

    #[test]
    fn test_add_then_remove_restores_prior_state() {
        let mut trie = SubscriptionTrie::new();
        trie.add("c1".to_string(), "a/b/c", QoS::AtMostOnce).unwrap();
        trie.remove("c1", "a/b/c");
        assert!(trie.match_topic("a/b/c").is_empty());
        assert!(trie.subscriptions_of("c1").is_empty());
    }

    #[test]
    fn test_highest_qos_wins_across_overlapping_filters() {
        let mut trie = SubscriptionTrie::new();
        trie.add("c1".to_string(), "a/+", QoS::AtMostOnce).unwrap();
        trie.add("c1".to_string(), "a/#", QoS::ExactOnce).unwrap();
        assert_eq!(trie.match_topic("a/b").get("c1"), Some(&QoS::ExactOnce));
    }

    #[test]
    fn test_remove_all_clears_every_filter() {
        let mut trie = SubscriptionTrie::new();
        trie.add("c1".to_string(), "a/b", QoS::AtMostOnce).unwrap();
        trie.add("c1".to_string(), "a/c", QoS::AtMostOnce).unwrap();
        trie.remove_all("c1");
        assert!(trie.match_topic("a/b").is_empty());
        assert!(trie.match_topic("a/c").is_empty());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let mut trie = SubscriptionTrie::new();
        assert!(trie.add("c1".to_string(), "a/#/c", QoS::AtMostOnce).is_err());
        assert!(trie.add("c1".to_string(), "a/b+", QoS::AtMostOnce).is_err());
    }
}
