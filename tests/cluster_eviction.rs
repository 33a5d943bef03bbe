// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Single-owner enforcement: a client id may be connected to at most one
//! node at a time, and a `CONNECT` arriving elsewhere must evict the prior
//! owner, local or remote.

use dynamq::cluster::eviction::{self, EvictionRequest};
use dynamq::cluster::router::ClusterRouter;
use dynamq::session_store::{LocalSessionStore, SessionStore};

// `ClusterRouter::new` only takes a `(node_id, enabled)` pair without the
// `cluster` feature; with it enabled it also takes a shared-store
// connection, which this in-process test has no use for.
#[cfg(not(feature = "cluster"))]
#[tokio::test]
async fn test_first_connect_has_no_prior_owner() {
    let store = LocalSessionStore::new();
    let router = ClusterRouter::new("node-1".to_string(), false);

    let decision = eviction::resolve(&store, &router, "client-1").await.unwrap();
    assert_eq!(decision, EvictionRequest::None);
}

#[cfg(not(feature = "cluster"))]
#[tokio::test]
async fn test_reconnect_on_same_node_is_a_local_eviction() {
    let store = LocalSessionStore::new();
    let router = ClusterRouter::new("node-1".to_string(), false);

    store.set_client_node("client-1", "node-1", 60).await.unwrap();
    let decision = eviction::resolve(&store, &router, "client-1").await.unwrap();
    assert_eq!(decision, EvictionRequest::Local);
}

#[cfg(not(feature = "cluster"))]
#[tokio::test]
async fn test_reconnect_on_a_different_node_is_a_remote_eviction() {
    let store = LocalSessionStore::new();
    let router = ClusterRouter::new("node-2".to_string(), false);

    store.set_client_node("client-1", "node-1", 60).await.unwrap();
    let decision = eviction::resolve(&store, &router, "client-1").await.unwrap();
    assert_eq!(decision, EvictionRequest::Remote("node-1".to_string()));

    // With the cluster feature disabled the router forces local-only
    // routing, so applying a remote eviction must not error even though
    // no peer will ever observe it.
    eviction::apply(&router, &decision, &"client-1".to_string()).await.unwrap();
}
