// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Duplicate-`ClientId` eviction: whichever node most recently accepted
//! a `CONNECT` for a client is its sole owner, and the previous owner
//! must drop the old connection.

use crate::session_store::SessionStore;
use crate::types::{ClientId, NodeId};

use super::router::ClusterRouter;

/// A decision the connection handler must act on after consulting the
/// session store during `CONNECT` processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionRequest {
    /// No prior owner; proceed with the new connection uncontested.
    None,
    /// The prior owner was this same node; the handler must close the
    /// stale local connection before accepting the new one.
    Local,
    /// The prior owner is a peer node; an eviction message must be
    /// published so that node drops its connection.
    Remote(NodeId),
}

/// Looks up the current owner of `client_id` and classifies what the
/// caller must do before accepting the new `CONNECT`, per the
/// single-owner enforcement rule.
pub async fn resolve(
    session_store: &dyn SessionStore,
    router: &ClusterRouter,
    client_id: &str,
) -> Result<EvictionRequest, crate::error::Error> {
    match session_store.get_client_node(client_id).await? {
        None => Ok(EvictionRequest::None),
        Some(node) if node == router.node_id() => Ok(EvictionRequest::Local),
        Some(node) => Ok(EvictionRequest::Remote(node)),
    }
}

/// Publishes the eviction request implied by `decision`, if any.
pub async fn apply(
    router: &ClusterRouter,
    decision: &EvictionRequest,
    client_id: &ClientId,
) -> Result<(), crate::error::Error> {
    if let EvictionRequest::Remote(node) = decision {
        router.evict(node, client_id.clone()).await?;
    }
    Ok(())
}
