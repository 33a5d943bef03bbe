// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Subscribes to the Redis channels `ClusterRouter` and the retained store
//! publish to, and feeds every message back into this node's own
//! handlers. `ConnectionManager` (used for ordinary commands elsewhere in
//! the crate) has no pub/sub support, so this loop opens its own
//! dedicated connection from the raw `redis::Client`.

use std::sync::Arc;

use futures::StreamExt;

use crate::context::BrokerContext;
use crate::error::Error;

const BROADCAST_CHANNEL: &str = "dynamq:cluster:publish";
const KICK_CHANNEL: &str = "dynamq:cluster:kick";
const RETAIN_SYNC_CHANNEL: &str = "dynamq:retain:sync";

fn node_channel(node_id: &str) -> String {
    format!("dynamq:node:{node_id}")
}

/// Runs for the lifetime of the process, spawned alongside
/// `run_cluster_event_loop` and `HealthTicker::run_loop`. A transient
/// connection failure ends the loop; the caller logs and the node simply
/// stops receiving remote cluster events until restarted.
///
/// # Errors
///
/// Returns error if the pub/sub connection cannot be established or a
/// channel subscription is rejected.
pub async fn run_loop(client: redis::Client, ctx: Arc<BrokerContext>) -> Result<(), Error> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(BROADCAST_CHANNEL).await?;
    pubsub.subscribe(KICK_CHANNEL).await?;
    pubsub.subscribe(node_channel(&ctx.node_id)).await?;
    pubsub.subscribe(RETAIN_SYNC_CHANNEL).await?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: Vec<u8> = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("cluster: malformed pub/sub payload on {channel}: {err:?}");
                continue;
            }
        };
        dispatch(&ctx, &channel, &payload);
    }
    Ok(())
}

fn dispatch(ctx: &Arc<BrokerContext>, channel: &str, payload: &[u8]) {
    if channel == BROADCAST_CHANNEL {
        match serde_json::from_slice(payload) {
            Ok(envelope) => ctx.cluster_router.handle_remote_broadcast(envelope),
            Err(err) => log::warn!("cluster: malformed broadcast envelope: {err:?}"),
        }
    } else if channel == KICK_CHANNEL {
        match serde_json::from_slice(payload) {
            Ok(envelope) => ctx.cluster_router.handle_remote_kick(envelope),
            Err(err) => log::warn!("cluster: malformed kick envelope: {err:?}"),
        }
    } else if channel == RETAIN_SYNC_CHANNEL {
        ctx.retained_store.handle_remote_sync_event(payload);
    } else {
        // The only other subscription made above is this node's own
        // unicast channel.
        match serde_json::from_slice(payload) {
            Ok(envelope) => ctx.cluster_router.handle_remote_unicast(envelope),
            Err(err) => log::warn!("cluster: malformed unicast envelope: {err:?}"),
        }
    }
}
