// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

/// Connection details for the shared store that coordinates this broker
/// with the rest of the cluster (retained messages, session ownership,
/// cross-node routing). Mirrors the `redis_conn` stanza the upstream
/// connector config anticipates, generalized to the shared-store contract.
#[derive(Debug, Deserialize, Clone)]
pub struct Cluster {
    /// Enable cluster mode. When false, the broker runs standalone and all
    /// shared-store-backed components fall back to their local variants.
    ///
    /// Default is false.
    #[serde(default = "Cluster::default_enabled")]
    enabled: bool,

    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`.
    ///
    /// Default is `redis://127.0.0.1:6379`.
    #[serde(default = "Cluster::default_url")]
    url: String,

    /// How often this node publishes a heartbeat, in seconds.
    ///
    /// Default is 5.
    #[serde(default = "Cluster::default_heartbeat_interval")]
    heartbeat_interval: u32,

    /// How long since a node's last heartbeat before it is considered
    /// down, in seconds.
    ///
    /// Default is 15.
    #[serde(default = "Cluster::default_node_timeout")]
    node_timeout: u32,
}

impl Cluster {
    #[must_use]
    pub const fn default_enabled() -> bool {
        false
    }

    #[must_use]
    pub fn default_url() -> String {
        "redis://127.0.0.1:6379".to_string()
    }

    #[must_use]
    pub const fn default_heartbeat_interval() -> u32 {
        5
    }

    #[must_use]
    pub const fn default_node_timeout() -> u32 {
        15
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> u32 {
        self.heartbeat_interval
    }

    #[must_use]
    pub const fn node_timeout(&self) -> u32 {
        self.node_timeout
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if `node_timeout` is not comfortably larger than
    /// `heartbeat_interval` (otherwise nodes would be flagged down between
    /// their own heartbeats).
    pub fn validate(&self) -> Result<(), Error> {
        if self.enabled && self.node_timeout <= self.heartbeat_interval * 2 {
            return Err(Error::new(
                crate::error::ErrorKind::ConfigError,
                "node_timeout must be at least twice heartbeat_interval",
            ));
        }
        Ok(())
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            url: Self::default_url(),
            heartbeat_interval: Self::default_heartbeat_interval(),
            node_timeout: Self::default_node_timeout(),
        }
    }
}
