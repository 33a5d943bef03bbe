// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::types::NodeId;

mod qos_u8 {
    use codec::QoS;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::convert::TryFrom;

    pub fn serialize<S: Serializer>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*qos as u8)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<QoS, D::Error> {
        let value = u8::deserialize(deserializer)?;
        QoS::try_from(value).map_err(|_| serde::de::Error::custom("maximum_qos must be 0, 1 or 2"))
    }
}

/// Broker-wide settings that are not specific to any one listener.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct General {
    /// Identity of this node within the cluster. Must be unique
    /// cluster-wide; used as the routing key other nodes forward
    /// `PUBLISH` packets to.
    #[serde(default = "General::default_node_id")]
    node_id: NodeId,

    /// Maximum accepted `PUBLISH` payload size, in bytes.
    ///
    /// Default is 0, which means no limit beyond the protocol maximum.
    #[serde(default = "General::default_message_size_limit")]
    message_size_limit: u32,

    /// Maximum `QoS` this broker grants in `SUBACK`, regardless of what the
    /// client requested.
    ///
    /// Default is 2.
    #[serde(default = "General::default_maximum_qos", with = "qos_u8")]
    maximum_qos: QoS,

    /// Maximum number of in-flight `QoS` 1/2 messages tracked per session
    /// before the broker stops delivering further messages to it.
    ///
    /// Default is 20.
    #[serde(default = "General::default_maximum_inflight_messages")]
    maximum_inflight_messages: u16,

    /// How long an offline (non-`CleanSession`) session's state is kept
    /// before it is evicted, in seconds.
    ///
    /// Default is 3600 (1 hour).
    #[serde(default = "General::default_session_expiry_interval")]
    session_expiry_interval: u32,
}

impl General {
    #[must_use]
    pub fn default_node_id() -> NodeId {
        "node-1".to_string()
    }

    #[must_use]
    pub const fn default_message_size_limit() -> u32 {
        0
    }

    #[must_use]
    pub const fn default_maximum_qos() -> QoS {
        QoS::ExactOnce
    }

    #[must_use]
    pub const fn default_maximum_inflight_messages() -> u16 {
        20
    }

    #[must_use]
    pub const fn default_session_expiry_interval() -> u32 {
        3600
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub const fn message_size_limit(&self) -> u32 {
        self.message_size_limit
    }

    #[must_use]
    pub const fn maximum_qos(&self) -> QoS {
        self.maximum_qos
    }

    #[must_use]
    pub const fn maximum_inflight_messages(&self) -> u16 {
        self.maximum_inflight_messages
    }

    #[must_use]
    pub const fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if `node_id` is empty.
    pub fn validate(&self) -> Result<(), Error> {
        if self.node_id.trim().is_empty() {
            return Err(Error::new(ErrorKind::ConfigError, "node_id must not be empty"));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            node_id: Self::default_node_id(),
            message_size_limit: Self::default_message_size_limit(),
            maximum_qos: Self::default_maximum_qos(),
            maximum_inflight_messages: Self::default_maximum_inflight_messages(),
            session_expiry_interval: Self::default_session_expiry_interval(),
        }
    }
}
