// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::net::{TcpListener, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

/// Wire transport a listener accepts connections over.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Raw MQTT over TCP.
    #[serde(alias = "mqtt")]
    Mqtt,

    /// MQTT over TCP with TLS encryption.
    #[serde(alias = "mqtts")]
    Mqtts,

    /// MQTT over WebSocket.
    #[serde(alias = "ws")]
    Ws,

    /// MQTT over secure WebSocket.
    #[serde(alias = "wss")]
    Wss,
}

/// An address/protocol combination the broker accepts client connections on.
#[derive(Debug, Deserialize, Clone)]
pub struct Listener {
    /// Binding protocol.
    ///
    /// Default is mqtt.
    #[serde(default = "Listener::default_protocol")]
    protocol: Protocol,

    /// Binding address, including host and port.
    ///
    /// Default is 0.0.0.0:1883.
    #[serde(default = "Listener::default_address")]
    address: String,

    /// Url path to bind to; only used for the websocket protocols.
    ///
    /// Default is None, which means do not check the url path.
    #[serde(default = "Listener::default_path")]
    path: Option<String>,

    /// Path to TLS certificate chain file (PEM). Required for `mqtts`/`wss`.
    #[serde(default = "Listener::default_cert_file")]
    cert_file: Option<PathBuf>,

    /// Path to TLS private key file (PEM). Required for `mqtts`/`wss`.
    #[serde(default = "Listener::default_key_file")]
    key_file: Option<PathBuf>,

    /// Maximum number of client connections this listener will accept.
    ///
    /// Default is 0, which means unlimited.
    #[serde(default = "Listener::default_maximum_connections")]
    maximum_connections: usize,

    /// Maximum number of simultaneous connections this listener will
    /// accept from a single source address.
    ///
    /// Default is 100, 0 means unlimited.
    #[serde(default = "Listener::default_maximum_connections_per_ip")]
    maximum_connections_per_ip: usize,

    /// Maximum number of new connections this listener admits per second,
    /// reset every second. 0 means unlimited.
    ///
    /// Default is 50.
    #[serde(default = "Listener::default_maximum_connections_per_sec")]
    maximum_connections_per_sec: usize,

    /// Default keep-alive in seconds, used when a client requests 0.
    ///
    /// Default is 60.
    #[serde(default = "Listener::default_keep_alive")]
    keep_alive: u16,

    /// Timeout in seconds to wait for `CONNECT` after the TCP handshake.
    ///
    /// Default is 10.
    #[serde(default = "Listener::default_connect_timeout")]
    connect_timeout: u16,

    /// A client may supply a zero-length `ClientId` and have the broker
    /// assign one, per [MQTT-3.1.3-6]. When false, such clients are
    /// rejected with `IdentifierRejected`.
    ///
    /// Default is true.
    #[serde(default = "Listener::default_allow_empty_client_id")]
    allow_empty_client_id: bool,
}

impl Listener {
    #[must_use]
    pub fn default_listeners() -> Vec<Self> {
        vec![Self::default()]
    }

    #[must_use]
    pub const fn default_protocol() -> Protocol {
        Protocol::Mqtt
    }

    #[must_use]
    pub fn default_address() -> String {
        "0.0.0.0:1883".to_string()
    }

    #[must_use]
    pub const fn default_path() -> Option<String> {
        None
    }

    #[must_use]
    pub const fn default_cert_file() -> Option<PathBuf> {
        None
    }

    #[must_use]
    pub const fn default_key_file() -> Option<PathBuf> {
        None
    }

    #[must_use]
    pub const fn default_maximum_connections() -> usize {
        0
    }

    #[must_use]
    pub const fn default_maximum_connections_per_ip() -> usize {
        100
    }

    #[must_use]
    pub const fn default_maximum_connections_per_sec() -> usize {
        50
    }

    #[must_use]
    pub const fn default_keep_alive() -> u16 {
        60
    }

    #[must_use]
    pub const fn default_connect_timeout() -> u16 {
        10
    }

    #[must_use]
    pub const fn default_allow_empty_client_id() -> bool {
        true
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    #[must_use]
    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    #[must_use]
    pub const fn maximum_connections(&self) -> usize {
        self.maximum_connections
    }

    #[must_use]
    pub const fn maximum_connections_per_ip(&self) -> usize {
        self.maximum_connections_per_ip
    }

    #[must_use]
    pub const fn maximum_connections_per_sec(&self) -> usize {
        self.maximum_connections_per_sec
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> u16 {
        self.connect_timeout
    }

    #[must_use]
    pub const fn allow_empty_client_id(&self) -> bool {
        self.allow_empty_client_id
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if the socket address is malformed, already in use
    /// (when `bind_address` is set), or if a TLS protocol is missing its
    /// cert/key pair.
    pub fn validate(&self, bind_address: bool) -> Result<(), Error> {
        if matches!(self.protocol, Protocol::Mqtts | Protocol::Wss)
            && (self.cert_file.is_none() || self.key_file.is_none())
        {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "mqtts/wss listeners require both cert_file and key_file",
            ));
        }

        if bind_address {
            let _socket = TcpListener::bind(&self.address).map_err(|err| {
                Error::from_string(
                    ErrorKind::ConfigError,
                    format!("failed to bind to address {}: {err}", &self.address),
                )
            })?;
        } else {
            let _addr = self.address.to_socket_addrs().map_err(|err| {
                Error::from_string(
                    ErrorKind::ConfigError,
                    format!("invalid socket address {}: {err}", &self.address),
                )
            })?;
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            protocol: Self::default_protocol(),
            address: Self::default_address(),
            path: Self::default_path(),
            cert_file: Self::default_cert_file(),
            key_file: Self::default_key_file(),
            maximum_connections: Self::default_maximum_connections(),
            maximum_connections_per_ip: Self::default_maximum_connections_per_ip(),
            maximum_connections_per_sec: Self::default_maximum_connections_per_sec(),
            keep_alive: Self::default_keep_alive(),
            connect_timeout: Self::default_connect_timeout(),
            allow_empty_client_id: Self::default_allow_empty_client_id(),
        }
    }
}
