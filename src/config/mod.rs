// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

mod cluster;
mod general;
mod listener;
mod log;

pub use cluster::Cluster;
pub use general::General;
pub use listener::{Listener, Protocol};
pub use self::log::{Log, LogLevel};

/// Top-level broker configuration, loaded from a TOML file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "General::default")]
    general: General,

    #[serde(default = "Listener::default_listeners")]
    listeners: Vec<Listener>,

    #[serde(default = "Cluster::default")]
    cluster: Cluster,

    #[serde(default = "Log::default")]
    log: Log,
}

impl Config {
    /// Parse configuration from TOML source.
    ///
    /// # Errors
    ///
    /// Returns error if `content` is not valid TOML or does not match the
    /// expected schema.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        Ok(toml::from_str(content)?)
    }

    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    #[must_use]
    pub const fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if any section is invalid.
    pub fn validate(&self, bind_address: bool) -> Result<(), Error> {
        self.general.validate()?;
        for listener in &self.listeners {
            listener.validate(bind_address)?;
        }
        self.cluster.validate()?;
        self.log.validate()
    }
}
