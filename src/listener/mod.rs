// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Accepts inbound connections on one configured address/protocol pair and
//! spawns a `ClientSession` actor for each one that passes admission
//! control.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};

use crate::config;
use crate::error::{Error, ErrorKind};
use crate::stream::Stream;
use crate::types::ListenerId;

mod admission;
mod protocol;
mod run;

pub use admission::AdmissionControl;
pub use protocol::Protocol;

#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    protocol: Protocol,
    config: config::Listener,
    admission: Arc<Mutex<AdmissionControl>>,
}

impl Listener {
    /// Binds the socket named by `listener_config` and, for TLS protocols,
    /// loads the configured certificate chain and private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or a TLS listener is
    /// missing/has unreadable cert/key files.
    pub async fn bind(id: ListenerId, listener_config: config::Listener) -> Result<Self, Error> {
        let address = listener_config.address();
        let admission = Arc::new(Mutex::new(AdmissionControl::new(
            listener_config.maximum_connections(),
            listener_config.maximum_connections_per_ip(),
            listener_config.maximum_connections_per_sec(),
        )));

        let protocol = match listener_config.protocol() {
            config::Protocol::Mqtt => {
                log::info!("listener: bind mqtt://{address}");
                Protocol::Mqtt(TcpListener::bind(address).await?)
            }
            config::Protocol::Mqtts => {
                log::info!("listener: bind mqtts://{address}");
                let tls_config = Self::build_server_config(&listener_config)?;
                let acceptor = TlsAcceptor::from(Arc::new(tls_config));
                Protocol::Mqtts(TcpListener::bind(address).await?, acceptor)
            }
            config::Protocol::Ws => {
                log::info!("listener: bind ws://{address}");
                Protocol::Ws(TcpListener::bind(address).await?)
            }
            config::Protocol::Wss => {
                log::info!("listener: bind wss://{address}");
                let tls_config = Self::build_server_config(&listener_config)?;
                let acceptor = TlsAcceptor::from(Arc::new(tls_config));
                Protocol::Wss(TcpListener::bind(address).await?, acceptor)
            }
        };

        Ok(Self {
            id,
            protocol,
            config: listener_config,
            admission,
        })
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
        let mut reader = BufReader::new(File::open(path)?);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| Error::from_string(ErrorKind::CertError, format!("failed to load cert file at {path:?}: {err}")))
    }

    fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
        let mut reader = BufReader::new(File::open(path)?);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|err| Error::from_string(ErrorKind::CertError, format!("failed to load key file at {path:?}: {err}")))?
            .ok_or_else(|| Error::new(ErrorKind::CertError, "no private key found in key file"))
    }

    fn build_server_config(listener_config: &config::Listener) -> Result<rustls::ServerConfig, Error> {
        let cert_file = listener_config
            .cert_file()
            .ok_or_else(|| Error::new(ErrorKind::CertError, "cert_file is required"))?;
        let key_file = listener_config
            .key_file()
            .ok_or_else(|| Error::new(ErrorKind::CertError, "key_file is required"))?;
        let certs = Self::load_certs(cert_file)?;
        let key = Self::load_key(key_file)?;
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| Error::from_string(ErrorKind::CertError, format!("failed to build tls server config: {err}")))
    }

    /// Accepts the next raw TCP connection without performing any
    /// protocol-specific handshake yet, so admission control can run before
    /// the (potentially expensive) TLS/WebSocket upgrade.
    async fn accept_raw(&mut self) -> Result<(TcpStream, SocketAddr), Error> {
        let listener = match &self.protocol {
            Protocol::Mqtt(listener)
            | Protocol::Mqtts(listener, _)
            | Protocol::Ws(listener)
            | Protocol::Wss(listener, _) => listener,
        };
        Ok(listener.accept().await?)
    }

    async fn upgrade(&self, tcp_stream: TcpStream) -> Result<Stream, Error> {
        match &self.protocol {
            Protocol::Mqtt(..) => Ok(Stream::Mqtt(tcp_stream)),
            Protocol::Mqtts(_, acceptor) => {
                let tls_stream = acceptor.accept(tcp_stream).await?;
                Ok(Stream::Mqtts(Box::new(tls_stream)))
            }
            Protocol::Ws(..) => {
                let ws_stream = tokio_tungstenite::accept_async(tcp_stream).await?;
                Ok(Stream::Ws(Box::new(ws_stream)))
            }
            Protocol::Wss(_, acceptor) => {
                let tls_stream = acceptor.accept(tcp_stream).await?;
                let ws_stream = tokio_tungstenite::accept_async(tls_stream).await?;
                Ok(Stream::Wss(Box::new(ws_stream)))
            }
        }
    }
}
