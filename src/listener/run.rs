// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Drives the accept loop for one listener.

use std::net::SocketAddr;
use std::sync::Arc;

use codec::v3::{ConnectAckPacket, ConnectReturnCode};
use codec::EncodePacket;
use tokio::net::TcpStream;

use super::Listener;
use crate::context::BrokerContext;
use crate::session::{ClientSession, SessionConfig};

impl Listener {
    /// Accepts connections until the socket errors, spawning a
    /// `ClientSession` for each one admission control lets through.
    pub async fn run_loop(mut self, ctx: Arc<BrokerContext>) {
        loop {
            let (tcp_stream, addr) = match self.accept_raw().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("listener[{}]: accept failed: {err:?}", self.id);
                    continue;
                }
            };

            if !self.admission.lock().unwrap().try_admit(addr.ip()) {
                log::warn!("listener[{}]: rejecting {addr}, admission limit reached", self.id);
                self.reject_with_server_unavailable(tcp_stream, addr).await;
                continue;
            }

            let stream = match self.upgrade(tcp_stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!("listener[{}]: handshake with {addr} failed: {err:?}", self.id);
                    self.admission.lock().unwrap().release(addr.ip());
                    continue;
                }
            };

            let session_config = SessionConfig::new(
                u64::from(self.config.keep_alive()),
                u64::from(self.config.connect_timeout()),
                self.config.allow_empty_client_id(),
                ctx.config.general().maximum_qos(),
                ctx.config.general().maximum_inflight_messages(),
            );
            let session = ClientSession::new(Arc::clone(&ctx), session_config, stream, ctx.node_id.clone());

            let admission = Arc::clone(&self.admission);
            tokio::spawn(async move {
                session.run_loop().await;
                admission.lock().unwrap().release(addr.ip());
            });
        }
    }

    /// Speaks just enough of the protocol to reject a connection admission
    /// control turned away: upgrades the socket (TLS/WebSocket handshake,
    /// if configured), sends a `CONNACK` carrying `ServerUnavailable`, then
    /// drops the stream.
    async fn reject_with_server_unavailable(&self, tcp_stream: TcpStream, addr: SocketAddr) {
        let mut stream = match self.upgrade(tcp_stream).await {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("listener[{}]: handshake with {addr} failed while rejecting: {err:?}", self.id);
                return;
            }
        };

        let ack_packet = ConnectAckPacket::new(false, ConnectReturnCode::ServerUnavailable);
        let mut buf = Vec::new();
        if let Err(err) = ack_packet.encode(&mut buf) {
            log::error!("listener[{}]: failed to encode rejection connack: {err:?}", self.id);
            return;
        }
        if let Err(err) = stream.write(&buf).await {
            log::warn!("listener[{}]: failed to write rejection connack to {addr}: {err:?}", self.id);
        }
    }
}
