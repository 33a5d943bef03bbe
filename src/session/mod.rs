// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The per-connection actor. One `ClientSession` owns exactly one
//! transport and drives the MQTT 3.1.1 state machine for it, generalized
//! from the single-channel `Session::run_loop` to additionally select
//! over a cluster retry tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use codec::v3::{DisconnectPacket, Packet};
use codec::{EncodePacket, PacketId, QoS};
use tokio::sync::{broadcast, mpsc};

use crate::commands::ListenerToSessionCmd;
use crate::context::{now_ms, BrokerContext};
use crate::error::{Error, ErrorKind};
use crate::retry::RetryScheduler;
use crate::stream::Stream;
use crate::types::{ClientId, NodeId};

mod client;
pub mod pending;

pub use config::SessionConfig;

mod config;

use pending::PendingMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    AwaitingConnect,
    Connected,
    Closing,
    Closed,
}

/// A message the client asked to have published on its behalf if it
/// disconnects without sending `DISCONNECT`.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

pub struct ClientSession {
    ctx: Arc<BrokerContext>,
    config: SessionConfig,
    stream: Stream,

    status: Status,
    client_id: ClientId,
    username: Option<String>,
    clean_session: bool,
    node_id: NodeId,

    instant: Instant,

    next_packet_id: u16,

    /// Outbound QoS 1/2 messages awaiting acknowledgement, keyed by the
    /// packet id this session allocated for them.
    pending: HashMap<PacketId, PendingMessage>,

    /// Inbound QoS 2 `PUBLISH` packet ids between `PUBREC` and `PUBREL`,
    /// so a duplicate delivery (client resends with DUP set before the
    /// `PUBREL` round-trip completes) is acknowledged without re-running
    /// the publish pipeline, per [MQTT-4.3.3-2].
    pub_recv_packets: HashSet<PacketId>,

    will: Option<WillMessage>,

    retry_scheduler: RetryScheduler,
    retry_ticks: broadcast::Receiver<()>,

    /// Created eagerly so the select loop always has a receiver to poll;
    /// the paired sender is only handed to `BrokerContext::register` once
    /// the client id is known, at the end of a successful `CONNECT`.
    command_sender: mpsc::Sender<ListenerToSessionCmd>,
    command_receiver: mpsc::Receiver<ListenerToSessionCmd>,
}

impl ClientSession {
    #[must_use]
    pub fn new(ctx: Arc<BrokerContext>, config: SessionConfig, stream: Stream, node_id: NodeId) -> Self {
        let retry_ticks = ctx.health_ticker.subscribe_retry_ticks();
        let (command_sender, command_receiver) = mpsc::channel(32);
        Self {
            ctx,
            config,
            stream,
            status: Status::AwaitingConnect,
            client_id: String::new(),
            username: None,
            clean_session: true,
            node_id,
            instant: Instant::now(),
            next_packet_id: 1,
            pending: HashMap::new(),
            pub_recv_packets: HashSet::new(),
            will: None,
            retry_scheduler: RetryScheduler::default(),
            retry_ticks,
            command_sender,
            command_receiver,
        }
    }

    /// Allocates the next outbound packet id, wrapping from 65535 back to
    /// 1 (0 is reserved and never issued).
    fn next_packet_id(&mut self) -> PacketId {
        let id = self.next_packet_id;
        self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };
        PacketId::new(id)
    }

    fn reset_instant(&mut self) {
        self.instant = Instant::now();
        self.touch_activity();
    }

    fn touch_activity(&self) {
        let ctx = Arc::clone(&self.ctx);
        let client_id = self.client_id.clone();
        if client_id.is_empty() {
            return;
        }
        tokio::spawn(async move {
            if let Ok(Some(mut session)) = ctx.session_store.get_session(&client_id).await {
                session.last_activity_at = now_ms();
                let _ = ctx.session_store.update_session(&session).await;
            }
        });
    }

    pub async fn run_loop(mut self) {
        let mut buf = Vec::with_capacity(1024);
        let connect_deadline = Instant::now();

        loop {
            if self.status == Status::AwaitingConnect
                && self.config.connect_timeout() > 0
                && connect_deadline.elapsed().as_secs() > self.config.connect_timeout()
            {
                log::warn!("session: connect timeout elapsed for a pending connection");
                break;
            }
            if self.status == Status::Closed {
                break;
            }

            tokio::select! {
                result = self.stream.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => {
                            log::info!("session: peer closed connection, client_id={}", self.client_id);
                            self.handle_abnormal_close().await;
                            break;
                        }
                        Ok(_) => {
                            if let Err(err) = self.handle_client_packet(&buf).await {
                                log::error!("session: failed to handle client packet: {err:?}");
                                self.handle_abnormal_close().await;
                                buf.clear();
                                break;
                            }
                            buf.clear();
                        }
                        Err(err) => {
                            log::warn!("session: transport read failed: {err:?}");
                            self.handle_abnormal_close().await;
                            break;
                        }
                    }
                }
                Some(cmd) = self.command_receiver.recv() => {
                    if let Err(err) = self.handle_listener_command(cmd).await {
                        log::error!("session: failed to handle listener command: {err:?}");
                        break;
                    }
                }
                Ok(()) = self.retry_ticks.recv() => {
                    self.sweep_retries().await;
                }
            }

            if self.status == Status::Connected
                && self.config.keep_alive() > 0
                && self.instant.elapsed().as_secs() > self.config.keep_alive()
            {
                log::warn!("session: keep-alive window exceeded, client_id={}", self.client_id);
                self.handle_abnormal_close().await;
                break;
            }
        }

        if !self.client_id.is_empty() {
            self.ctx.unregister(&self.client_id).await;
        }
    }

    async fn sweep_retries(&mut self) {
        let due = self.retry_scheduler.sweep(&mut self.pending, now_ms());
        for (packet_id, message) in due {
            let mut packet = match codec::v3::PublishPacket::new(&message.topic, message.qos, &message.payload) {
                Ok(packet) => packet,
                Err(err) => {
                    log::error!("session: failed to rebuild retry packet: {err:?}");
                    continue;
                }
            };
            packet.set_retain(message.retain);
            if let Err(err) = packet.set_dup(true) {
                log::error!("session: cannot set dup on retry: {err:?}");
                continue;
            }
            packet.set_packet_id(packet_id);
            if let Err(err) = self.send(packet).await {
                log::error!("session: failed to retransmit pending message: {err:?}");
            }
        }
    }

    async fn handle_abnormal_close(&mut self) {
        self.status = Status::Closing;
        if !self.client_id.is_empty() {
            if let Some(will) = self.will.take() {
                if let Ok(publish) = codec::v3::PublishPacket::new(&will.topic, will.qos, &will.payload) {
                    let mut publish = publish;
                    publish.set_retain(will.retain);
                    self.ctx.handle_publish(&self.client_id, &publish).await;
                }
            }
            self.finish_session().await;
        }
        self.status = Status::Closed;
    }

    async fn finish_session(&mut self) {
        self.ctx.subscription_trie.write().await.remove_all(&self.client_id);
        if let Err(err) = self.ctx.session_store.remove_session(&self.client_id, self.clean_session).await {
            log::error!("session: failed to finalize session store entry: {err:?}");
        }
    }

    async fn send<P: EncodePacket + Packet>(&mut self, packet: P) -> Result<(), Error> {
        if self.status == Status::Closed {
            return Err(Error::new(
                ErrorKind::SocketError,
                "session: cannot send on a closed connection",
            ));
        }
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write(&buf).await.map(drop)?;
        self.reset_instant();
        Ok(())
    }

    async fn send_disconnect(&mut self) -> Result<(), Error> {
        self.status = Status::Closing;
        let packet = DisconnectPacket::new();
        self.send(packet).await?;
        self.status = Status::Closed;
        Ok(())
    }

    async fn handle_listener_command(&mut self, cmd: ListenerToSessionCmd) -> Result<(), Error> {
        match cmd {
            ListenerToSessionCmd::ConnectAck(packet) => self.send(packet).await,
            ListenerToSessionCmd::Publish(packet) => self.deliver_publish(packet).await,
            ListenerToSessionCmd::SubscribeAck(packet) => self.send(packet).await,
            ListenerToSessionCmd::UnsubscribeAck(packet) => self.send(packet).await,
            ListenerToSessionCmd::Kick => {
                log::info!("session: evicted by a newer connection, client_id={}", self.client_id);
                self.status = Status::Closing;
                self.send_disconnect().await
            }
        }
    }

    /// Delivers a matched/retained `PUBLISH` to this client, tracking it
    /// in the retry table when QoS > 0.
    async fn deliver_publish(&mut self, mut packet: codec::v3::PublishPacket) -> Result<(), Error> {
        if packet.qos() == QoS::AtMostOnce {
            packet.set_packet_id(PacketId::new(0));
            return self.send(packet).await;
        }

        let packet_id = self.next_packet_id();
        packet.set_packet_id(packet_id);
        let message = PendingMessage::new(
            packet.topic().to_string(),
            packet.message().to_vec(),
            packet.qos(),
            packet.retain(),
            now_ms(),
        );
        self.pending.insert(packet_id, message);
        self.send(packet).await
    }
}
