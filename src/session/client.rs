// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handles client packets.

use codec::utils::random_client_id;
use codec::v3::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PingRequestPacket, PingResponsePacket,
    PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket, SubscribeAck,
    SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use codec::{ByteArray, DecodeError, DecodePacket, FixedHeader, PacketType, QoS};

use super::{ClientSession, Status, WillMessage};
use crate::cluster::eviction::{self, EvictionRequest};
use crate::context::now_ms;
use crate::error::Error;
use crate::permission::Action;

impl ClientSession {
    pub(super) async fn handle_client_packet(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let fixed_header = match FixedHeader::decode(&mut ba) {
            Ok(fixed_header) => fixed_header,
            Err(err) => {
                log::error!("session: invalid fixed header: {err:?}");
                return self.send_disconnect().await;
            }
        };

        // [MQTT-3.1.2-23]: in the absence of any other control packet, the
        // client sends PINGREQ within one and a half times the keep-alive.
        self.reset_instant();

        match fixed_header.packet_type() {
            PacketType::Connect => self.on_client_connect(buf).await,
            PacketType::PingRequest => self.on_client_ping(buf).await,
            PacketType::Publish { .. } => self.on_client_publish(buf).await,
            PacketType::PublishRelease => self.on_client_publish_release(buf).await,
            PacketType::Subscribe => self.on_client_subscribe(buf).await,
            PacketType::Unsubscribe => self.on_client_unsubscribe(buf).await,
            PacketType::PublishAck => self.on_client_publish_ack(buf).await,
            PacketType::PublishReceived => self.on_client_publish_received(buf).await,
            PacketType::PublishComplete => self.on_client_publish_complete(buf).await,
            PacketType::Disconnect => self.on_client_disconnect(buf).await,
            t => {
                log::warn!("session: unexpected packet before CONNECT: {t:?}");
                self.send_disconnect().await
            }
        }
    }

    async fn reject_client_id(&mut self) -> Result<(), Error> {
        // If a server sends a CONNACK containing a non-zero return code it
        // MUST set Session Present to 0 [MQTT-3.2.2-4].
        let ack_packet = ConnectAckPacket::new(false, ConnectReturnCode::IdentifierRejected);
        self.send(ack_packet).await?;
        self.status = Status::Closed;
        Ok(())
    }

    async fn on_client_connect(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let mut packet = match ConnectPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => match err {
                DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel => {
                    let ack_packet = ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
                    self.send(ack_packet).await?;
                    self.status = Status::Closed;
                    return Err(err.into());
                }
                DecodeError::InvalidClientId => {
                    self.reject_client_id().await?;
                    return Err(err.into());
                }
                _ => {
                    // The server MUST close the connection without sending a
                    // CONNACK if the CONNECT packet does not conform to
                    // section 3.1 [MQTT-3.1.4-1].
                    self.status = Status::Closed;
                    return Err(err.into());
                }
            },
        };

        // The server MUST process a second CONNECT as a protocol violation
        // and disconnect the client [MQTT-3.1.0-2].
        if self.status == Status::Connected {
            self.status = Status::Closed;
            return self.send_disconnect().await;
        }

        // [MQTT-3.1.3-6]: a zero-length client id gets a server-assigned one.
        if packet.client_id().is_empty() {
            if self.config.allow_empty_client_id() {
                let generated = random_client_id();
                let _ = packet.set_client_id(&generated);
            } else {
                return self.reject_client_id().await;
            }
        }

        // [MQTT-3.1.3-8]: a zero-length client id with cleanSession=0 is
        // rejected outright, since there is nothing to restore on reconnect.
        if !packet.connect_flags().clean_session() && packet.client_id().is_empty() {
            return self.reject_client_id().await;
        }

        if packet.keep_alive() > 0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let keep_alive = (f64::from(packet.keep_alive()) * 1.5) as u64;
            self.config.set_keep_alive(keep_alive);
        }

        let username = if packet.connect_flags().has_username() {
            Some(packet.username().to_string())
        } else {
            None
        };
        if !self
            .ctx
            .permission
            .check(packet.client_id(), username.as_deref(), Action::Connect, "")
            .await
        {
            let ack_packet = ConnectAckPacket::new(false, ConnectReturnCode::MalformedUsernamePassword);
            self.send(ack_packet).await?;
            return self.send_disconnect().await;
        }

        let client_id = packet.client_id().to_string();

        // Enforce single ownership of this client id across the cluster:
        // evict the previous owner (local or remote) before we claim it.
        let decision = eviction::resolve(self.ctx.session_store.as_ref(), self.ctx.cluster_router.as_ref(), &client_id)
            .await
            .unwrap_or(EvictionRequest::None);
        match &decision {
            EvictionRequest::Local => {
                self.ctx.kick(&client_id).await;
            }
            EvictionRequest::Remote(_) => {
                if let Err(err) = eviction::apply(self.ctx.cluster_router.as_ref(), &decision, &client_id).await {
                    log::error!("session: failed to evict remote owner of {client_id}: {err:?}");
                }
            }
            EvictionRequest::None => {}
        }

        // A prior connection for this client id, local or remote, may still
        // be unwinding concurrently with this one; clear its subscriber
        // entries here rather than relying on the evicted session's own
        // teardown to race against the restore below.
        self.ctx.subscription_trie.write().await.remove_all(&client_id);

        let clean_session = packet.connect_flags().clean_session();
        let prior_existed = !clean_session
            && self
                .ctx
                .session_store
                .get_session(&client_id)
                .await
                .ok()
                .flatten()
                .is_some();
        let stored = self
            .ctx
            .session_store
            .create_session(&client_id, &self.node_id, clean_session, now_ms())
            .await?;
        let session_present = prior_existed;

        if !clean_session && !stored.subscriptions.is_empty() {
            let mut trie = self.ctx.subscription_trie.write().await;
            for (filter, qos) in &stored.subscriptions {
                let _ = trie.add(client_id.clone(), filter, *qos);
            }
        }

        if packet.connect_flags().will() {
            self.will = Some(WillMessage {
                topic: packet.will_topic().unwrap_or_default().to_string(),
                payload: packet.will_message().to_vec(),
                qos: packet.connect_flags().will_qos(),
                retain: packet.connect_flags().will_retain(),
            });
        }

        self.client_id = client_id.clone();
        self.username = username;
        self.clean_session = clean_session;
        self.status = Status::Connected;

        let ttl_secs = self.config.keep_alive().saturating_mul(2).max(60);
        if let Err(err) = self.ctx.session_store.set_client_node(&client_id, &self.node_id, ttl_secs).await {
            log::error!("session: failed to record ownership of {client_id}: {err:?}");
        }

        self.ctx.register(client_id, self.command_sender.clone()).await;

        let ack_packet = ConnectAckPacket::new(session_present, ConnectReturnCode::Accepted);
        self.send(ack_packet).await
    }

    async fn on_client_ping(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let _packet = PingRequestPacket::decode(&mut ba)?;
        self.send(PingResponsePacket::new()).await
    }

    async fn on_client_publish(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = PublishPacket::decode(&mut ba)?;

        if packet.qos() == QoS::ExactOnce && packet.dup() && self.pub_recv_packets.contains(&packet.packet_id()) {
            let ack_packet = PublishReceivedPacket::new(packet.packet_id());
            return self.send(ack_packet).await;
        }

        let allowed = self
            .ctx
            .permission
            .check(&self.client_id, self.username.as_deref(), Action::Publish, packet.topic())
            .await;
        if !allowed {
            log::warn!("session: publish to {} denied for {}", packet.topic(), self.client_id);
        }

        match packet.qos() {
            QoS::AtMostOnce => {
                if allowed {
                    self.ctx.handle_publish(&self.client_id, &packet).await;
                }
            }
            QoS::AtLeastOnce => {
                let ack_packet = codec::v3::PublishAckPacket::new(packet.packet_id());
                self.send(ack_packet).await?;
                if allowed {
                    self.ctx.handle_publish(&self.client_id, &packet).await;
                }
            }
            QoS::ExactOnce => {
                self.pub_recv_packets.insert(packet.packet_id());
                let ack_packet = PublishReceivedPacket::new(packet.packet_id());
                self.send(ack_packet).await?;
                if allowed {
                    self.ctx.handle_publish(&self.client_id, &packet).await;
                }
            }
        }
        Ok(())
    }

    async fn on_client_publish_release(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = match PublishReleasePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(DecodeError::InvalidPacketFlags) => {
                // Bits 3-0 of PUBREL's fixed header are reserved as
                // 0,0,1,0 [MQTT-3.6.1-1].
                return self.send_disconnect().await;
            }
            Err(err) => return Err(err.into()),
        };

        if self.pub_recv_packets.remove(&packet.packet_id()) {
            let ack_packet = PublishCompletePacket::new(packet.packet_id());
            self.send(ack_packet).await
        } else {
            log::warn!("session: PUBREL for unknown packet id {}", packet.packet_id());
            Ok(())
        }
    }

    async fn on_client_publish_ack(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = codec::v3::PublishAckPacket::decode(&mut ba)?;
        self.pending.remove(&packet.packet_id());
        Ok(())
    }

    async fn on_client_publish_received(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = PublishReceivedPacket::decode(&mut ba)?;
        // QoS 2 outbound flow: stop retrying the original PUBLISH, wait for
        // PUBCOMP after we emit PUBREL.
        self.pending.remove(&packet.packet_id());
        let release_packet = PublishReleasePacket::new(packet.packet_id());
        self.send(release_packet).await
    }

    async fn on_client_publish_complete(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = PublishCompletePacket::decode(&mut ba)?;
        self.pending.remove(&packet.packet_id());
        Ok(())
    }

    async fn on_client_subscribe(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = match SubscribePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(DecodeError::InvalidPacketFlags | DecodeError::EmptyTopicFilter | DecodeError::InvalidQoS) => {
                // [MQTT-3.8.1-1] reserved flags, [MQTT-3.8.3-3] empty
                // payload, [MQTT-3.8.3-4] invalid granted QoS: all close
                // the connection.
                return self.send_disconnect().await;
            }
            Err(err) => return Err(err.into()),
        };

        let packet_id = packet.packet_id();
        let mut acks = Vec::with_capacity(packet.topics().len());
        let mut granted = Vec::with_capacity(packet.topics().len());
        for topic in packet.topics() {
            let allowed = self
                .ctx
                .permission
                .check(&self.client_id, self.username.as_deref(), Action::Subscribe, topic.topic())
                .await;
            if !allowed {
                acks.push(SubscribeAck::Failed);
                continue;
            }
            let qos = std::cmp::min(topic.qos(), self.config.maximum_qos());
            let mut trie = self.ctx.subscription_trie.write().await;
            match trie.add(self.client_id.clone(), topic.topic(), qos) {
                Ok(()) => {
                    drop(trie);
                    acks.push(SubscribeAck::QoS(qos));
                    granted.push((topic.topic().to_string(), qos));
                }
                Err(err) => {
                    log::warn!("session: rejecting malformed filter {}: {err:?}", topic.topic());
                    acks.push(SubscribeAck::Failed);
                }
            }
        }

        let ack_packet = SubscribeAckPacket::with_vec(packet_id, acks);
        self.send(ack_packet).await?;

        self.persist_subscriptions().await;
        for (filter, qos) in granted {
            self.ctx.replay_retained(&self.client_id, &filter, qos).await;
        }
        Ok(())
    }

    async fn on_client_unsubscribe(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = match UnsubscribePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(DecodeError::InvalidPacketFlags) => {
                // [MQTT-3.14.1-1]: reserved bits must be zero.
                return self.send_disconnect().await;
            }
            Err(err) => return Err(err.into()),
        };

        {
            let mut trie = self.ctx.subscription_trie.write().await;
            for topic in packet.topics() {
                trie.remove(&self.client_id, topic.as_ref());
            }
        }
        self.persist_subscriptions().await;

        let ack_packet = UnsubscribeAckPacket::new(packet.packet_id());
        self.send(ack_packet).await
    }

    async fn on_client_disconnect(&mut self, _buf: &[u8]) -> Result<(), Error> {
        // A clean DISCONNECT discards the will message [MQTT-3.1.2-10].
        self.will = None;
        self.status = Status::Closing;
        self.finish_session().await;
        self.status = Status::Closed;
        Ok(())
    }

    async fn persist_subscriptions(&self) {
        if self.client_id.is_empty() {
            return;
        }
        if let Ok(Some(mut session)) = self.ctx.session_store.get_session(&self.client_id).await {
            let current = self.ctx.subscription_trie.read().await.subscriptions_of(&self.client_id);
            session.subscriptions = current.into_iter().collect();
            if let Err(err) = self.ctx.session_store.update_session(&session).await {
                log::error!("session: failed to persist subscriptions for {}: {err:?}", self.client_id);
            }
        }
    }
}
