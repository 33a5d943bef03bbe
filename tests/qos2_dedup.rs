// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Drives a real `ClientSession` over a loopback socket with hand-built
//! packet bytes to confirm [MQTT-4.3.3-2]: a duplicate `QoS` 2 `PUBLISH`
//! (DUP set, packet id already seen) gets its cached `PUBREC` resent
//! without re-running the publish pipeline. A subscriber on a second
//! connection must see the message delivered exactly once.

use std::sync::Arc;
use std::time::Duration;

use codec::v3::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribeAckPacket, SubscribePacket,
};
use codec::{ByteArray, DecodePacket, EncodePacket, PacketId, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use dynamq::config::Config;
use dynamq::context::BrokerContext;
use dynamq::session::{ClientSession, SessionConfig};
use dynamq::stream::Stream;

async fn send<P: EncodePacket>(stream: &mut TcpStream, packet: &P) {
    let mut buf = Vec::new();
    packet.encode(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
}

/// Reads whatever bytes arrive from one socket read, mirroring the single
/// `read_buf`-per-iteration shape of `ClientSession::run_loop` itself.
async fn recv(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0_u8; 2048];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("timed out waiting for a reply")
        .unwrap();
    assert!(n > 0, "peer closed the connection unexpectedly");
    buf.truncate(n);
    buf
}

async fn no_more_data(stream: &mut TcpStream) {
    let mut buf = [0_u8; 64];
    let result = timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    assert!(result.is_err(), "expected no further bytes, but more arrived");
}

async fn connect(stream: &mut TcpStream, client_id: &str) {
    let packet = ConnectPacket::new(client_id).unwrap();
    send(stream, &packet).await;
    let buf = recv(stream).await;
    let ack = ConnectAckPacket::decode(&mut ByteArray::new(&buf)).unwrap();
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
}

#[tokio::test]
async fn test_duplicate_qos2_publish_resends_cached_pubrec_without_redelivery() {
    let ctx = Arc::new(BrokerContext::new_standalone(Config::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let session_config = SessionConfig::new(0, 0, true, QoS::ExactOnce, 16);
    {
        let ctx = Arc::clone(&ctx);
        let session_config = session_config.clone();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (tcp_stream, _addr) = listener.accept().await.unwrap();
                let stream = Stream::Mqtt(tcp_stream);
                let session = ClientSession::new(Arc::clone(&ctx), session_config.clone(), stream, "node-test".to_string());
                tokio::spawn(session.run_loop());
            }
        });
    }

    let mut subscriber = TcpStream::connect(addr).await.unwrap();
    connect(&mut subscriber, "subscriber-1").await;
    send(&mut subscriber, &SubscribePacket::new("qos2/topic", QoS::ExactOnce, PacketId::new(1)).unwrap()).await;
    let buf = recv(&mut subscriber).await;
    let _suback = SubscribeAckPacket::decode(&mut ByteArray::new(&buf)).unwrap();

    let mut publisher = TcpStream::connect(addr).await.unwrap();
    connect(&mut publisher, "publisher-1").await;

    let packet_id = PacketId::new(7);
    let mut publish = PublishPacket::new("qos2/topic", QoS::ExactOnce, b"hello qos2").unwrap();
    publish.set_packet_id(packet_id);
    send(&mut publisher, &publish).await;

    let buf = recv(&mut publisher).await;
    let first_pubrec = PublishReceivedPacket::decode(&mut ByteArray::new(&buf)).unwrap();
    assert_eq!(first_pubrec.packet_id(), packet_id);

    // Retransmit the identical PUBLISH with DUP set, as a client would if
    // it never saw the first PUBREC. The session must recognise the
    // packet id is already pending and resend PUBREC without calling
    // into the publish pipeline a second time.
    publish.set_dup(true).unwrap();
    send(&mut publisher, &publish).await;
    let buf = recv(&mut publisher).await;
    let second_pubrec = PublishReceivedPacket::decode(&mut ByteArray::new(&buf)).unwrap();
    assert_eq!(second_pubrec.packet_id(), packet_id);

    send(&mut publisher, &PublishReleasePacket::new(packet_id)).await;
    let buf = recv(&mut publisher).await;
    let pubcomp = PublishCompletePacket::decode(&mut ByteArray::new(&buf)).unwrap();
    assert_eq!(pubcomp.packet_id(), packet_id);

    // Exactly one delivery must reach the subscriber, even though the
    // publisher sent the PUBLISH twice.
    let buf = recv(&mut subscriber).await;
    let delivered = PublishPacket::decode(&mut ByteArray::new(&buf)).unwrap();
    assert_eq!(delivered.topic(), "qos2/topic");
    assert_eq!(delivered.message(), b"hello qos2");

    no_more_data(&mut subscriber).await;
}
