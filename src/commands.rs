// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v3::{ConnectAckPacket, PublishPacket, SubscribeAckPacket, UnsubscribeAckPacket};

/// Sent from the `Listener`/dispatch path down to a specific `Session` actor.
#[derive(Debug, Clone)]
pub enum ListenerToSessionCmd {
    /// Deliver a `CONNACK` in response to this session's `CONNECT`.
    ConnectAck(ConnectAckPacket),

    /// Deliver a matched `PUBLISH` to this subscriber.
    Publish(PublishPacket),

    /// Deliver a `SUBACK`/`UNSUBACK` in response to a pending request.
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(UnsubscribeAckPacket),

    /// Forcibly close this session; it has been superseded by a newer
    /// connection using the same `ClientId`.
    Kick,
}
