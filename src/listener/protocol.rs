// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Each listener binds to exactly one socket and, for the TLS variants,
/// carries the acceptor that terminates the handshake.
pub enum Protocol {
    Mqtt(TcpListener),
    Mqtts(TcpListener, TlsAcceptor),
    Ws(TcpListener),
    Wss(TcpListener, TlsAcceptor),
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Mqtt(..) => "Mqtt",
            Self::Mqtts(..) => "Mqtts",
            Self::Ws(..) => "Ws",
            Self::Wss(..) => "Wss",
        };
        write!(f, "{msg}")
    }
}
