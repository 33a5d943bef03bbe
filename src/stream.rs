// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Transport abstraction so the session loop is agnostic to which of the
//! wire protocols named in the external interfaces (plain TCP, TLS,
//! WebSocket) carries a given connection. QUIC, present in the teacher's
//! dependency set, is out of scope here and was dropped in the trim pass.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

use crate::error::Error;

/// Each `Stream` represents a duplex socket connection to a client.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
    Ws(Box<WebSocketStream<TcpStream>>),
    Wss(Box<WebSocketStream<TlsStream<TcpStream>>>),
}

impl Stream {
    /// Reads the next chunk of data, appending it to `buf`.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying socket/stream fails.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.read_buf(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.read_buf(buf).await?),
            Self::Ws(ws_stream) => Self::read_ws_frame(ws_stream.as_mut(), buf).await,
            Self::Wss(wss_stream) => Self::read_ws_frame(wss_stream.as_mut(), buf).await,
        }
    }

    async fn read_ws_frame<S>(stream: &mut WebSocketStream<S>, buf: &mut Vec<u8>) -> Result<usize, Error>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match stream.next().await {
            Some(msg) => {
                let data = msg?.into_data();
                let data_len = data.len();
                buf.extend(data);
                Ok(data_len)
            }
            None => Ok(0),
        }
    }

    /// Writes a full encoded packet to the transport.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying socket/stream fails.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.write(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.write(buf).await?),
            Self::Ws(ws_stream) => {
                ws_stream.send(Message::binary(buf)).await?;
                Ok(buf.len())
            }
            Self::Wss(wss_stream) => {
                wss_stream.send(Message::binary(buf)).await?;
                Ok(buf.len())
            }
        }
    }
}
