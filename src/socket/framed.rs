//! Length-prefixed framing over WebSocket.
//! Each WebSocket binary message = one frame: 3-byte BE length + payload.

use crate::error::{ConnectionError, Error};
use crate::transport::{FrameSource, Transport};
use crate::Result;
use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use super::{decode_frame, encode_frame};

pub(crate) type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn ws_err(e: impl std::fmt::Display) -> Error {
    Error::Connection(ConnectionError::WebSocket(e.to_string()))
}

/// Send half of a framed WebSocket: implements Transport.
pub struct FramedSend {
    writer: Mutex<SplitSink<WsStream, Message>>,
}

impl FramedSend {
    pub(crate) fn new(writer: SplitSink<WsStream, Message>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Transport for FramedSend {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let msg = encode_frame(data)?;
        self.writer
            .lock()
            .await
            .send(Message::Binary(msg))
            .await
            .map_err(ws_err)
    }

    async fn close(&self) -> Result<()> {
        self.writer.lock().await.close().await.map_err(ws_err)
    }
}

/// Receive half: each WebSocket binary message is one frame; returns the body only.
pub struct FramedRecv {
    reader: SplitStream<WsStream>,
}

impl FramedRecv {
    pub(crate) fn new(reader: SplitStream<WsStream>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl FrameSource for FramedRecv {
    async fn next_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            let msg = self
                .reader
                .next()
                .await
                .ok_or(Error::Connection(ConnectionError::Disconnected))?
                .map_err(ws_err)?;
            match msg {
                Message::Binary(data) => return Ok(decode_frame(&data)?.to_vec()),
                Message::Close(_) => return Err(Error::Connection(ConnectionError::Disconnected)),
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => return Err(Error::ProtocolViolation("expected binary websocket frame".into())),
            }
        }
    }
}
