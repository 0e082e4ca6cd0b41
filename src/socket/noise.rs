//! Noise protocol handshake and transport (WhatsApp: XX_25519_AESGCM_SHA256).

use crate::binary::WA_CONN_HEADER;
use crate::error::{ConnectionError, Error};
use crate::transport::{FrameSource, Transport};
use crate::Result;
use async_trait::async_trait;
use prost::Message;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::payload::{decode_client_payload, ClientPayload};

/// Noise pattern used by WhatsApp Web.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_AESGCM_SHA256";

/// Largest Noise message (ciphertext) snow accepts.
const NOISE_MAX_MSG: usize = 65535;
const TAG_LEN: usize = 16;

fn handshake_err(stage: &str, e: impl std::fmt::Display) -> Error {
    Error::Connection(ConnectionError::HandshakeFailed(format!("{}: {}", stage, e)))
}

fn builder(static_private: &[u8; 32]) -> Result<snow::Builder<'_>> {
    let params: snow::params::NoiseParams = NOISE_PATTERN
        .parse()
        .map_err(|e: snow::Error| handshake_err("noise params", e))?;
    snow::Builder::new(params)
        .prologue(&WA_CONN_HEADER)
        .map_err(|e| handshake_err("noise prologue", e))?
        .local_private_key(static_private)
        .map_err(|e| handshake_err("noise static key", e))
}

/// Run the Noise XX handshake as initiator.
/// First frame sent is: WA header + first handshake message. The third message
/// carries the encoded client payload.
/// Returns Noise transport and recv halves plus the server's static key.
pub async fn run_client_handshake(
    send: Arc<dyn Transport>,
    mut recv: Box<dyn FrameSource>,
    static_private: &[u8; 32],
    payload: &ClientPayload,
) -> Result<(NoiseTransport, NoiseRecv, Vec<u8>)> {
    let mut handshake = builder(static_private)?
        .build_initiator()
        .map_err(|e| handshake_err("noise build", e))?;

    // XX: initiator sends e
    let mut msg_buf = vec![0u8; NOISE_MAX_MSG];
    let len = handshake
        .write_message(&[], &mut msg_buf)
        .map_err(|e| handshake_err("noise write e", e))?;
    let mut first_frame = WA_CONN_HEADER.to_vec();
    first_frame.extend_from_slice(&msg_buf[..len]);
    send.send(&first_frame).await?;

    // XX: read e, ee, s, es from server
    let frame2 = recv.next_frame().await?;
    let mut payload_buf = vec![0u8; NOISE_MAX_MSG];
    handshake
        .read_message(&frame2, &mut payload_buf)
        .map_err(|e| handshake_err("noise read server hello", e))?;
    let server_static = handshake
        .get_remote_static()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| handshake_err("noise", "server sent no static key"))?;

    // XX: initiator sends s, se with the client payload
    let len2 = handshake
        .write_message(&payload.encode_to_vec(), &mut msg_buf)
        .map_err(|e| handshake_err("noise write finish", e))?;
    send.send(&msg_buf[..len2]).await?;

    let state = handshake
        .into_transport_mode()
        .map_err(|e| handshake_err("noise transport", e))?;
    debug!("noise handshake complete");
    let (tx, rx) = split(state, send, recv);
    Ok((tx, rx, server_static))
}

/// Responder side of the handshake, for in-process servers.
/// Returns the transport halves and the client's payload.
pub async fn respond_handshake(
    send: Arc<dyn Transport>,
    mut recv: Box<dyn FrameSource>,
    static_private: &[u8; 32],
) -> Result<(NoiseTransport, NoiseRecv, ClientPayload)> {
    let mut handshake = builder(static_private)?
        .build_responder()
        .map_err(|e| handshake_err("noise build", e))?;
    let mut buf = vec![0u8; NOISE_MAX_MSG];
    let mut out = vec![0u8; NOISE_MAX_MSG];

    let first = recv.next_frame().await?;
    let hello = first
        .strip_prefix(&WA_CONN_HEADER[..])
        .ok_or_else(|| handshake_err("noise", "missing connection header"))?;
    handshake
        .read_message(hello, &mut buf)
        .map_err(|e| handshake_err("noise read client hello", e))?;

    let len = handshake
        .write_message(&[], &mut out)
        .map_err(|e| handshake_err("noise write server hello", e))?;
    send.send(&out[..len]).await?;

    let finish = recv.next_frame().await?;
    let payload_len = handshake
        .read_message(&finish, &mut buf)
        .map_err(|e| handshake_err("noise read finish", e))?;
    let payload = decode_client_payload(&buf[..payload_len])?;

    let state = handshake
        .into_transport_mode()
        .map_err(|e| handshake_err("noise transport", e))?;
    let (tx, rx) = split(state, send, recv);
    Ok((tx, rx, payload))
}

fn split(
    state: snow::TransportState,
    send: Arc<dyn Transport>,
    recv: Box<dyn FrameSource>,
) -> (NoiseTransport, NoiseRecv) {
    let state = Arc::new(Mutex::new(state));
    (
        NoiseTransport {
            inner: send,
            state: Arc::clone(&state),
        },
        NoiseRecv { inner: recv, state },
    )
}

/// Transport that encrypts payloads with Noise before sending over the framed link.
pub struct NoiseTransport {
    inner: Arc<dyn Transport>,
    state: Arc<Mutex<snow::TransportState>>,
}

impl NoiseTransport {
    /// Send encrypted payload (Noise transport encrypt then frame).
    pub async fn send_encrypted(&self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() + TAG_LEN > NOISE_MAX_MSG {
            return Err(Error::Binary(format!(
                "noise payload of {} bytes too large",
                plaintext.len()
            )));
        }
        let mut ciphertext = vec![0u8; plaintext.len() + TAG_LEN];
        // encrypt and send under one lock so frames leave in nonce order
        let mut st = self.state.lock().await;
        let len = st
            .write_message(plaintext, &mut ciphertext)
            .map_err(|e| Error::Connection(ConnectionError::WebSocket(format!("noise encrypt: {}", e))))?;
        ciphertext.truncate(len);
        self.inner.send(&ciphertext).await
    }
}

#[async_trait]
impl Transport for NoiseTransport {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_encrypted(data).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Receive half: read framed message then decrypt with Noise.
pub struct NoiseRecv {
    inner: Box<dyn FrameSource>,
    state: Arc<Mutex<snow::TransportState>>,
}

impl NoiseRecv {
    /// Read next frame and decrypt. Returns the plaintext.
    pub async fn next_decrypted_frame(&mut self) -> Result<Vec<u8>> {
        let ciphertext = self.inner.next_frame().await?;
        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = {
            let mut st = self.state.lock().await;
            st.read_message(&ciphertext, &mut plaintext).map_err(|e| {
                Error::ProtocolViolation(format!("noise decrypt: {}", e))
            })?
        };
        plaintext.truncate(len);
        Ok(plaintext)
    }
}

#[async_trait]
impl FrameSource for NoiseRecv {
    async fn next_frame(&mut self) -> Result<Vec<u8>> {
        self.next_decrypted_frame().await
    }
}
