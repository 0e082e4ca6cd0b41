//! Socket layer: length-prefixed framing and the Noise handshake.
//!
//! Each frame is: 3-byte big-endian length (max 16MiB) then payload.
//! The websocket connector requires the `full` feature; the Noise layer runs
//! over any [`Transport`](crate::transport::Transport) and
//! [`FrameSource`](crate::transport::FrameSource).

#[cfg(feature = "full")]
mod framed;
mod noise;
mod payload;
#[cfg(feature = "full")]
mod ws;

#[cfg(feature = "full")]
pub use framed::{FramedRecv, FramedSend};
pub use noise::{respond_handshake, run_client_handshake, NoiseRecv, NoiseTransport, NOISE_PATTERN};
pub use payload::{
    client_payload, ClientPayload, DevicePairingRegistrationData, UserAgent, WebInfo,
};
#[cfg(feature = "full")]
pub use ws::WsConnector;

use crate::{Error, Result};

/// Maximum frame body size (3-byte length = 2^24 - 1).
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// Writes a 3-byte big-endian length prefix.
#[inline]
pub fn write_frame_len(buf: &mut [u8; 3], len: usize) {
    buf[0] = (len >> 16) as u8;
    buf[1] = (len >> 8) as u8;
    buf[2] = len as u8;
}

/// Reads a 3-byte big-endian length.
#[inline]
pub fn read_frame_len(buf: &[u8; 3]) -> usize {
    ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | (buf[2] as usize)
}

/// Length prefix + body.
pub fn encode_frame(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(Error::Binary(format!("frame of {} bytes too large", data.len())));
    }
    let mut len = [0u8; 3];
    write_frame_len(&mut len, data.len());
    let mut out = Vec::with_capacity(3 + data.len());
    out.extend_from_slice(&len);
    out.extend_from_slice(data);
    Ok(out)
}

/// Body of one complete frame. The length prefix must match exactly.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8]> {
    let Some((len, body)) = frame.split_first_chunk::<3>() else {
        return Err(Error::Binary("frame too short".into()));
    };
    let len = read_frame_len(len);
    if body.len() != len {
        return Err(Error::Binary(format!(
            "frame length mismatch: header {} body {}",
            len,
            body.len()
        )));
    }
    Ok(body)
}
