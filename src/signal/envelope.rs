//! Wire messages for the ratchet and the `<enc>` node that carries them.

use crate::binary::Node;
use crate::{Error, Result};
use prost::Message;
use rand::Rng;

/// Version byte prefixed to every serialized ratchet message.
pub const MESSAGE_VERSION: u8 = 0x33;

#[derive(Clone, PartialEq, Message)]
pub struct SignalMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub ratchet_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub counter: u32,
    #[prost(uint32, tag = "3")]
    pub previous_counter: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PreKeySignalMessage {
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: Option<u32>,
    #[prost(bytes = "vec", tag = "2")]
    pub base_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub identity_key: Vec<u8>,
    /// Serialized inner [`SignalMessage`], version byte included.
    #[prost(bytes = "vec", tag = "4")]
    pub message: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub registration_id: u32,
    #[prost(uint32, tag = "6")]
    pub signed_pre_key_id: u32,
}

/// Prefix the version byte onto an encoded message.
pub(crate) fn serialize<M: Message>(msg: &M) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + msg.encoded_len());
    out.push(MESSAGE_VERSION);
    out.extend_from_slice(&msg.encode_to_vec());
    out
}

pub(crate) fn deserialize<M: Message + Default>(data: &[u8]) -> Result<M> {
    match data.split_first() {
        Some((&MESSAGE_VERSION, body)) => M::decode(body)
            .map_err(|e| Error::ProtocolViolation(format!("ratchet message: {}", e))),
        Some((v, _)) => Err(Error::ProtocolViolation(format!(
            "unsupported ratchet message version {:#x}",
            v
        ))),
        None => Err(Error::ProtocolViolation("empty ratchet message".into())),
    }
}

/// Whether an envelope establishes a session or continues one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    PreKey,
    Message,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreKey => "pkmsg",
            Self::Message => "msg",
        }
    }
}

/// Encrypted payload for one recipient device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherEnvelope {
    pub kind: EnvelopeKind,
    pub data: Vec<u8>,
}

impl CipherEnvelope {
    pub fn to_node(&self) -> Node {
        Node::new("enc")
            .with_attr("v", 2)
            .with_attr("type", self.kind.as_str())
            .with_content(self.data.clone())
    }

    pub fn from_node(node: &Node) -> Result<Self> {
        let kind = match node.require_attr("type")? {
            "pkmsg" => EnvelopeKind::PreKey,
            "msg" => EnvelopeKind::Message,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unsupported enc type {}",
                    other
                )))
            }
        };
        let data = node
            .bytes()
            .ok_or_else(|| Error::ProtocolViolation("<enc> without payload".into()))?
            .to_vec();
        Ok(Self { kind, data })
    }
}

/// Append 1..=15 bytes of padding, each holding the padding length.
pub fn pad_message(plaintext: &[u8]) -> Vec<u8> {
    let n: u8 = rand::thread_rng().gen_range(1..=15);
    let mut out = Vec::with_capacity(plaintext.len() + n as usize);
    out.extend_from_slice(plaintext);
    out.resize(plaintext.len() + n as usize, n);
    out
}

pub fn unpad_message(padded: &[u8]) -> Result<&[u8]> {
    let n = *padded
        .last()
        .ok_or_else(|| Error::ProtocolViolation("empty padded message".into()))? as usize;
    if n == 0 || n > padded.len() {
        return Err(Error::ProtocolViolation(format!(
            "invalid padding length {}",
            n
        )));
    }
    Ok(&padded[..padded.len() - n])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_byte_enforced() {
        let msg = SignalMessage {
            ratchet_key: vec![1; 32],
            counter: 4,
            previous_counter: 2,
            ciphertext: vec![9; 20],
        };
        let data = serialize(&msg);
        assert_eq!(data[0], MESSAGE_VERSION);
        assert_eq!(deserialize::<SignalMessage>(&data).unwrap(), msg);

        let mut bad = data.clone();
        bad[0] = 0x22;
        assert!(deserialize::<SignalMessage>(&bad).is_err());
        assert!(deserialize::<SignalMessage>(&[]).is_err());
    }

    #[test]
    fn enc_node_roundtrip() {
        let env = CipherEnvelope {
            kind: EnvelopeKind::PreKey,
            data: vec![1, 2, 3],
        };
        let node = env.to_node();
        assert_eq!(node.attr("type"), Some("pkmsg"));
        assert_eq!(CipherEnvelope::from_node(&node).unwrap(), env);
        assert!(CipherEnvelope::from_node(&Node::new("enc").with_attr("type", "skmsg")).is_err());
    }

    #[test]
    fn padding() {
        for _ in 0..32 {
            let padded = pad_message(b"abc");
            assert!(padded.len() > 3 && padded.len() <= 18);
            assert_eq!(unpad_message(&padded).unwrap(), b"abc");
        }
        assert!(unpad_message(&[]).is_err());
        assert!(unpad_message(&[1, 0]).is_err());
        assert!(unpad_message(&[9, 9]).is_err());
    }
}
