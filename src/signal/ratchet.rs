//! X3DH session setup and the double ratchet.
//!
//! A [`SessionRecord`] is mutated in place by `encrypt` and `decrypt`. Callers that
//! must not lose state on failure work on a clone and keep it only on success.

use super::crypto::{aes_gcm_open, aes_gcm_seal, hkdf, hmac_sha256, GCM_NONCE_LEN};
use super::envelope::{self, PreKeySignalMessage, SignalMessage};
use super::keys::{IdentityKey, IdentityKeyPair, KeyPair, PreKeyBundle};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const ROOT_INFO: &[u8] = b"WhisperText";
const RATCHET_INFO: &[u8] = b"WhisperRatchet";
const MESSAGE_KEY_INFO: &[u8] = b"WhisperMessageKeys";
const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Chain {
    key: [u8; 32],
    index: u32,
}

impl Chain {
    /// Message key for the current index; advances the chain.
    fn step(&mut self) -> Result<[u8; 32]> {
        let message_key = hmac_sha256(&self.key, &[MESSAGE_KEY_SEED])?;
        self.key = hmac_sha256(&self.key, &[CHAIN_KEY_SEED])?;
        self.index += 1;
        Ok(message_key)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SkippedKey {
    ratchet: [u8; 32],
    index: u32,
    message_key: [u8; 32],
}

/// Set until the peer answers, so every outgoing message can bootstrap their side.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PendingPreKey {
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: [u8; 32],
}

/// Ratchet state for one peer device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub remote_identity: IdentityKey,
    pub remote_registration_id: u32,
    /// Base key of the X3DH exchange that created this session.
    pub base_key: [u8; 32],
    root_key: [u8; 32],
    local_ratchet: KeyPair,
    remote_ratchet: Option<[u8; 32]>,
    sending: Option<Chain>,
    receiving: Option<Chain>,
    previous_counter: u32,
    skipped: VecDeque<SkippedKey>,
    pending_prekey: Option<PendingPreKey>,
    local_registration_id: u32,
}

fn x3dh_secret(dhs: &[[u8; 32]]) -> Result<[u8; 32]> {
    let mut ikm = Vec::with_capacity(32 * (dhs.len() + 1));
    ikm.extend_from_slice(&[0xFF; 32]);
    for dh in dhs {
        ikm.extend_from_slice(dh);
    }
    hkdf::<32>(Some(&[0u8; 32]), &ikm, ROOT_INFO)
}

/// Root step: new root key and chain key from a ratchet agreement.
fn root_step(root: &[u8; 32], dh: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let okm = hkdf::<64>(Some(root), dh, RATCHET_INFO)?;
    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    Ok((next_root, chain))
}

/// AES key and nonce derived from a message key.
fn message_cipher(message_key: &[u8; 32]) -> Result<([u8; 32], [u8; GCM_NONCE_LEN])> {
    let okm = hkdf::<44>(None, message_key, MESSAGE_KEY_INFO)?;
    let mut key = [0u8; 32];
    let mut nonce = [0u8; GCM_NONCE_LEN];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    Ok((key, nonce))
}

fn associated_data(sender: &IdentityKey, receiver: &IdentityKey, ratchet: &[u8], counter: u32, previous: u32) -> Vec<u8> {
    let mut ad = Vec::with_capacity(32 * 3 + 8);
    ad.extend_from_slice(&sender.agreement);
    ad.extend_from_slice(&receiver.agreement);
    ad.extend_from_slice(ratchet);
    ad.extend_from_slice(&counter.to_be_bytes());
    ad.extend_from_slice(&previous.to_be_bytes());
    ad
}

pub(super) fn key32(b: &[u8], what: &str) -> Result<[u8; 32]> {
    b.try_into()
        .map_err(|_| Error::ProtocolViolation(format!("{} must be 32 bytes, got {}", what, b.len())))
}

impl SessionRecord {
    /// Start a session as initiator from the peer's published bundle.
    pub fn initiate(local: &IdentityKeyPair, local_registration_id: u32, bundle: &PreKeyBundle) -> Result<Self> {
        if !bundle.verify_signature() {
            return Err(Error::ProtocolViolation("invalid signed prekey signature".into()));
        }
        let base = KeyPair::generate();
        let mut dhs = vec![
            local.agreement.dh(&bundle.signed_prekey)?,
            base.dh(&bundle.identity.agreement)?,
            base.dh(&bundle.signed_prekey)?,
        ];
        if let Some(prekey) = &bundle.prekey {
            dhs.push(base.dh(&prekey.public)?);
        }
        let secret = x3dh_secret(&dhs)?;

        let local_ratchet = KeyPair::generate();
        let (root_key, chain_key) = root_step(&secret, &local_ratchet.dh(&bundle.signed_prekey)?)?;
        Ok(Self {
            remote_identity: bundle.identity,
            remote_registration_id: bundle.registration_id,
            base_key: base.public,
            root_key,
            local_ratchet,
            remote_ratchet: Some(bundle.signed_prekey),
            sending: Some(Chain { key: chain_key, index: 0 }),
            receiving: None,
            previous_counter: 0,
            skipped: VecDeque::new(),
            pending_prekey: Some(PendingPreKey {
                pre_key_id: bundle.prekey.map(|p| p.id),
                signed_pre_key_id: bundle.signed_prekey_id,
                base_key: base.public,
            }),
            local_registration_id,
        })
    }

    /// Accept a session as responder from the initiator's first message.
    pub fn respond(
        local: &IdentityKeyPair,
        local_registration_id: u32,
        signed_prekey: &KeyPair,
        one_time_prekey: Option<&KeyPair>,
        remote_identity: IdentityKey,
        remote_registration_id: u32,
        their_base: [u8; 32],
    ) -> Result<Self> {
        let mut dhs = vec![
            signed_prekey.dh(&remote_identity.agreement)?,
            local.agreement.dh(&their_base)?,
            signed_prekey.dh(&their_base)?,
        ];
        if let Some(prekey) = one_time_prekey {
            dhs.push(prekey.dh(&their_base)?);
        }
        Ok(Self {
            remote_identity,
            remote_registration_id,
            base_key: their_base,
            root_key: x3dh_secret(&dhs)?,
            local_ratchet: signed_prekey.clone(),
            remote_ratchet: None,
            sending: None,
            receiving: None,
            previous_counter: 0,
            skipped: VecDeque::new(),
            pending_prekey: None,
            local_registration_id,
        })
    }

    /// Whether outgoing messages still carry the prekey header.
    pub fn has_pending_prekey(&self) -> bool {
        self.pending_prekey.is_some()
    }

    /// Encrypt one message. Returns the serialized wire message and whether it is a prekey message.
    pub fn encrypt(&mut self, local: &IdentityKey, plaintext: &[u8]) -> Result<(Vec<u8>, bool)> {
        let chain = self
            .sending
            .as_mut()
            .ok_or_else(|| Error::SessionMismatch("session has no sending chain".into()))?;
        let counter = chain.index;
        let message_key = chain.step()?;
        let ratchet = self.local_ratchet.public;
        let ad = associated_data(local, &self.remote_identity, &ratchet, counter, self.previous_counter);
        let (key, nonce) = message_cipher(&message_key)?;
        let inner = SignalMessage {
            ratchet_key: ratchet.to_vec(),
            counter,
            previous_counter: self.previous_counter,
            ciphertext: aes_gcm_seal(&key, &nonce, plaintext, &ad)?,
        };
        let inner = envelope::serialize(&inner);

        match &self.pending_prekey {
            Some(pending) => {
                let outer = PreKeySignalMessage {
                    pre_key_id: pending.pre_key_id,
                    base_key: pending.base_key.to_vec(),
                    identity_key: local.to_bytes(),
                    message: inner,
                    registration_id: self.local_registration_id,
                    signed_pre_key_id: pending.signed_pre_key_id,
                };
                Ok((envelope::serialize(&outer), true))
            }
            None => Ok((inner, false)),
        }
    }

    /// Decrypt one serialized [`SignalMessage`].
    pub fn decrypt(&mut self, local: &IdentityKey, data: &[u8], skip_window: u32) -> Result<Vec<u8>> {
        let msg: SignalMessage = envelope::deserialize(data)?;
        let their_ratchet = key32(&msg.ratchet_key, "ratchet key")?;

        let message_key = match self.take_skipped(&their_ratchet, msg.counter) {
            Some(key) => key,
            None => {
                if self.remote_ratchet != Some(their_ratchet) || self.receiving.is_none() {
                    self.skip_until(msg.previous_counter, skip_window)?;
                    self.ratchet_step(their_ratchet)?;
                }
                let index = self.receiving.as_ref().map(|c| c.index).unwrap_or(0);
                if msg.counter < index {
                    return Err(Error::SessionMismatch(format!(
                        "message {} already received or expired",
                        msg.counter
                    )));
                }
                self.skip_until(msg.counter, skip_window)?;
                self.receiving
                    .as_mut()
                    .ok_or_else(|| Error::SessionMismatch("session has no receiving chain".into()))?
                    .step()?
            }
        };

        let ad = associated_data(
            &self.remote_identity,
            local,
            &msg.ratchet_key,
            msg.counter,
            msg.previous_counter,
        );
        let (key, nonce) = message_cipher(&message_key)?;
        let plaintext = aes_gcm_open(&key, &nonce, &msg.ciphertext, &ad)?
            .ok_or_else(|| Error::SessionMismatch("message authentication failed".into()))?;
        // the peer has our ratchet now
        self.pending_prekey = None;
        Ok(plaintext)
    }

    fn take_skipped(&mut self, ratchet: &[u8; 32], index: u32) -> Option<[u8; 32]> {
        let pos = self
            .skipped
            .iter()
            .position(|k| &k.ratchet == ratchet && k.index == index)?;
        self.skipped.remove(pos).map(|k| k.message_key)
    }

    /// Cache message keys of the current receiving chain up to (not including) `until`.
    fn skip_until(&mut self, until: u32, window: u32) -> Result<()> {
        let (Some(chain), Some(ratchet)) = (self.receiving.as_mut(), self.remote_ratchet) else {
            return Ok(());
        };
        if until <= chain.index {
            return Ok(());
        }
        if until - chain.index > window {
            return Err(Error::SessionMismatch(format!(
                "{} skipped messages exceed window of {}",
                until - chain.index,
                window
            )));
        }
        while chain.index < until {
            let index = chain.index;
            let message_key = chain.step()?;
            self.skipped.push_back(SkippedKey {
                ratchet,
                index,
                message_key,
            });
        }
        while self.skipped.len() > window as usize {
            self.skipped.pop_front();
        }
        Ok(())
    }

    fn ratchet_step(&mut self, their_ratchet: [u8; 32]) -> Result<()> {
        self.previous_counter = self.sending.as_ref().map(|c| c.index).unwrap_or(0);
        self.remote_ratchet = Some(their_ratchet);

        let (root_key, receiving_key) = root_step(&self.root_key, &self.local_ratchet.dh(&their_ratchet)?)?;
        self.receiving = Some(Chain { key: receiving_key, index: 0 });

        self.local_ratchet = KeyPair::generate();
        let (root_key, sending_key) = root_step(&root_key, &self.local_ratchet.dh(&their_ratchet)?)?;
        self.sending = Some(Chain { key: sending_key, index: 0 });
        self.root_key = root_key;
        Ok(())
    }

    /// Number of cached skipped message keys.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }
}
