//! Key material: X25519 agreement keys, Ed25519 identity signing, prekeys.

use crate::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// Prefix on serialized public keys (curve25519 key type byte).
pub const DJB_TYPE: u8 = 0x05;

/// X25519 key pair.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    pub public: [u8; 32],
    pub private: [u8; 32],
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[redacted]")
            .finish()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);
        Self::from_private(private)
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        Self {
            public: PublicKey::from(&secret).to_bytes(),
            private: secret.to_bytes(),
        }
    }

    /// X25519 agreement. Low-order peer keys are rejected.
    pub fn dh(&self, their_public: &[u8; 32]) -> Result<[u8; 32]> {
        let shared = StaticSecret::from(self.private).diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(Error::SessionMismatch("non-contributory key agreement".into()));
        }
        Ok(shared.to_bytes())
    }
}

/// Long-term identity: an X25519 agreement key and an Ed25519 signing key.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    pub agreement: KeyPair,
    signing_private: [u8; 32],
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            agreement: KeyPair::generate(),
            signing_private: SigningKey::generate(&mut rand::thread_rng()).to_bytes(),
        }
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.signing_private)
    }

    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            agreement: self.agreement.public,
            signing: self.signing_key().verifying_key().to_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key().sign(message).to_bytes().to_vec()
    }
}

/// Public half of an identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub agreement: [u8; 32],
    pub signing: [u8; 32],
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKey({})", hex::encode(&self.agreement[..8]))
    }
}

impl IdentityKey {
    pub const LEN: usize = 64;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.agreement);
        out.extend_from_slice(&self.signing);
        out
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() != Self::LEN {
            return Err(Error::ProtocolViolation(format!(
                "identity key must be {} bytes, got {}",
                Self::LEN,
                b.len()
            )));
        }
        let mut agreement = [0u8; 32];
        let mut signing = [0u8; 32];
        agreement.copy_from_slice(&b[..32]);
        signing.copy_from_slice(&b[32..]);
        Ok(Self { agreement, signing })
    }

    /// Check an Ed25519 signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signing) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

/// Bytes covered by a signed prekey signature.
pub fn signed_prekey_message(public: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(33);
    msg.push(DJB_TYPE);
    msg.extend_from_slice(public);
    msg
}

/// Medium-term prekey signed by the identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: KeyPair,
    pub signature: Vec<u8>,
    /// Unix seconds.
    pub created_at: u64,
}

impl SignedPreKey {
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(&signed_prekey_message(&key_pair.public));
        Self {
            id,
            key_pair,
            signature,
            created_at: crate::types::unix_now(),
        }
    }
}

/// One-time prekey.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKey {
    pub id: u32,
    pub key_pair: KeyPair,
}

impl PreKey {
    pub fn generate(id: u32) -> Self {
        Self {
            id,
            key_pair: KeyPair::generate(),
        }
    }
}

/// Public one-time prekey as published in a bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreKeyPublic {
    pub id: u32,
    pub public: [u8; 32],
}

/// Everything needed to start a session with a peer device that is offline.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity: IdentityKey,
    pub signed_prekey_id: u32,
    pub signed_prekey: [u8; 32],
    pub signed_prekey_signature: Vec<u8>,
    pub prekey: Option<PreKeyPublic>,
}

impl PreKeyBundle {
    pub fn verify_signature(&self) -> bool {
        self.identity.verify(
            &signed_prekey_message(&self.signed_prekey),
            &self.signed_prekey_signature,
        )
    }
}
