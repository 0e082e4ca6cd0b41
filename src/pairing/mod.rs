//! Pairing crypto: QR payloads, device identity verification (HMAC + account
//! signature), device signature, and phone-number link codes.

use crate::error::{Error, PairingError};
use crate::signal::crypto::{aes_gcm_open, aes_gcm_seal, hkdf, hmac_sha256, GCM_NONCE_LEN};
use crate::signal::{IdentityKey, IdentityKeyPair, KeyPair};
use crate::store::Device;
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::Mac;
use prost::Message;
use rand::{Rng, RngCore};

/// Prefix of the bytes the primary signs for a companion.
const ADV_PREFIX_ACCOUNT_SIGNATURE: [u8; 2] = [6, 0];
/// Prefix of the bytes the companion signs back.
const ADV_PREFIX_DEVICE_SIGNATURE: [u8; 2] = [6, 1];

/// Alphabet for phone link codes (no 0, O, I, U).
pub const LINK_CODE_ALPHABET: &[u8; 32] = b"123456789ABCDEFGHJKLMNPQRSTVWXYZ";
const LINK_CODE_KEY_INFO: &[u8] = b"link_code_pairing_key_bundle_encryption_key";
const ADV_SECRET_INFO: &[u8] = b"adv_secret";
const SALT_LEN: usize = 32;

/// Pairing progress, from unpaired to an active session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    AwaitingQrScan,
    AwaitingPairConfirmation,
    LoggedIn,
    ActiveSession,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdvSignedDeviceIdentityHmac {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub hmac: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdvSignedDeviceIdentity {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub account_signature_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub account_signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub device_signature: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdvDeviceIdentity {
    #[prost(uint32, optional, tag = "1")]
    pub raw_id: Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "3")]
    pub key_index: Option<u32>,
}

/// QR payload: `ref,noise_pub,identity_pub,adv_secret`, all keys base64.
pub fn make_qr_code(pair_ref: &str, device: &Device) -> String {
    [
        pair_ref.to_string(),
        BASE64.encode(device.noise_key.public),
        BASE64.encode(device.identity.agreement.public),
        BASE64.encode(device.adv_secret_key),
    ]
    .join(",")
}

fn protocol(msg: &str) -> Error {
    Error::Pairing(PairingError::Protocol(msg.into()))
}

fn account_message(details: &[u8], identity: &IdentityKey) -> Vec<u8> {
    let mut msg = ADV_PREFIX_ACCOUNT_SIGNATURE.to_vec();
    msg.extend_from_slice(details);
    msg.extend_from_slice(&identity.agreement);
    msg
}

fn device_message(details: &[u8], identity: &IdentityKey, account_key: &[u8]) -> Vec<u8> {
    let mut msg = ADV_PREFIX_DEVICE_SIGNATURE.to_vec();
    msg.extend_from_slice(details);
    msg.extend_from_slice(&identity.agreement);
    msg.extend_from_slice(account_key);
    msg
}

fn verify_ed25519(key: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let Ok(key) = <[u8; 32]>::try_from(key) else {
        return false;
    };
    let (Ok(key), Ok(sig)) = (VerifyingKey::from_bytes(&key), Signature::from_slice(sig)) else {
        return false;
    };
    key.verify(msg, &sig).is_ok()
}

/// Check the HMAC on the device identity container with the adv secret and decode the
/// signed identity inside.
pub fn verify_device_identity(container: &[u8], adv_secret: &[u8]) -> Result<AdvSignedDeviceIdentity> {
    let container = AdvSignedDeviceIdentityHmac::decode(container)
        .map_err(|e| Error::Pairing(PairingError::Protocol(format!("device identity: {}", e))))?;
    let details = container
        .details
        .ok_or_else(|| protocol("device identity without details"))?;
    let tag = container
        .hmac
        .ok_or(Error::Pairing(PairingError::InvalidDeviceIdentityHmac))?;

    let mut mac = <crate::signal::crypto::HmacSha256 as Mac>::new_from_slice(adv_secret)
        .map_err(|_| protocol("invalid HMAC key length"))?;
    mac.update(&details);
    mac.verify_slice(&tag)
        .map_err(|_| Error::Pairing(PairingError::InvalidDeviceIdentityHmac))?;

    AdvSignedDeviceIdentity::decode(details.as_slice())
        .map_err(|e| Error::Pairing(PairingError::Protocol(format!("signed identity: {}", e))))
}

/// Outcome of a verified pair-success.
#[derive(Clone, Debug)]
pub struct PairedIdentity {
    /// Signed identity to persist as the device's account.
    pub account: Vec<u8>,
    /// Signed identity to send back in `pair-device-sign` (account key stripped).
    pub reply: Vec<u8>,
    pub key_index: u32,
}

/// Verify the primary's signature on our identity and countersign it.
pub fn complete_device_identity(
    device: &Device,
    container: &[u8],
) -> Result<PairedIdentity> {
    let mut signed = verify_device_identity(container, &device.adv_secret_key)?;
    let details = signed
        .details
        .clone()
        .ok_or_else(|| protocol("signed identity without details"))?;
    let account_key = signed
        .account_signature_key
        .clone()
        .ok_or_else(|| protocol("signed identity without account key"))?;
    let account_sig = signed
        .account_signature
        .as_deref()
        .ok_or(Error::Pairing(PairingError::InvalidDeviceSignature))?;

    let identity = device.identity.public();
    if !verify_ed25519(&account_key, &account_message(&details, &identity), account_sig) {
        return Err(Error::Pairing(PairingError::InvalidDeviceSignature));
    }
    signed.device_signature =
        Some(device.identity.sign(&device_message(&details, &identity, &account_key)));

    let key_index = AdvDeviceIdentity::decode(details.as_slice())
        .map_err(|e| Error::Pairing(PairingError::Protocol(format!("device details: {}", e))))?
        .key_index
        .unwrap_or(0);

    let account = signed.encode_to_vec();
    signed.account_signature_key = None;
    Ok(PairedIdentity {
        account,
        reply: signed.encode_to_vec(),
        key_index,
    })
}

/// Check a stored account blob: the primary's and our own signatures.
pub fn verify_account(device: &Device) -> Result<()> {
    let blob = device
        .account
        .as_deref()
        .ok_or(Error::Pairing(PairingError::InvalidDeviceSignature))?;
    let signed = AdvSignedDeviceIdentity::decode(blob)
        .map_err(|_| Error::Pairing(PairingError::InvalidDeviceSignature))?;
    let (Some(details), Some(key), Some(acc_sig), Some(dev_sig)) = (
        signed.details.as_deref(),
        signed.account_signature_key.as_deref(),
        signed.account_signature.as_deref(),
        signed.device_signature.as_deref(),
    ) else {
        return Err(Error::Pairing(PairingError::InvalidDeviceSignature));
    };
    let identity = device.identity.public();
    if !verify_ed25519(key, &account_message(details, &identity), acc_sig)
        || !identity.verify(&device_message(details, &identity, key), dev_sig)
    {
        return Err(Error::Pairing(PairingError::InvalidDeviceSignature));
    }
    Ok(())
}

/// Primary-device side: sign a companion identity and wrap it with the adv secret HMAC.
pub fn sign_companion_identity(
    primary: &IdentityKeyPair,
    adv_secret: &[u8; 32],
    companion: &IdentityKey,
    key_index: u32,
) -> Result<Vec<u8>> {
    let details = AdvDeviceIdentity {
        raw_id: Some(rand::thread_rng().gen()),
        timestamp: Some(crate::types::unix_now()),
        key_index: Some(key_index),
    }
    .encode_to_vec();
    let account_key = primary.public().signing.to_vec();
    let signed = AdvSignedDeviceIdentity {
        account_signature: Some(primary.sign(&account_message(&details, companion))),
        details: Some(details),
        account_signature_key: Some(account_key),
        device_signature: None,
    }
    .encode_to_vec();
    let hmac = hmac_sha256(adv_secret, &[signed.as_slice()])?;
    Ok(AdvSignedDeviceIdentityHmac {
        details: Some(signed),
        hmac: Some(hmac.to_vec()),
    }
    .encode_to_vec())
}

/// Random 8-character link code.
pub fn generate_link_code() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| LINK_CODE_ALPHABET[rng.gen_range(0..LINK_CODE_ALPHABET.len())] as char)
        .collect()
}

/// `ABCD1234` -> `ABCD-1234`.
pub fn format_link_code(code: &str) -> String {
    if code.len() == 8 {
        format!("{}-{}", &code[..4], &code[4..])
    } else {
        code.to_string()
    }
}

/// Strip non-digits; the phone number must be in international format.
pub fn normalize_phone(phone: &str) -> Result<String> {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() <= 6 || digits.starts_with('0') {
        return Err(Error::Pairing(PairingError::InvalidPhoneNumber));
    }
    Ok(digits)
}

fn seal_with(secret: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; GCM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);
    let key = hkdf::<32>(Some(&salt), secret, LINK_CODE_KEY_INFO)?;
    let mut out = Vec::with_capacity(SALT_LEN + GCM_NONCE_LEN + plaintext.len() + 16);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&aes_gcm_seal(&key, &nonce, plaintext, &[])?);
    Ok(out)
}

fn open_with(secret: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < SALT_LEN + GCM_NONCE_LEN {
        return Err(protocol("wrapped link code data too short"));
    }
    let (salt, rest) = wrapped.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(GCM_NONCE_LEN);
    let key = hkdf::<32>(Some(salt), secret, LINK_CODE_KEY_INFO)?;
    let nonce: [u8; GCM_NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| protocol("bad link code nonce"))?;
    aes_gcm_open(&key, &nonce, ciphertext, &[])?
        .ok_or_else(|| protocol("link code data failed to decrypt"))
}

/// Wrap a public key with a key derived from the link code.
pub fn wrap_with_code(code: &str, public: &[u8; 32]) -> Result<Vec<u8>> {
    seal_with(code.as_bytes(), public)
}

pub fn unwrap_with_code(code: &str, wrapped: &[u8]) -> Result<[u8; 32]> {
    open_with(code.as_bytes(), wrapped)?
        .as_slice()
        .try_into()
        .map_err(|_| protocol("wrapped key must be 32 bytes"))
}

/// Companion side of an in-progress link code pairing.
#[derive(Clone, Debug)]
pub struct LinkCodeSession {
    pub phone: String,
    pub code: String,
    pub ephemeral: KeyPair,
    pub pairing_ref: Option<String>,
}

impl LinkCodeSession {
    pub fn new(phone: &str) -> Result<Self> {
        Ok(Self {
            phone: normalize_phone(phone)?,
            code: generate_link_code(),
            ephemeral: KeyPair::generate(),
            pairing_ref: None,
        })
    }

    /// Our ephemeral public key wrapped for the primary.
    pub fn wrapped_ephemeral(&self) -> Result<Vec<u8>> {
        wrap_with_code(&self.code, &self.ephemeral.public)
    }

    /// Handle the primary's hello. Returns the encrypted key bundle for `companion_finish`
    /// and the new adv secret the pair-success will be authenticated with.
    pub fn finish(
        &self,
        device: &Device,
        wrapped_primary_ephemeral: &[u8],
        primary_identity: &[u8; 32],
    ) -> Result<(Vec<u8>, [u8; 32])> {
        let primary_ephemeral = unwrap_with_code(&self.code, wrapped_primary_ephemeral)?;
        let ephemeral_shared = self.ephemeral.dh(&primary_ephemeral)?;

        let mut adv_random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut adv_random);
        let mut bundle = Vec::with_capacity(96);
        bundle.extend_from_slice(&device.identity.agreement.public);
        bundle.extend_from_slice(primary_identity);
        bundle.extend_from_slice(&adv_random);
        let wrapped_bundle = seal_with(&ephemeral_shared, &bundle)?;

        let identity_shared = device.identity.agreement.dh(primary_identity)?;
        let adv_secret = derive_adv_secret(&ephemeral_shared, &identity_shared, &adv_random)?;
        Ok((wrapped_bundle, adv_secret))
    }
}

fn derive_adv_secret(ephemeral_shared: &[u8; 32], identity_shared: &[u8; 32], random: &[u8; 32]) -> Result<[u8; 32]> {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(ephemeral_shared);
    ikm.extend_from_slice(identity_shared);
    ikm.extend_from_slice(random);
    hkdf::<32>(None, &ikm, ADV_SECRET_INFO)
}

/// Primary-device side of the link code exchange, for in-process servers.
pub mod primary {
    use super::*;

    /// Answer the companion hello: our ephemeral key wrapped with the code.
    pub fn hello(code: &str, ephemeral: &KeyPair) -> Result<Vec<u8>> {
        wrap_with_code(code, &ephemeral.public)
    }

    /// Open the companion's key bundle and derive the shared adv secret.
    pub fn adv_secret(
        code: &str,
        ephemeral: &KeyPair,
        identity: &KeyPair,
        wrapped_companion_ephemeral: &[u8],
        wrapped_bundle: &[u8],
    ) -> Result<[u8; 32]> {
        let companion_ephemeral = unwrap_with_code(code, wrapped_companion_ephemeral)?;
        let ephemeral_shared = ephemeral.dh(&companion_ephemeral)?;
        let bundle = open_with(&ephemeral_shared, wrapped_bundle)?;
        if bundle.len() != 96 || bundle[32..64] != identity.public {
            return Err(protocol("key bundle does not match primary identity"));
        }
        let companion_identity: [u8; 32] = bundle[..32]
            .try_into()
            .map_err(|_| protocol("bad companion identity"))?;
        let random: [u8; 32] = bundle[64..]
            .try_into()
            .map_err(|_| protocol("bad adv random"))?;
        let identity_shared = identity.dh(&companion_identity)?;
        derive_adv_secret(&ephemeral_shared, &identity_shared, &random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_container(device: &Device, primary: &IdentityKeyPair) -> Vec<u8> {
        sign_companion_identity(primary, &device.adv_secret_key, &device.identity.public(), 3)
            .unwrap()
    }

    #[test]
    fn qr_code_layout() {
        let device = Device::new("q");
        let code = make_qr_code("2@abc", &device);
        let parts: Vec<_> = code.split(',').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "2@abc");
        assert_eq!(BASE64.decode(parts[1]).unwrap(), device.noise_key.public);
        assert_eq!(BASE64.decode(parts[3]).unwrap(), device.adv_secret_key);
    }

    #[test]
    fn pair_success_verifies_and_countersigns() {
        let mut device = Device::new("p");
        let primary = IdentityKeyPair::generate();
        let container = paired_container(&device, &primary);

        let paired = complete_device_identity(&device, &container).unwrap();
        assert_eq!(paired.key_index, 3);
        let reply = AdvSignedDeviceIdentity::decode(paired.reply.as_slice()).unwrap();
        assert!(reply.account_signature_key.is_none());
        assert!(reply.device_signature.is_some());

        device.account = Some(paired.account);
        verify_account(&device).unwrap();
    }

    #[test]
    fn hmac_reject_tampered() {
        let device = Device::new("p");
        let primary = IdentityKeyPair::generate();
        let mut container = AdvSignedDeviceIdentityHmac::decode(
            paired_container(&device, &primary).as_slice(),
        )
        .unwrap();
        if let Some(tag) = container.hmac.as_mut() {
            tag[0] ^= 1;
        }
        let err = complete_device_identity(&device, &container.encode_to_vec()).unwrap_err();
        assert!(matches!(
            err,
            Error::Pairing(PairingError::InvalidDeviceIdentityHmac)
        ));
    }

    #[test]
    fn identity_for_other_device_is_rejected() {
        let device = Device::new("p");
        let other = Device::new("o");
        let primary = IdentityKeyPair::generate();
        // signed for `other`'s identity but with our adv secret
        let container =
            sign_companion_identity(&primary, &device.adv_secret_key, &other.identity.public(), 1)
                .unwrap();
        let err = complete_device_identity(&device, &container).unwrap_err();
        assert!(matches!(err, Error::Pairing(PairingError::InvalidDeviceSignature)));
    }

    #[test]
    fn link_code_format() {
        let code = generate_link_code();
        assert_eq!(code.len(), 8);
        assert!(code.bytes().all(|b| LINK_CODE_ALPHABET.contains(&b)));
        let formatted = format_link_code(&code);
        assert_eq!(formatted.len(), 9);
        assert_eq!(&formatted[4..5], "-");
        assert!(normalize_phone("+49 (151) 234-5678").is_ok());
        assert!(normalize_phone("0151 2345678").is_err());
        assert!(normalize_phone("123").is_err());
    }

    #[test]
    fn link_code_exchange_agrees_on_adv_secret() {
        let device = Device::new("l");
        let session = LinkCodeSession::new("+1 555 123 4567").unwrap();
        let primary_eph = KeyPair::generate();
        let primary_id = KeyPair::generate();

        let hello = primary::hello(&session.code, &primary_eph).unwrap();
        let (bundle, companion_adv) = session.finish(&device, &hello, &primary_id.public).unwrap();
        let primary_adv = primary::adv_secret(
            &session.code,
            &primary_eph,
            &primary_id,
            &session.wrapped_ephemeral().unwrap(),
            &bundle,
        )
        .unwrap();
        assert_eq!(companion_adv, primary_adv);

        // a wrong code cannot unwrap
        assert!(unwrap_with_code("AAAAAAAA", &hello).is_err());
    }
}
