//! Shared primitives: HKDF, HMAC-SHA256, AES-256-GCM and AES-256-CBC.

use crate::{Error, Result};
use aes_gcm::aead::{Aead, Payload};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub(crate) type HmacSha256 = Hmac<Sha256>;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub(crate) const GCM_NONCE_LEN: usize = 12;

/// HKDF-SHA256 extract-and-expand into a fixed size output.
pub(crate) fn hkdf<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; N]> {
    let mut okm = [0u8; N];
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, &mut okm)
        .map_err(|_| Error::Other(anyhow::anyhow!("hkdf output of {} bytes is too long", N)))?;
    Ok(okm)
}

pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Other(anyhow::anyhow!("hmac key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time check of `tag` against HMAC-SHA256 over `parts`, truncated to `tag.len()`.
pub(crate) fn hmac_verify_truncated(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<bool> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Other(anyhow::anyhow!("hmac key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.verify_truncated_left(tag).is_ok())
}

fn cipher(key: &[u8; 32]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| Error::Other(anyhow::anyhow!("aes key: {}", e)))
}

pub(crate) fn aes_gcm_seal(
    key: &[u8; 32],
    nonce: &[u8; GCM_NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    cipher(key)?
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| Error::Other(anyhow::anyhow!("aes-gcm encryption failed")))
}

/// Returns `None` when authentication fails.
pub(crate) fn aes_gcm_open(
    key: &[u8; 32],
    nonce: &[u8; GCM_NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Option<Vec<u8>>> {
    Ok(cipher(key)?
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .ok())
}

/// AES-256-CBC with PKCS#7 padding.
pub(crate) fn aes_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| Error::Other(anyhow::anyhow!("aes-cbc key: {}", e)))?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Returns `None` when the padding is invalid.
pub(crate) fn aes_cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Option<Vec<u8>>> {
    let dec = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| Error::Other(anyhow::anyhow!("aes-cbc key: {}", e)))?;
    Ok(dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcm_rejects_wrong_aad() {
        let key = [7u8; 32];
        let nonce = [1u8; 12];
        let ct = aes_gcm_seal(&key, &nonce, b"hello", b"ad").unwrap();
        assert_eq!(aes_gcm_open(&key, &nonce, &ct, b"ad").unwrap().unwrap(), b"hello");
        assert!(aes_gcm_open(&key, &nonce, &ct, b"other").unwrap().is_none());
    }

    #[test]
    fn cbc_matches_nist_vector() {
        // SP 800-38A F.2.5, first block
        let key: [u8; 32] =
            hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4")
                .unwrap()
                .try_into()
                .unwrap();
        let iv: [u8; 16] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let block = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let ct = aes_cbc_encrypt(&key, &iv, &block).unwrap();
        assert_eq!(ct.len(), 32);
        assert_eq!(hex::encode(&ct[..16]), "f58c4c04d6e5f1ba779eabfb5f7bfbd6");
        assert_eq!(aes_cbc_decrypt(&key, &iv, &ct).unwrap().unwrap(), block);
        assert!(aes_cbc_decrypt(&key, &iv, &ct[..16]).unwrap().is_none());
    }

    #[test]
    fn truncated_hmac() {
        let full = hmac_sha256(b"k", &[b"a", b"b"]).unwrap();
        assert_eq!(full, hmac_sha256(b"k", &[b"ab"]).unwrap());
        assert!(hmac_verify_truncated(b"k", &[b"ab"], &full[..10]).unwrap());
        assert!(!hmac_verify_truncated(b"k", &[b"ac"], &full[..10]).unwrap());
    }

    #[test]
    fn hkdf_is_deterministic() {
        let a: [u8; 64] = hkdf(None, b"ikm", b"info").unwrap();
        let b: [u8; 64] = hkdf(None, b"ikm", b"info").unwrap();
        let c: [u8; 64] = hkdf(None, b"ikm", b"other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
