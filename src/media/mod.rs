//! Encrypted media blobs: key expansion, encryption with integrity checks, upload
//! slot resolution (`media_conn`) and blob transfer.
//!
//! A blob is `AES-256-CBC(plaintext) || HMAC-SHA256(iv || ciphertext)[..10]`. Download
//! verifies the encrypted hash, then the MAC, then decrypts, then checks the plaintext
//! hash and length. Any mismatch is an [`IntegrityError`] and no bytes are returned.

mod blob;

pub use blob::{BlobTransport, MemoryBlobTransport, UploadResponse};
#[cfg(feature = "full")]
pub use blob::HttpBlobTransport;

use crate::binary::Node;
use crate::error::{Error, IntegrityError};
use crate::signal::crypto::{aes_cbc_decrypt, aes_cbc_encrypt, hkdf, hmac_sha256, hmac_verify_truncated};
use crate::Result;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::debug;

/// Length of the truncated MAC appended to every blob.
pub const MEDIA_MAC_LEN: usize = 10;
/// Host used for downloads when `media_conn` gave none.
pub const DEFAULT_MEDIA_HOST: &str = "mmg.whatsapp.net";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    History,
    AppState,
    LinkThumbnail,
}

impl MediaType {
    /// HKDF info string the media key is expanded with.
    pub fn hkdf_info(&self) -> &'static str {
        match self {
            Self::Image | Self::Sticker => "WhatsApp Image Keys",
            Self::Video => "WhatsApp Video Keys",
            Self::Audio => "WhatsApp Audio Keys",
            Self::Document => "WhatsApp Document Keys",
            Self::History => "WhatsApp History Keys",
            Self::AppState => "WhatsApp App State Keys",
            Self::LinkThumbnail => "WhatsApp Link Thumbnail Keys",
        }
    }

    /// Upload path segment on the media host.
    pub fn mms_path(&self) -> &'static str {
        match self {
            Self::Image | Self::Sticker => "/mms/image",
            Self::Video => "/mms/video",
            Self::Audio => "/mms/audio",
            Self::Document => "/mms/document",
            Self::History => "/mms/md-msg-hist",
            Self::AppState => "/mms/md-app-state",
            Self::LinkThumbnail => "/mms/thumbnail-link",
        }
    }
}

/// Keys expanded from a 32-byte media key.
pub struct MediaKeys {
    pub iv: [u8; 16],
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub ref_key: [u8; 32],
}

impl MediaKeys {
    pub fn expand(media_key: &[u8], media_type: MediaType) -> Result<Self> {
        let okm = hkdf::<112>(None, media_key, media_type.hkdf_info().as_bytes())?;
        let mut keys = Self {
            iv: [0; 16],
            cipher_key: [0; 32],
            mac_key: [0; 32],
            ref_key: [0; 32],
        };
        keys.iv.copy_from_slice(&okm[..16]);
        keys.cipher_key.copy_from_slice(&okm[16..48]);
        keys.mac_key.copy_from_slice(&okm[48..80]);
        keys.ref_key.copy_from_slice(&okm[80..]);
        Ok(keys)
    }
}

/// Handle to an uploaded blob; everything needed to download and verify it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    pub direct_path: String,
    pub url: Option<String>,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
    pub mimetype: String,
    pub media_type: MediaType,
}

/// Output of [`encrypt_media`] before upload.
pub struct EncryptedMedia {
    pub data: Vec<u8>,
    pub media_key: [u8; 32],
    pub file_sha256: [u8; 32],
    pub file_enc_sha256: [u8; 32],
    pub file_length: u64,
}

/// Encrypt with a fresh random media key.
pub fn encrypt_media(plaintext: &[u8], media_type: MediaType) -> Result<EncryptedMedia> {
    let mut media_key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut media_key);
    let keys = MediaKeys::expand(&media_key, media_type)?;

    let mut data = aes_cbc_encrypt(&keys.cipher_key, &keys.iv, plaintext)?;
    let mac = hmac_sha256(&keys.mac_key, &[&keys.iv[..], &data[..]])?;
    data.extend_from_slice(&mac[..MEDIA_MAC_LEN]);

    Ok(EncryptedMedia {
        file_sha256: Sha256::digest(plaintext).into(),
        file_enc_sha256: Sha256::digest(&data).into(),
        file_length: plaintext.len() as u64,
        media_key,
        data,
    })
}

/// Verify and decrypt a downloaded blob.
pub fn decrypt_media(data: &[u8], reference: &MediaReference) -> Result<Vec<u8>> {
    if Sha256::digest(data).as_slice() != reference.file_enc_sha256.as_slice() {
        return Err(IntegrityError::EncryptedHashMismatch.into());
    }
    if data.len() < MEDIA_MAC_LEN {
        return Err(IntegrityError::MacMismatch.into());
    }
    let (ciphertext, mac) = data.split_at(data.len() - MEDIA_MAC_LEN);
    let keys = MediaKeys::expand(&reference.media_key, reference.media_type)?;
    if !hmac_verify_truncated(&keys.mac_key, &[&keys.iv[..], ciphertext], mac)? {
        return Err(IntegrityError::MacMismatch.into());
    }
    let plaintext = aes_cbc_decrypt(&keys.cipher_key, &keys.iv, ciphertext)?
        .ok_or(IntegrityError::DecryptFailed)?;
    if Sha256::digest(&plaintext).as_slice() != reference.file_sha256.as_slice() {
        return Err(IntegrityError::PlaintextHashMismatch.into());
    }
    if plaintext.len() as u64 != reference.file_length {
        return Err(IntegrityError::LengthMismatch {
            expected: reference.file_length,
            actual: plaintext.len() as u64,
        }
        .into());
    }
    Ok(plaintext)
}

/// Upload hosts and auth token from the `media_conn` query.
#[derive(Clone, Debug)]
pub struct MediaConn {
    pub auth: String,
    pub ttl: Duration,
    pub hosts: Vec<String>,
    pub fetched_at: Instant,
}

impl MediaConn {
    /// `<iq type="result"><media_conn auth ttl><host hostname/>...</media_conn></iq>`
    pub fn from_node(iq: &Node) -> Result<Self> {
        let conn = iq
            .get_child_by_tag("media_conn")
            .ok_or_else(|| Error::ProtocolViolation("response without <media_conn>".into()))?;
        let hosts: Vec<String> = conn
            .get_children_by_tag("host")
            .filter_map(|h| h.attr("hostname"))
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return Err(Error::ProtocolViolation("<media_conn> without hosts".into()));
        }
        Ok(Self {
            auth: conn.require_attr("auth")?.to_string(),
            ttl: Duration::from_secs(conn.attr_u64("ttl").unwrap_or(0)),
            hosts,
            fetched_at: Instant::now(),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// Encrypt and upload to the first host that accepts the blob.
pub async fn upload(
    transport: &dyn BlobTransport,
    conn: &MediaConn,
    plaintext: &[u8],
    media_type: MediaType,
    mimetype: &str,
) -> Result<MediaReference> {
    let enc = encrypt_media(plaintext, media_type)?;
    let token = URL_SAFE.encode(enc.file_enc_sha256);

    let mut last_err = None;
    for host in &conn.hosts {
        let url = format!(
            "https://{}{}/{}?auth={}&token={}",
            host,
            media_type.mms_path(),
            token,
            conn.auth,
            token
        );
        match transport.put(&url, enc.data.clone()).await {
            Ok(resp) => {
                debug!(%host, direct_path = %resp.direct_path, "media uploaded");
                return Ok(MediaReference {
                    direct_path: resp.direct_path,
                    url: Some(resp.url),
                    media_key: enc.media_key.to_vec(),
                    file_sha256: enc.file_sha256.to_vec(),
                    file_enc_sha256: enc.file_enc_sha256.to_vec(),
                    file_length: enc.file_length,
                    mimetype: mimetype.to_string(),
                    media_type,
                });
            }
            Err(e) => {
                debug!(%host, error = %e, "media upload failed, trying next host");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::ProtocolViolation("no media hosts".into())))
}

/// Download from the first host that serves the direct path and verify it.
/// Integrity failures are returned immediately; other hosts are only tried on transfer errors.
pub async fn download(
    transport: &dyn BlobTransport,
    hosts: &[String],
    reference: &MediaReference,
) -> Result<Vec<u8>> {
    let fallback = [DEFAULT_MEDIA_HOST.to_string()];
    let hosts = if hosts.is_empty() { &fallback[..] } else { hosts };
    let mut last_err = None;
    for host in hosts {
        let url = format!("https://{}{}", host, reference.direct_path);
        match transport.get(&url).await {
            Ok(data) => return decrypt_media(&data, reference),
            Err(e) => {
                debug!(%host, error = %e, "media download failed, trying next host");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::ProtocolViolation("no media hosts".into())))
}

/// Reference rebuilt from raw message fields (direct path, hashes, key).
pub fn reference_from_parts(
    direct_path: &str,
    enc_file_hash: &[u8],
    file_hash: &[u8],
    media_key: &[u8],
    file_length: u64,
    media_type: MediaType,
    mimetype: &str,
) -> MediaReference {
    MediaReference {
        direct_path: direct_path.to_string(),
        url: None,
        media_key: media_key.to_vec(),
        file_sha256: file_hash.to_vec(),
        file_enc_sha256: enc_file_hash.to_vec(),
        file_length,
        mimetype: mimetype.to_string(),
        media_type,
    }
}
