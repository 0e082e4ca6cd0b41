//! Identity and session store.
//!
//! One [`Device`] per account identifier (uuid) plus the per-peer ratchet
//! sessions and trusted remote identities that belong to it.

mod file;
mod locks;
mod memory;

pub use file::{FileStore, SCHEMA_VERSION};
pub use locks::{DeviceLease, DeviceLeases, PeerSessionLocks};
pub use memory::MemoryStore;

use crate::signal::{
    IdentityKey, IdentityKeyPair, KeyPair, PreKey, PreKeyBundle, PreKeyPublic, SessionRecord,
    SignedPreKey,
};
use crate::types::Jid;
use async_trait::async_trait;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Device identity and keys for one linked device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    /// Account identifier the store is keyed by.
    pub uuid: String,
    /// Our JID after pairing (None if not paired).
    pub id: Option<Jid>,
    pub lid: Option<Jid>,
    pub push_name: String,
    pub business_name: Option<String>,
    pub platform: Option<String>,
    /// Static key for the Noise handshake.
    pub noise_key: KeyPair,
    pub identity: IdentityKeyPair,
    pub registration_id: u32,
    pub signed_prekey: SignedPreKey,
    /// Kept after rotation so prekey messages in flight still decrypt.
    pub previous_signed_prekey: Option<SignedPreKey>,
    /// One-time prekeys not yet consumed.
    pub prekeys: BTreeMap<u32, PreKey>,
    pub next_prekey_id: u32,
    /// Prekeys with an id below this have been uploaded to the server.
    pub uploaded_prekey_id: u32,
    /// Adv secret for pairing.
    pub adv_secret_key: [u8; 32],
    /// Signed device identity after pairing.
    pub account: Option<Vec<u8>>,
}

impl Device {
    /// Fresh unpaired device with newly generated keys.
    pub fn new(uuid: impl Into<String>) -> Self {
        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(1, &identity);
        let mut adv_secret_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut adv_secret_key);
        Self {
            uuid: uuid.into(),
            id: None,
            lid: None,
            push_name: String::new(),
            business_name: None,
            platform: None,
            noise_key: KeyPair::generate(),
            identity,
            registration_id: rand::thread_rng().gen_range(1..=16380),
            signed_prekey,
            previous_signed_prekey: None,
            prekeys: BTreeMap::new(),
            next_prekey_id: 1,
            uploaded_prekey_id: 1,
            adv_secret_key,
            account: None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.id.is_some()
    }

    /// Generate `count` new one-time prekeys and return them.
    pub fn generate_prekeys(&mut self, count: u32) -> Vec<PreKey> {
        (0..count)
            .map(|_| {
                let key = PreKey::generate(self.next_prekey_id);
                self.next_prekey_id += 1;
                self.prekeys.insert(key.id, key.clone());
                key
            })
            .collect()
    }

    /// Prekeys generated but not yet announced to the server.
    pub fn unuploaded_prekeys(&self) -> Vec<PreKey> {
        self.prekeys
            .range(self.uploaded_prekey_id..)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn mark_prekeys_uploaded(&mut self) {
        self.uploaded_prekey_id = self.next_prekey_id;
    }

    /// Look up a signed prekey by id, current or previous.
    pub fn find_signed_prekey(&self, id: u32) -> Option<&SignedPreKey> {
        std::iter::once(&self.signed_prekey)
            .chain(self.previous_signed_prekey.iter())
            .find(|k| k.id == id)
    }

    /// Replace the signed prekey, retaining the current one as previous.
    pub fn rotate_signed_prekey(&mut self) -> &SignedPreKey {
        let next = SignedPreKey::generate(self.signed_prekey.id.wrapping_add(1).max(1), &self.identity);
        self.previous_signed_prekey = Some(std::mem::replace(&mut self.signed_prekey, next));
        &self.signed_prekey
    }

    /// Public bundle for this device, as the server would hand it out.
    pub fn prekey_bundle(&self, prekey: Option<&PreKey>) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: self.registration_id,
            identity: self.identity.public(),
            signed_prekey_id: self.signed_prekey.id,
            signed_prekey: self.signed_prekey.key_pair.public,
            signed_prekey_signature: self.signed_prekey.signature.clone(),
            prekey: prekey.map(|k| PreKeyPublic {
                id: k.id,
                public: k.key_pair.public,
            }),
        }
    }
}

/// Store trait: persist and load device state and peer sessions.
///
/// Implementations must be safe for concurrent use; callers serialize writes to a
/// single peer session through [`PeerSessionLocks`].
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Load the device for an account identifier. Fails with `StoreError::NotFound`.
    async fn load(&self, uuid: &str) -> crate::Result<Device>;

    /// Save device state (after pairing or key changes).
    async fn save(&self, device: &Device) -> crate::Result<()>;

    /// Delete a device and everything keyed under it (logout).
    async fn delete(&self, uuid: &str) -> crate::Result<()>;

    /// Get all stored devices.
    async fn get_all_devices(&self) -> crate::Result<Vec<Device>>;

    /// Remove every device in this store.
    async fn delete_all_devices(&self) -> crate::Result<()>;

    async fn load_peer_session(
        &self,
        uuid: &str,
        address: &str,
    ) -> crate::Result<Option<SessionRecord>>;

    async fn store_peer_session(
        &self,
        uuid: &str,
        address: &str,
        record: &SessionRecord,
    ) -> crate::Result<()>;

    async fn delete_peer_session(&self, uuid: &str, address: &str) -> crate::Result<()>;

    /// Delete the sessions of every device belonging to `user`.
    async fn delete_peer_sessions(&self, uuid: &str, user: &Jid) -> crate::Result<()>;

    async fn load_identity(&self, uuid: &str, address: &str) -> crate::Result<Option<IdentityKey>>;

    async fn save_identity(
        &self,
        uuid: &str,
        address: &str,
        key: &IdentityKey,
    ) -> crate::Result<()>;
}

/// Alias for shared store (common usage).
pub type Store = Arc<dyn DeviceStore>;

/// Session address for a device JID.
pub fn peer_address(jid: &Jid) -> String {
    jid.to_string()
}

/// Whether a stored session address belongs to `user`.
pub(crate) fn address_belongs_to(address: &str, user: &Jid) -> bool {
    address
        .parse::<Jid>()
        .map(|j| j.same_user(user))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_device_has_keys_and_no_id() {
        let d = Device::new("acct");
        assert!(!d.is_logged_in());
        assert!((1..=16380).contains(&d.registration_id));
        assert!(d.identity.public().verify(
            &crate::signal::signed_prekey_message(&d.signed_prekey.key_pair.public),
            &d.signed_prekey.signature
        ));
    }

    #[test]
    fn prekey_generation_and_upload_tracking() {
        let mut d = Device::new("acct");
        let keys = d.generate_prekeys(3);
        assert_eq!(keys.iter().map(|k| k.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(d.unuploaded_prekeys().len(), 3);
        d.mark_prekeys_uploaded();
        assert!(d.unuploaded_prekeys().is_empty());
        d.generate_prekeys(2);
        assert_eq!(d.unuploaded_prekeys().len(), 2);
    }

    #[test]
    fn rotation_keeps_previous_signed_prekey() {
        let mut d = Device::new("acct");
        let old_id = d.signed_prekey.id;
        let new_id = d.rotate_signed_prekey().id;
        assert_ne!(old_id, new_id);
        assert!(d.find_signed_prekey(old_id).is_some());
        assert!(d.find_signed_prekey(new_id).is_some());
        d.rotate_signed_prekey();
        assert!(d.find_signed_prekey(old_id).is_none());
    }

    #[test]
    fn address_ownership() {
        let addr = peer_address(&Jid::user("123").with_device(4));
        assert!(address_belongs_to(&addr, &Jid::user("123")));
        assert!(!address_belongs_to(&addr, &Jid::user("1234")));
    }
}
