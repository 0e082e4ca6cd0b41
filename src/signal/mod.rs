//! End-to-end session layer: X3DH setup, double ratchet, multi-device fan-out.

pub(crate) mod crypto;
mod envelope;
mod keys;
mod ratchet;

pub use envelope::{
    pad_message, unpad_message, CipherEnvelope, EnvelopeKind, PreKeySignalMessage, SignalMessage,
    MESSAGE_VERSION,
};
pub use keys::{
    signed_prekey_message, IdentityKey, IdentityKeyPair, KeyPair, PreKey, PreKeyBundle,
    PreKeyPublic, SignedPreKey, DJB_TYPE,
};
pub use ratchet::SessionRecord;

use crate::store::{peer_address, Device, PeerSessionLocks, Store};
use crate::types::Jid;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, warn};

/// Source of prekey bundles for devices we have no session with.
#[async_trait]
pub trait PreKeyFetcher: Send + Sync {
    /// Devices missing from the result have no bundle and cannot be reached.
    async fn fetch_prekey_bundles(&self, devices: &[Jid]) -> Result<HashMap<Jid, PreKeyBundle>>;
}

/// Result of decrypting one envelope.
#[derive(Debug)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    /// One-time prekey used to establish the session. The caller removes it from the device.
    pub consumed_prekey: Option<u32>,
    pub new_session: bool,
    pub identity_changed: bool,
}

/// Per-account session manager. Holds a per-peer lock for the whole
/// load, ratchet, persist sequence so a ratchet step is never lost or reused.
pub struct SessionManager {
    store: Store,
    uuid: String,
    locks: PeerSessionLocks,
    skip_window: u32,
    identity_changes: Option<mpsc::UnboundedSender<Jid>>,
}

/// An open session with one peer device. Holds the peer lock until dropped.
pub struct PeerSession<'a> {
    manager: &'a SessionManager,
    peer: Jid,
    address: String,
    record: SessionRecord,
    _guard: OwnedMutexGuard<()>,
}

impl PeerSession<'_> {
    pub fn peer(&self) -> &Jid {
        &self.peer
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Encrypt and persist the advanced state before returning the envelope.
    pub async fn encrypt(&mut self, local: &Device, plaintext: &[u8]) -> Result<CipherEnvelope> {
        let mut next = self.record.clone();
        let (data, is_prekey) = next.encrypt(&local.identity.public(), plaintext)?;
        self.manager
            .store
            .store_peer_session(&self.manager.uuid, &self.address, &next)
            .await?;
        self.record = next;
        Ok(CipherEnvelope {
            kind: if is_prekey {
                EnvelopeKind::PreKey
            } else {
                EnvelopeKind::Message
            },
            data,
        })
    }
}

impl SessionManager {
    pub fn new(store: Store, uuid: impl Into<String>, skip_window: u32) -> Self {
        Self {
            store,
            uuid: uuid.into(),
            locks: PeerSessionLocks::new(),
            skip_window,
            identity_changes: None,
        }
    }

    /// Receive the JID of every peer device whose identity key changed.
    pub fn with_identity_listener(mut self, tx: mpsc::UnboundedSender<Jid>) -> Self {
        self.identity_changes = Some(tx);
        self
    }

    pub async fn has_session(&self, peer: &Jid) -> Result<bool> {
        Ok(self
            .store
            .load_peer_session(&self.uuid, &peer_address(peer))
            .await?
            .is_some())
    }

    /// Open the session with `peer`, fetching a prekey bundle and running X3DH if none exists.
    pub async fn get_or_create_peer_session(
        &self,
        local: &Device,
        peer: &Jid,
        fetcher: &dyn PreKeyFetcher,
    ) -> Result<PeerSession<'_>> {
        let bundles = if self.has_session(peer).await? {
            HashMap::new()
        } else {
            fetcher.fetch_prekey_bundles(std::slice::from_ref(peer)).await?
        };
        self.open(local, peer, &bundles).await
    }

    async fn open(
        &self,
        local: &Device,
        peer: &Jid,
        bundles: &HashMap<Jid, PreKeyBundle>,
    ) -> Result<PeerSession<'_>> {
        let address = peer_address(peer);
        let guard = self.locks.lock(&address).await;
        let record = match self.store.load_peer_session(&self.uuid, &address).await? {
            Some(record) => record,
            None => {
                let bundle = bundles.get(peer).ok_or_else(|| {
                    Error::SessionMismatch(format!("no prekey bundle for {}", peer))
                })?;
                let record =
                    SessionRecord::initiate(&local.identity, local.registration_id, bundle)?;
                self.check_identity(peer, &address, &record.remote_identity)
                    .await?;
                debug!(%peer, "created session from prekey bundle");
                record
            }
        };
        Ok(PeerSession {
            manager: self,
            peer: peer.clone(),
            address,
            record,
            _guard: guard,
        })
    }

    pub async fn encrypt_for(
        &self,
        local: &Device,
        peer: &Jid,
        plaintext: &[u8],
        fetcher: &dyn PreKeyFetcher,
    ) -> Result<CipherEnvelope> {
        let mut session = self.get_or_create_peer_session(local, peer, fetcher).await?;
        session.encrypt(local, plaintext).await
    }

    /// Encrypt the same payload for every device. Bundles for devices without a session are
    /// fetched in one request; a failure for one device never aborts the others.
    pub async fn encrypt_for_devices(
        &self,
        local: &Device,
        peers: &[Jid],
        plaintext: &[u8],
        fetcher: &dyn PreKeyFetcher,
    ) -> Result<Vec<(Jid, Result<CipherEnvelope>)>> {
        let mut missing = Vec::new();
        for peer in peers {
            if !self.has_session(peer).await? {
                missing.push(peer.clone());
            }
        }
        let bundles = if missing.is_empty() {
            HashMap::new()
        } else {
            fetcher.fetch_prekey_bundles(&missing).await?
        };

        let results = futures::future::join_all(peers.iter().map(|peer| {
            let bundles = &bundles;
            async move {
                let result: Result<CipherEnvelope> = async {
                    let mut session = self.open(local, peer, bundles).await?;
                    session.encrypt(local, plaintext).await
                }
                .await;
                if let Err(e) = &result {
                    warn!(%peer, error = %e, "encrypt for device failed");
                }
                (peer.clone(), result)
            }
        }))
        .await;
        Ok(results)
    }

    /// Decrypt an envelope from `sender`. The session is only persisted if decryption succeeded.
    pub async fn decrypt(
        &self,
        local: &Device,
        sender: &Jid,
        env: &CipherEnvelope,
    ) -> Result<Decrypted> {
        let address = peer_address(sender);
        let _guard = self.locks.lock(&address).await;
        let existing = self.store.load_peer_session(&self.uuid, &address).await?;

        let (mut record, inner, consumed_prekey, new_session) = match env.kind {
            EnvelopeKind::PreKey => {
                let msg: PreKeySignalMessage = envelope::deserialize(&env.data)?;
                let base_key = ratchet::key32(&msg.base_key, "base key")?;
                match existing {
                    Some(record) if record.base_key == base_key => (record, msg.message, None, false),
                    _ => {
                        let signed = local.find_signed_prekey(msg.signed_pre_key_id).ok_or_else(|| {
                            Error::SessionMismatch(format!(
                                "unknown signed prekey {}",
                                msg.signed_pre_key_id
                            ))
                        })?;
                        let one_time = match msg.pre_key_id {
                            Some(id) => Some(local.prekeys.get(&id).ok_or_else(|| {
                                Error::SessionMismatch(format!("prekey {} already consumed", id))
                            })?),
                            None => None,
                        };
                        let record = SessionRecord::respond(
                            &local.identity,
                            local.registration_id,
                            &signed.key_pair,
                            one_time.map(|k| &k.key_pair),
                            IdentityKey::from_bytes(&msg.identity_key)?,
                            msg.registration_id,
                            base_key,
                        )?;
                        (record, msg.message, msg.pre_key_id, true)
                    }
                }
            }
            EnvelopeKind::Message => {
                let record = existing
                    .ok_or_else(|| Error::SessionMismatch(format!("no session with {}", sender)))?;
                (record, env.data.clone(), None, false)
            }
        };

        let plaintext = record.decrypt(&local.identity.public(), &inner, self.skip_window)?;
        let identity_changed = self
            .check_identity(sender, &address, &record.remote_identity)
            .await?;
        self.store
            .store_peer_session(&self.uuid, &address, &record)
            .await?;
        Ok(Decrypted {
            plaintext,
            consumed_prekey,
            new_session,
            identity_changed,
        })
    }

    pub async fn delete_session(&self, peer: &Jid) -> Result<()> {
        let address = peer_address(peer);
        let _guard = self.locks.lock(&address).await;
        self.store.delete_peer_session(&self.uuid, &address).await
    }

    /// Drop the sessions of every device of `user`.
    pub async fn delete_user_sessions(&self, user: &Jid) -> Result<()> {
        self.store.delete_peer_sessions(&self.uuid, user).await
    }

    /// Trust on first use. A changed key is accepted, stored and reported.
    async fn check_identity(&self, peer: &Jid, address: &str, key: &IdentityKey) -> Result<bool> {
        let changed = match self.store.load_identity(&self.uuid, address).await? {
            Some(known) if known == *key => return Ok(false),
            Some(_) => true,
            None => false,
        };
        self.store.save_identity(&self.uuid, address, key).await?;
        if changed {
            warn!(%peer, "peer identity key changed");
            if let Some(tx) = &self.identity_changes {
                let _ = tx.send(peer.clone());
            }
        }
        Ok(changed)
    }
}
