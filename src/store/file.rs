//! JSON file store: one document per account identifier holding the device and the
//! trusted identities, plus one file per peer session under `<uuid>.sessions/`.
//!
//! Writes go to a temporary file that is renamed over the previous one, so a crash
//! leaves either the old or the new state on disk, never a torn one. Session files are
//! written without the account lock; writers of one peer session are serialized by
//! [`PeerSessionLocks`](super::PeerSessionLocks).

use super::{address_belongs_to, Device, DeviceStore};
use crate::error::StoreError;
use crate::signal::{IdentityKey, SessionRecord};
use crate::types::Jid;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Version written into every document. Documents with another version are refused.
pub const SCHEMA_VERSION: u32 = 2;

const EXTENSION: &str = "json";
const SESSIONS_EXTENSION: &str = "sessions";

#[derive(Clone, Serialize, Deserialize)]
struct Document {
    schema_version: u32,
    device: Device,
    #[serde(default)]
    identities: BTreeMap<String, IdentityKey>,
}

#[derive(Serialize, Deserialize)]
struct SessionDocument {
    schema_version: u32,
    address: String,
    record: SessionRecord,
}

/// Persistent store backed by a directory of JSON documents.
pub struct FileStore {
    dir: PathBuf,
    docs: RwLock<HashMap<String, Arc<RwLock<Document>>>>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Load(format!("{}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            docs: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", uuid, EXTENSION))
    }

    fn sessions_dir(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", uuid, SESSIONS_EXTENSION))
    }

    /// Session file for a peer address. Addresses are hex encoded so any JID is a valid
    /// file name.
    fn session_path(&self, uuid: &str, address: &str) -> PathBuf {
        self.sessions_dir(uuid)
            .join(format!("{}.{}", hex::encode(address), EXTENSION))
    }

    async fn read_raw(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Load(format!("{}: {}", path.display(), e)).into()),
        }
    }

    async fn read_document(path: &Path) -> Result<Option<Document>> {
        match Self::read_raw(path).await? {
            Some(raw) => parse_versioned(&raw).map(Some),
            None => Ok(None),
        }
    }

    async fn write_atomic(path: &Path, raw: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!("{}.tmp", EXTENSION));
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| StoreError::Save(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Save(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn remove_if_present(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Save(format!("{}: {}", path.display(), e)).into()),
        }
    }

    /// Addresses with a stored session for `uuid`.
    async fn session_addresses(&self, uuid: &str) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.sessions_dir(uuid)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Load(e.to_string()).into()),
        };
        let mut addresses = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Load(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| hex::decode(s).ok())
                .and_then(|b| String::from_utf8(b).ok());
            match decoded {
                Some(address) => addresses.push(address),
                None => warn!(path = %path.display(), "skipping unrecognized session file"),
            }
        }
        Ok(addresses)
    }

    /// Cached document for `uuid`, loading it from disk on first use.
    async fn document(&self, uuid: &str) -> Result<Option<Arc<RwLock<Document>>>> {
        if let Some(doc) = self.docs.read().await.get(uuid) {
            return Ok(Some(Arc::clone(doc)));
        }
        let Some(doc) = Self::read_document(&self.path_for(uuid)).await? else {
            return Ok(None);
        };
        let mut docs = self.docs.write().await;
        let entry = docs
            .entry(uuid.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(doc)));
        Ok(Some(Arc::clone(entry)))
    }

    async fn require_document(&self, uuid: &str) -> Result<Arc<RwLock<Document>>> {
        self.document(uuid)
            .await?
            .ok_or_else(|| StoreError::NotFound(uuid.to_string()).into())
    }

    async fn persist(&self, doc: &Document) -> Result<()> {
        let path = self.path_for(&doc.device.uuid);
        let raw = serde_json::to_vec_pretty(doc).map_err(|e| StoreError::Save(e.to_string()))?;
        Self::write_atomic(&path, &raw).await?;
        debug!(uuid = %doc.device.uuid, bytes = raw.len(), "store document written");
        Ok(())
    }

    /// Apply `f` to the document and write it back. The in-memory copy only changes
    /// once the write succeeded.
    async fn update<F>(&self, uuid: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Document) + Send,
    {
        let doc = self.require_document(uuid).await?;
        let mut guard = doc.write().await;
        let mut next = guard.clone();
        f(&mut next);
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn stored_uuids(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::Load(e.to_string()))?;
        let mut uuids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Load(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                uuids.push(stem.to_string());
            }
        }
        uuids.sort();
        Ok(uuids)
    }
}

fn parse_versioned<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let found = value
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| StoreError::Corrupt("missing schema_version".into()))?;
    if found != u64::from(SCHEMA_VERSION) {
        return Err(StoreError::SchemaMismatch {
            found: u32::try_from(found).unwrap_or(u32::MAX),
            expected: SCHEMA_VERSION,
        }
        .into());
    }
    Ok(serde_json::from_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))?)
}

#[async_trait]
impl DeviceStore for FileStore {
    async fn load(&self, uuid: &str) -> Result<Device> {
        let doc = self.require_document(uuid).await?;
        let device = doc.read().await.device.clone();
        Ok(device)
    }

    async fn save(&self, device: &Device) -> Result<()> {
        if self.document(&device.uuid).await?.is_some() {
            let device = device.clone();
            return self
                .update(&device.uuid.clone(), move |d| d.device = device)
                .await;
        }
        let doc = Document {
            schema_version: SCHEMA_VERSION,
            device: device.clone(),
            identities: BTreeMap::new(),
        };
        self.persist(&doc).await?;
        self.docs
            .write()
            .await
            .insert(device.uuid.clone(), Arc::new(RwLock::new(doc)));
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> Result<()> {
        self.docs.write().await.remove(uuid);
        match tokio::fs::remove_dir_all(self.sessions_dir(uuid)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Save(e.to_string()).into()),
        }
        Self::remove_if_present(&self.path_for(uuid)).await
    }

    async fn get_all_devices(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for uuid in self.stored_uuids().await? {
            match self.document(&uuid).await? {
                Some(doc) => devices.push(doc.read().await.device.clone()),
                None => warn!(%uuid, "store document vanished while listing"),
            }
        }
        Ok(devices)
    }

    async fn delete_all_devices(&self) -> Result<()> {
        for uuid in self.stored_uuids().await? {
            self.delete(&uuid).await?;
        }
        self.docs.write().await.clear();
        Ok(())
    }

    async fn load_peer_session(&self, uuid: &str, address: &str) -> Result<Option<SessionRecord>> {
        let Some(raw) = Self::read_raw(&self.session_path(uuid, address)).await? else {
            return Ok(None);
        };
        let doc: SessionDocument = parse_versioned(&raw)?;
        Ok(Some(doc.record))
    }

    async fn store_peer_session(
        &self,
        uuid: &str,
        address: &str,
        record: &SessionRecord,
    ) -> Result<()> {
        self.require_document(uuid).await?;
        let doc = SessionDocument {
            schema_version: SCHEMA_VERSION,
            address: address.to_string(),
            record: record.clone(),
        };
        let raw = serde_json::to_vec(&doc).map_err(|e| StoreError::Save(e.to_string()))?;
        let dir = self.sessions_dir(uuid);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Save(format!("{}: {}", dir.display(), e)))?;
        Self::write_atomic(&self.session_path(uuid, address), &raw).await
    }

    async fn delete_peer_session(&self, uuid: &str, address: &str) -> Result<()> {
        self.require_document(uuid).await?;
        Self::remove_if_present(&self.session_path(uuid, address)).await
    }

    async fn delete_peer_sessions(&self, uuid: &str, user: &Jid) -> Result<()> {
        self.require_document(uuid).await?;
        for address in self.session_addresses(uuid).await? {
            if address_belongs_to(&address, user) {
                Self::remove_if_present(&self.session_path(uuid, &address)).await?;
            }
        }
        Ok(())
    }

    async fn load_identity(&self, uuid: &str, address: &str) -> Result<Option<IdentityKey>> {
        let Some(doc) = self.document(uuid).await? else {
            return Ok(None);
        };
        let key = doc.read().await.identities.get(address).copied();
        Ok(key)
    }

    async fn save_identity(&self, uuid: &str, address: &str, key: &IdentityKey) -> Result<()> {
        let key = *key;
        self.update(uuid, |doc| {
            doc.identities.insert(address.to_string(), key);
        })
        .await
    }
}
