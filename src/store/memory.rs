use super::{address_belongs_to, Device, DeviceStore};
use crate::signal::{IdentityKey, SessionRecord};
use crate::types::Jid;
use crate::{error::StoreError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

type Keyed<T> = RwLock<HashMap<(String, String), T>>;

/// In-memory device store (for testing or single-run; not persistent).
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, Device>>,
    sessions: Keyed<SessionRecord>,
    identities: Keyed<IdentityKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(uuid: &str, address: &str) -> (String, String) {
    (uuid.to_string(), address.to_string())
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn load(&self, uuid: &str) -> Result<Device> {
        let devices = self
            .devices
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(devices
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(uuid.to_string()))?)
    }

    async fn save(&self, device: &Device) -> Result<()> {
        self.devices
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .insert(device.uuid.clone(), device.clone());
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> Result<()> {
        self.devices
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .remove(uuid);
        self.sessions
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .retain(|(u, _), _| u != uuid);
        self.identities
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .retain(|(u, _), _| u != uuid);
        Ok(())
    }

    async fn get_all_devices(&self) -> Result<Vec<Device>> {
        let devices = self
            .devices
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        let mut all: Vec<Device> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(all)
    }

    async fn delete_all_devices(&self) -> Result<()> {
        self.devices
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .clear();
        self.sessions
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .clear();
        self.identities
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .clear();
        Ok(())
    }

    async fn load_peer_session(&self, uuid: &str, address: &str) -> Result<Option<SessionRecord>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(sessions.get(&key(uuid, address)).cloned())
    }

    async fn store_peer_session(
        &self,
        uuid: &str,
        address: &str,
        record: &SessionRecord,
    ) -> Result<()> {
        self.sessions
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .insert(key(uuid, address), record.clone());
        Ok(())
    }

    async fn delete_peer_session(&self, uuid: &str, address: &str) -> Result<()> {
        self.sessions
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .remove(&key(uuid, address));
        Ok(())
    }

    async fn delete_peer_sessions(&self, uuid: &str, user: &Jid) -> Result<()> {
        self.sessions
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .retain(|(u, addr), _| !(u == uuid && address_belongs_to(addr, user)));
        Ok(())
    }

    async fn load_identity(&self, uuid: &str, address: &str) -> Result<Option<IdentityKey>> {
        let identities = self
            .identities
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(identities.get(&key(uuid, address)).copied())
    }

    async fn save_identity(&self, uuid: &str, address: &str, identity: &IdentityKey) -> Result<()> {
        self.identities
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .insert(key(uuid, address), *identity);
        Ok(())
    }
}
