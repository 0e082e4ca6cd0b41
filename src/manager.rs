//! Multi-account client registry.
//!
//! A [`ClientManager`] owns every live [`Client`] of one store. Clients are keyed by
//! account identifier; the shared [`DeviceLeases`] table guarantees that only one
//! client runs per account at a time.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{Error, StoreError};
use crate::media::BlobTransport;
use crate::store::{Device, DeviceLeases, Store};
use crate::transport::Connector;
use crate::types::Jid;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct ClientManager {
    store: Store,
    config: ClientConfig,
    leases: DeviceLeases,
    connector: Option<Arc<dyn Connector>>,
    blobs: Option<Arc<dyn BlobTransport>>,
    clients: Mutex<HashMap<String, Client>>,
}

impl ClientManager {
    pub fn new(store: Store, config: ClientConfig) -> Self {
        Self {
            store,
            config,
            leases: DeviceLeases::new(),
            connector: None,
            blobs: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Dialer handed to every client this manager creates.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_blob_transport(mut self, blobs: Arc<dyn BlobTransport>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<String, Client>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Client for an account. A JID selects the account by its user part and wins over
    /// `uuid`; at least one of the two is required. Unknown accounts start unpaired.
    pub async fn new_client(&self, uuid: Option<&str>, jid: Option<&Jid>) -> Result<Client> {
        let key = match (jid, uuid) {
            (Some(jid), _) => jid.user.clone(),
            (None, Some(uuid)) => uuid.to_string(),
            (None, None) => {
                return Err(Error::Other(anyhow::anyhow!(
                    "a uuid or a jid is required to create a client"
                )))
            }
        };
        if let Some(client) = self.clients().get(&key) {
            return Ok(client.clone());
        }

        let device = match self.store.load(&key).await {
            Ok(device) => device,
            Err(Error::Store(StoreError::NotFound(_))) => {
                debug!(uuid = %key, "no stored device, starting unpaired");
                let device = Device::new(key.clone());
                self.store.save(&device).await?;
                device
            }
            Err(e) => return Err(e),
        };
        self.register(device)
    }

    /// Client for a brand new account under a random identifier, ready to pair.
    pub async fn create_client(&self) -> Result<Client> {
        let device = Device::new(uuid::Uuid::new_v4().to_string());
        self.store.save(&device).await?;
        self.register(device)
    }

    fn register(&self, device: Device) -> Result<Client> {
        let uuid = device.uuid.clone();
        let mut builder = Client::builder(Arc::clone(&self.store), device)
            .config(self.config.clone())
            .leases(self.leases.clone());
        if let Some(connector) = &self.connector {
            builder = builder.connector(Arc::clone(connector));
        }
        if let Some(blobs) = &self.blobs {
            builder = builder.blob_transport(Arc::clone(blobs));
        }
        let client = builder.build()?;
        self.clients().insert(uuid, client.clone());
        Ok(client)
    }

    pub fn get_client(&self, uuid: &str) -> Option<Client> {
        self.clients().get(uuid).cloned()
    }

    pub fn clients_snapshot(&self) -> Vec<Client> {
        self.clients().values().cloned().collect()
    }

    /// Every device in the store, running or not.
    pub async fn get_all_devices(&self) -> Result<Vec<Device>> {
        self.store.get_all_devices().await
    }

    /// Create a client for every stored device and connect them concurrently.
    /// Returns the outcome per account.
    pub async fn connect_all(&self) -> Result<Vec<(String, Result<()>)>> {
        for device in self.get_all_devices().await? {
            if self.get_client(&device.uuid).is_none() {
                self.register(device)?;
            }
        }
        let clients = self.clients_snapshot();
        let results = futures::future::join_all(clients.iter().map(|c| async move {
            let result = c.connect().await;
            if let Err(e) = &result {
                warn!(uuid = %c.uuid(), error = %e, "client failed to connect");
            }
            (c.uuid().to_string(), result)
        }))
        .await;
        info!(clients = results.len(), "connected all clients");
        Ok(results)
    }

    /// Disconnect and drop one client, releasing its device.
    pub async fn remove_client(&self, uuid: &str) -> bool {
        let client = self.clients().remove(uuid);
        match client {
            Some(client) => {
                client.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Disconnect every client and release all devices.
    pub async fn close_all(&self) {
        let clients: Vec<Client> = self.clients().drain().map(|(_, c)| c).collect();
        futures::future::join_all(clients.iter().map(|c| c.disconnect())).await;
        debug!(clients = clients.len(), "closed all clients");
    }
}
