use crate::error::StoreError;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Tracks which account identifiers have a live client. At most one client may
/// drive a device at a time.
#[derive(Clone, Default)]
pub struct DeviceLeases {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `uuid`. Fails with `StoreError::DeviceInUse` if another client holds it.
    pub fn acquire(&self, uuid: &str) -> Result<DeviceLease> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(uuid.to_string()) {
            return Err(StoreError::DeviceInUse(uuid.to_string()).into());
        }
        Ok(DeviceLease {
            uuid: uuid.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, uuid: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(uuid)
    }
}

/// Released when dropped.
#[derive(Debug)]
pub struct DeviceLease {
    uuid: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceLease {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.uuid);
    }
}

/// One async mutex per peer session address. Operations on different peers run
/// concurrently; operations on the same peer are serialized.
#[derive(Default)]
pub struct PeerSessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PeerSessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, address: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // drop entries nobody is waiting on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(address.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let leases = DeviceLeases::new();
        let lease = leases.acquire("a").unwrap();
        assert!(matches!(
            leases.acquire("a").unwrap_err(),
            Error::Store(StoreError::DeviceInUse(_))
        ));
        assert!(leases.acquire("b").is_ok());
        drop(lease);
        assert!(!leases.is_held("a"));
        assert!(leases.acquire("a").is_ok());
    }

    #[tokio::test]
    async fn same_peer_is_serialized() {
        let locks = Arc::new(PeerSessionLocks::new());
        let guard = locks.lock("1@s.whatsapp.net").await;

        let l = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = l.lock("1@s.whatsapp.net").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // a different peer is not blocked
        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock("2@s.whatsapp.net")).await;
        assert!(other.is_ok());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
