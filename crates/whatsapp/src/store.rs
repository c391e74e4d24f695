use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    dashmap::DashMap,
    rand::Rng,
    serde::{Deserialize, Serialize},
    tracing::debug,
    wagate_channels::{DeviceIdentity, DeviceStore},
};

use crate::error::DeviceStoreError;

const DEVICES_TREE: &str = "devices";

/// On-disk record. The device id is the tree key.
#[derive(Debug, Serialize, Deserialize)]
struct DeviceRecord {
    jid: Option<String>,
}

fn new_device_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

/// sled-backed identity store.
pub struct SledDeviceStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledDeviceStore {
    pub fn open(path: &Path) -> Result<Self, DeviceStoreError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(DEVICES_TREE)?;
        debug!(path = %path.display(), devices = tree.len(), "opened device store");
        Ok(Self { db, tree })
    }

    fn put(&self, device: &DeviceIdentity) -> Result<(), DeviceStoreError> {
        let record = DeviceRecord {
            jid: device.jid.clone(),
        };
        self.tree
            .insert(device.device_id.as_bytes(), postcard::to_allocvec(&record)?)?;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for SledDeviceStore {
    async fn list(&self) -> Result<Vec<DeviceIdentity>> {
        let mut devices = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (key, value) = entry.map_err(DeviceStoreError::from)?;
            let device_id = std::str::from_utf8(&key)
                .map_err(|_| DeviceStoreError::InvalidKey)?
                .to_string();
            let record: DeviceRecord =
                postcard::from_bytes(&value).map_err(DeviceStoreError::from)?;
            devices.push(DeviceIdentity {
                device_id,
                jid: record.jid,
            });
        }
        Ok(devices)
    }

    async fn create(&self) -> Result<DeviceIdentity> {
        let device = DeviceIdentity::new(new_device_id());
        self.put(&device)?;
        self.db.flush_async().await.map_err(DeviceStoreError::from)?;
        Ok(device)
    }

    async fn save(&self, device: &DeviceIdentity) -> Result<()> {
        self.put(device)?;
        self.db.flush_async().await.map_err(DeviceStoreError::from)?;
        Ok(())
    }

    async fn delete(&self, device_id: &str) -> Result<()> {
        self.tree
            .remove(device_id.as_bytes())
            .map_err(DeviceStoreError::from)?;
        self.db.flush_async().await.map_err(DeviceStoreError::from)?;
        Ok(())
    }
}

/// In-memory identity store.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: DashMap<String, DeviceIdentity>,
    created: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities ever allocated through [`DeviceStore::create`].
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of [`DeviceStore::delete`] calls, including ones for unknown ids.
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn list(&self) -> Result<Vec<DeviceIdentity>> {
        let mut devices: Vec<_> = self.devices.iter().map(|e| e.value().clone()).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn create(&self) -> Result<DeviceIdentity> {
        let device = DeviceIdentity::new(new_device_id());
        self.devices
            .insert(device.device_id.clone(), device.clone());
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(device)
    }

    async fn save(&self, device: &DeviceIdentity) -> Result<()> {
        self.devices
            .insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn delete(&self, device_id: &str) -> Result<()> {
        self.devices.remove(device_id);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
