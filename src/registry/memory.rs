//! In-memory registries.
//!
//! Reference backend for tests and single-node development deployments.
//! A map-wide mutex makes every transform trivially linearizable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::device::{EndDevice, Eui64, SessionKeys};
use crate::error::Error;
use crate::registry::{DeviceRegistry, DeviceTransform, KeyRegistry, KeysTransform};

#[derive(Default, Clone)]
pub struct MemoryDeviceRegistry {
    devices: Arc<Mutex<HashMap<(Eui64, Eui64), EndDevice>>>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    async fn get_by_eui(&self, join_eui: Eui64, dev_eui: Eui64) -> Result<EndDevice, Error> {
        self.devices
            .lock()
            .get(&(join_eui, dev_eui))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("end device {:016X}/{:016X}", join_eui, dev_eui)))
    }

    async fn set_by_eui(
        &self,
        join_eui: Eui64,
        dev_eui: Eui64,
        transform: DeviceTransform,
    ) -> Result<EndDevice, Error> {
        let mut devices = self.devices.lock();
        let current = devices.get(&(join_eui, dev_eui)).cloned();
        let updated = transform(current.clone())?;
        if current.as_ref() != Some(&updated) {
            devices.insert((join_eui, dev_eui), updated.clone());
        }
        Ok(updated)
    }
}

#[derive(Default, Clone)]
pub struct MemoryKeyRegistry {
    keys: Arc<Mutex<HashMap<(Eui64, String), SessionKeys>>>,
}

impl MemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRegistry for MemoryKeyRegistry {
    async fn get_by_id(
        &self,
        dev_eui: Eui64,
        session_key_id: &str,
    ) -> Result<SessionKeys, Error> {
        self.keys
            .lock()
            .get(&(dev_eui, session_key_id.to_owned()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session keys {}", session_key_id)))
    }

    async fn set_by_id(
        &self,
        dev_eui: Eui64,
        session_key_id: &str,
        transform: KeysTransform,
    ) -> Result<SessionKeys, Error> {
        let mut keys = self.keys.lock();
        let entry = (dev_eui, session_key_id.to_owned());
        let current = keys.get(&entry).cloned();
        let updated = transform(current.clone())?;
        if current.as_ref() != Some(&updated) {
            keys.insert(entry, updated.clone());
        }
        Ok(updated)
    }
}
