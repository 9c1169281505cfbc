//! Registry contracts for device and session-key state.
//!
//! Both registries expose a read and a transform-based write. The write
//! loads the current record, applies the caller's closure and persists the
//! result; implementations must make this read-modify-write linearizable
//! per key with respect to concurrent writes of the same key. A closure
//! error aborts the write and propagates unchanged.

pub mod memory;

use async_trait::async_trait;

use crate::device::{EndDevice, Eui64, SessionKeys};
use crate::error::Error;

/// Device update closure. Receives `None` when the record does not exist;
/// returning a device then creates it.
pub type DeviceTransform = Box<dyn FnOnce(Option<EndDevice>) -> Result<EndDevice, Error> + Send>;

/// Session-key update closure. Receives the existing record, if any.
pub type KeysTransform = Box<dyn FnOnce(Option<SessionKeys>) -> Result<SessionKeys, Error> + Send>;

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Consistent read by (JoinEUI, DevEUI).
    async fn get_by_eui(&self, join_eui: Eui64, dev_eui: Eui64) -> Result<EndDevice, Error>;

    /// Read-modify-write by (JoinEUI, DevEUI). Implementations may elide
    /// the write when the transform returns the record unchanged.
    async fn set_by_eui(
        &self,
        join_eui: Eui64,
        dev_eui: Eui64,
        transform: DeviceTransform,
    ) -> Result<EndDevice, Error>;
}

#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Read by (DevEUI, session key id); the peer read-back path.
    async fn get_by_id(&self, dev_eui: Eui64, session_key_id: &str)
        -> Result<SessionKeys, Error>;

    /// Read-modify-write by (DevEUI, session key id).
    async fn set_by_id(
        &self,
        dev_eui: Eui64,
        session_key_id: &str,
        transform: KeysTransform,
    ) -> Result<SessionKeys, Error>;
}
