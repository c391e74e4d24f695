use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use crate::jid;

/// Durable credential set for one linked device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Storage key, stable for the life of the device.
    pub device_id: String,
    /// Resolved network identity, set once the device has authenticated.
    pub jid: Option<String>,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            jid: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.jid.is_some()
    }

    /// Phone-number part of the resolved identity.
    pub fn phone(&self) -> Option<&str> {
        self.jid.as_deref().map(jid::user_of)
    }
}

/// Device identity storage shared by all clients of one factory.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list(&self) -> Result<Vec<DeviceIdentity>>;

    /// Allocate a fresh, unauthenticated identity.
    async fn create(&self) -> Result<DeviceIdentity>;

    /// Insert or replace an identity.
    async fn save(&self, device: &DeviceIdentity) -> Result<()>;

    async fn delete(&self, device_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_comes_from_jid_user() {
        let mut device = DeviceIdentity::new("dev-1");
        assert!(!device.is_authenticated());
        assert_eq!(device.phone(), None);

        device.jid = Some("6281234567890:12@s.whatsapp.net".into());
        assert!(device.is_authenticated());
        assert_eq!(device.phone(), Some("6281234567890"));
    }
}
