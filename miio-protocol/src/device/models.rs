use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::info::{CallOptions, DeviceInfo};
use crate::discovery::registry::Service;
use crate::error::Result;

/// Builds a typed handle for a device record. Registered per model string.
pub type ModelFactory = Box<dyn Fn(Arc<DeviceInfo>) -> Device + Send + Sync>;

/// Cloneable handle for talking to one device.
///
/// The `category` is a coarse capability label ("generic" unless a model
/// factory knows better); semantic APIs for specific models are layered on
/// top of [`Device::call`] by downstream crates.
#[derive(Debug, Clone)]
pub struct Device {
    info: Arc<DeviceInfo>,
    category: String,
}

impl Device {
    pub fn new(info: Arc<DeviceInfo>) -> Self {
        Self::with_category(info, "generic")
    }

    pub fn with_category(info: Arc<DeviceInfo>, category: impl Into<String>) -> Self {
        Self {
            info,
            category: category.into(),
        }
    }

    pub fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn device_id(&self) -> Option<u32> {
        self.info.id()
    }

    pub fn model(&self) -> Option<String> {
        self.info.model()
    }

    pub fn address(&self) -> IpAddr {
        self.info.address()
    }

    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        self.info.call(method, params, options).await
    }
}

impl Service for Device {
    fn id(&self) -> String {
        match self.info.id() {
            Some(id) => id.to_string(),
            None => self.info.address().to_string(),
        }
    }
}

/// Registry of model-specific device constructors, consulted once a record
/// has been enriched. Unknown models get the generic handle.
#[derive(Default)]
pub struct ModelRegistry {
    factories: HashMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: impl Into<String>, factory: ModelFactory) {
        self.factories.insert(model.into(), factory);
    }

    pub fn create(&self, info: Arc<DeviceInfo>) -> Device {
        if let Some(model) = info.model() {
            if let Some(factory) = self.factories.get(&model) {
                return factory(info);
            }
            debug!("No specific handle for model {}, using generic", model);
        }
        Device::new(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Weak;

    fn record() -> Arc<DeviceInfo> {
        DeviceInfo::new(Weak::new(), Some(1234), IpAddr::V4(Ipv4Addr::LOCALHOST), 54321)
    }

    #[test]
    fn test_unknown_model_falls_back_to_generic() {
        let registry = ModelRegistry::new();
        let device = registry.create(record());
        assert_eq!(device.category(), "generic");
        assert_eq!(device.device_id(), Some(1234));
    }

    #[test]
    fn test_registered_factory_is_consulted() {
        let mut registry = ModelRegistry::new();
        registry.register(
            "rockrobo.vacuum.v1",
            Box::new(|info| Device::with_category(info, "vacuum")),
        );

        // Without a model the registry cannot match a factory
        assert_eq!(registry.create(record()).category(), "generic");

        let info = record();
        info.set_model_for_test("rockrobo.vacuum.v1");
        assert_eq!(registry.create(info).category(), "vacuum");
    }

    #[test]
    fn test_service_id_prefers_device_id() {
        let device = Device::new(record());
        assert_eq!(Service::id(&device), "1234");
    }
}
