use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::events::DiscoveryEvent;
use super::mapped::{MappedDiscovery, ServiceMapper};
use super::registry::{DiscoverySource, Service};
use super::timed::{Searcher, TimedDiscovery, TimedDiscoveryConfig};
use crate::device::{Device, DeviceInfo, ModelRegistry};
use crate::error::Result;
use crate::network::{ConnectOptions, NetworkEvent, NetworkManager, NetworkRef};
use crate::token::Token;

/// A device sighting, as published by [`DeviceBrowser`].
#[derive(Debug, Clone)]
pub struct DeviceService {
    pub id: u32,
    pub address: IpAddr,
    pub port: u16,
    pub token: Option<Token>,
    pub auto_token: bool,
    pub model: Option<String>,
}

impl DeviceService {
    fn from_info(info: &Arc<DeviceInfo>) -> Option<Self> {
        Some(Self {
            id: info.id()?,
            address: info.address(),
            port: info.port(),
            token: info.token(),
            auto_token: info.auto_token(),
            model: info.model(),
        })
    }
}

impl Service for DeviceService {
    fn id(&self) -> String {
        self.id.to_string()
    }
}

struct NetworkSearcher {
    network: NetworkManager,
}

#[async_trait]
impl Searcher for NetworkSearcher {
    async fn search(&self) {
        self.network.search().await;
    }
}

/// Timed discovery of devices on the local network.
///
/// Searching broadcasts handshakes through the network manager; devices
/// that answer show up as [`DeviceService`] records and are evicted once
/// they stop answering. Holds a network reference between `start` and
/// `stop` so the shared socket stays alive.
pub struct DeviceBrowser {
    network: NetworkManager,
    discovery: Arc<TimedDiscovery<DeviceService>>,
    reference: Mutex<Option<NetworkRef>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceBrowser {
    pub fn new(network: NetworkManager, config: TimedDiscoveryConfig) -> Self {
        let searcher = Arc::new(NetworkSearcher {
            network: network.clone(),
        });
        Self {
            network,
            discovery: Arc::new(TimedDiscovery::new(searcher, config)),
            reference: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn with_defaults(network: NetworkManager) -> Self {
        Self::new(network, TimedDiscoveryConfig::default())
    }

    /// Acquire the socket and start searching. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.reference.lock().is_some() {
            return Ok(());
        }
        let reference = self.network.acquire().await?;
        {
            let mut slot = self.reference.lock();
            if slot.is_some() {
                // Lost a start race; the extra reference is dropped
                return Ok(());
            }
            *slot = Some(reference);
        }

        let mut events = self.network.subscribe();
        let discovery = self.discovery.clone();
        *self.listener.lock() = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(NetworkEvent::DeviceSeen { device }) => {
                        if let Some(service) = DeviceService::from_info(&device) {
                            discovery.add_service(service);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Device browser lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        self.discovery.start();
        Ok(())
    }

    /// Stop searching and release the socket reference. Idempotent.
    pub fn stop(&self) {
        self.discovery.stop();
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        if let Some(mut reference) = self.reference.lock().take() {
            reference.release();
        }
    }

    pub fn get(&self, id: &str) -> Option<DeviceService> {
        self.discovery.get(id)
    }

    pub fn list(&self) -> Vec<DeviceService> {
        self.discovery.list()
    }
}

impl DiscoverySource<DeviceService> for DeviceBrowser {
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<DeviceService>> {
        self.discovery.subscribe()
    }
}

impl Drop for DeviceBrowser {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ConnectMapper {
    network: NetworkManager,
    registry: Arc<ModelRegistry>,
}

#[async_trait]
impl ServiceMapper<DeviceService, Device> for ConnectMapper {
    async fn map(&self, service: DeviceService) -> Result<Device> {
        let mut options = ConnectOptions::new(service.address).port(service.port);
        if let Some(token) = service.token {
            options = options.token(token);
        }
        let info = self.network.connect(options).await?;
        Ok(self.registry.create(info))
    }
}

/// Browser sightings piped through connect and the model registry: the
/// registry of ready-to-use [`Device`] handles.
pub struct Devices {
    inner: MappedDiscovery<DeviceService, Device>,
}

impl Devices {
    pub fn new(
        browser: &DeviceBrowser,
        network: NetworkManager,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        let mapper = Arc::new(ConnectMapper { network, registry });
        Self {
            inner: MappedDiscovery::new(browser, mapper),
        }
    }

    pub fn start(&self) {
        self.inner.start();
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.inner.get(id)
    }

    pub fn list(&self) -> Vec<Device> {
        self.inner.list()
    }
}

impl DiscoverySource<Device> for Devices {
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<Device>> {
        self.inner.subscribe()
    }
}
