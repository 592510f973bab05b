use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::events::DiscoveryEvent;
use super::registry::{DiscoverySource, Service, ServiceRegistry};
use crate::error::Result;

/// Async transformation applied to every discovered service, for example
/// connecting to it.
#[async_trait]
pub trait ServiceMapper<S, T>: Send + Sync + 'static {
    async fn map(&self, service: S) -> Result<T>;
}

/// Tracking for one parent id: how many times it has been sighted, and the
/// id its mapped result was registered under.
#[derive(Default)]
struct MapState {
    version: u64,
    mapped_id: Option<String>,
}

/// A registry fed by piping a parent registry through a [`ServiceMapper`].
///
/// Mapping runs concurrently with the event stream, so each id carries a
/// version counter: a result that resolves after a newer sighting of the
/// same id is discarded. Mapper failures are swallowed; the next parent
/// event retries the mapping.
pub struct MappedDiscovery<S: Service, T: Service> {
    registry: Arc<ServiceRegistry<T>>,
    states: Arc<Mutex<HashMap<String, MapState>>>,
    mapper: Arc<dyn ServiceMapper<S, T>>,
    parent_events: broadcast::Receiver<DiscoveryEvent<S>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Service, T: Service> MappedDiscovery<S, T> {
    pub fn new(parent: &dyn DiscoverySource<S>, mapper: Arc<dyn ServiceMapper<S, T>>) -> Self {
        Self {
            registry: Arc::new(ServiceRegistry::new()),
            states: Arc::new(Mutex::new(HashMap::new())),
            mapper,
            parent_events: parent.subscribe(),
            task: Mutex::new(None),
        }
    }

    /// Start consuming parent events. Idempotent.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let registry = self.registry.clone();
        let states = self.states.clone();
        let mapper = self.mapper.clone();
        let mut events = self.parent_events.resubscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DiscoveryEvent::Available(service))
                    | Ok(DiscoveryEvent::Updated(service)) => {
                        let id = service.id();
                        let version = {
                            let mut states = states.lock();
                            let state = states.entry(id.clone()).or_default();
                            state.version += 1;
                            state.version
                        };

                        let registry = registry.clone();
                        let states = states.clone();
                        let mapper = mapper.clone();
                        tokio::spawn(async move {
                            match mapper.map(service).await {
                                Ok(mapped) => {
                                    let current = {
                                        let mut states = states.lock();
                                        match states.get_mut(&id) {
                                            Some(state) if state.version == version => {
                                                state.mapped_id = Some(mapped.id());
                                                true
                                            }
                                            _ => false,
                                        }
                                    };
                                    if current {
                                        registry.add_service(mapped);
                                    } else {
                                        debug!("Discarding stale mapping for {}", id);
                                    }
                                }
                                Err(err) => {
                                    debug!("Could not map service {}: {}", id, err);
                                }
                            }
                        });
                    }
                    Ok(DiscoveryEvent::Unavailable(service)) => {
                        let id = service.id();
                        let mapped_id = states.lock().remove(&id).and_then(|s| s.mapped_id);
                        if let Some(mapped_id) = mapped_id {
                            registry.remove_service(&mapped_id);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Mapped discovery lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Stop consuming parent events. Idempotent. Mapped services stay
    /// registered.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<T> {
        self.registry.list()
    }
}

impl<S: Service, T: Service> DiscoverySource<T> for MappedDiscovery<S, T> {
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<T>> {
        self.registry.subscribe()
    }
}

impl<S: Service, T: Service> Drop for MappedDiscovery<S, T> {
    fn drop(&mut self) {
        self.stop();
    }
}
