use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::events::DiscoveryEvent;

/// Buffered events per subscriber; slow consumers skip, they are not waited
/// on.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something a registry can hold: cloneable, with a stable id.
pub trait Service: Clone + Send + Sync + 'static {
    /// Registry key for this service.
    fn id(&self) -> String;
}

/// Bare values are their own id.
impl Service for String {
    fn id(&self) -> String {
        self.clone()
    }
}

/// Anything that publishes discovery events.
pub trait DiscoverySource<S: Service> {
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<S>>;
}

/// Registry of currently known services.
///
/// `add_service` emits [`DiscoveryEvent::Available`] on the first sighting
/// and [`DiscoveryEvent::Updated`] on later ones; `remove_service` emits
/// [`DiscoveryEvent::Unavailable`] when the service was present.
pub struct ServiceRegistry<S: Service> {
    services: Mutex<HashMap<String, S>>,
    events: broadcast::Sender<DiscoveryEvent<S>>,
}

impl<S: Service> ServiceRegistry<S> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            services: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn add_service(&self, service: S) {
        let id = service.id();
        let previous = self.services.lock().insert(id.clone(), service.clone());
        let event = if previous.is_none() {
            debug!("Service available: {}", id);
            DiscoveryEvent::Available(service)
        } else {
            DiscoveryEvent::Updated(service)
        };
        let _ = self.events.send(event);
    }

    pub fn remove_service(&self, id: &str) -> Option<S> {
        let removed = self.services.lock().remove(id);
        if let Some(service) = &removed {
            debug!("Service unavailable: {}", id);
            let _ = self.events.send(DiscoveryEvent::Unavailable(service.clone()));
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<S> {
        self.services.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<S> {
        self.services.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }
}

impl<S: Service> Default for ServiceRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Service> DiscoverySource<S> for ServiceRegistry<S> {
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<S>> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_sighting_is_available() {
        let registry = ServiceRegistry::new();
        let mut rx = registry.subscribe();

        registry.add_service("vacuum-1".to_string());
        assert!(matches!(
            rx.recv().await.unwrap(),
            DiscoveryEvent::Available(s) if s == "vacuum-1"
        ));
    }

    #[tokio::test]
    async fn test_second_sighting_is_updated() {
        let registry = ServiceRegistry::new();
        let mut rx = registry.subscribe();

        registry.add_service("vacuum-1".to_string());
        registry.add_service("vacuum-1".to_string());
        rx.recv().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            DiscoveryEvent::Updated(_)
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_emits_unavailable_once() {
        let registry = ServiceRegistry::new();
        registry.add_service("gateway".to_string());

        let mut rx = registry.subscribe();
        assert!(registry.remove_service("gateway").is_some());
        assert!(registry.remove_service("gateway").is_none());
        assert!(matches!(
            rx.recv().await.unwrap(),
            DiscoveryEvent::Unavailable(s) if s == "gateway"
        ));
        assert!(registry.is_empty());
    }
}
