use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

use super::events::DiscoveryEvent;
use super::registry::{DiscoverySource, Service, ServiceRegistry};

/// How often `search` runs once started.
pub const DEFAULT_SEARCH_INTERVAL: Duration = Duration::from_secs(30);

/// How often stale services are swept.
pub const DEFAULT_STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Age beyond which an unseen service is evicted.
pub const DEFAULT_MAX_STALE_TIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TimedDiscoveryConfig {
    pub search_interval: Duration,
    pub stale_sweep_interval: Duration,
    pub max_stale_time: Duration,
}

impl Default for TimedDiscoveryConfig {
    fn default() -> Self {
        Self {
            search_interval: DEFAULT_SEARCH_INTERVAL,
            stale_sweep_interval: DEFAULT_STALE_SWEEP_INTERVAL,
            max_stale_time: DEFAULT_MAX_STALE_TIME,
        }
    }
}

/// Transport-specific search. Results arrive through
/// [`TimedDiscovery::add_service`], not as a return value.
#[async_trait]
pub trait Searcher: Send + Sync + 'static {
    async fn search(&self);
}

/// A registry driven by periodic searches, evicting services that have not
/// been sighted within `max_stale_time`.
pub struct TimedDiscovery<S: Service> {
    registry: Arc<ServiceRegistry<S>>,
    timestamps: Arc<Mutex<HashMap<String, Instant>>>,
    searcher: Arc<dyn Searcher>,
    config: TimedDiscoveryConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Service> TimedDiscovery<S> {
    pub fn new(searcher: Arc<dyn Searcher>, config: TimedDiscoveryConfig) -> Self {
        Self {
            registry: Arc::new(ServiceRegistry::new()),
            timestamps: Arc::new(Mutex::new(HashMap::new())),
            searcher,
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_defaults(searcher: Arc<dyn Searcher>) -> Self {
        Self::new(searcher, TimedDiscoveryConfig::default())
    }

    /// Start searching and sweeping. Idempotent; a second call while running
    /// is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let searcher = self.searcher.clone();
        let search_interval = self.config.search_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(search_interval);
            loop {
                ticker.tick().await;
                searcher.search().await;
            }
        }));

        let registry = self.registry.clone();
        let timestamps = self.timestamps.clone();
        let sweep_interval = self.config.stale_sweep_interval;
        let max_stale_time = self.config.max_stale_time;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            // The first tick fires immediately; skip it so freshly added
            // services get a full interval before their first sweep.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                evict_stale(&registry, &timestamps, max_stale_time);
            }
        }));
    }

    /// Stop the search and sweep timers. Idempotent. Known services stay
    /// registered.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Record a sighting.
    pub fn add_service(&self, service: S) {
        self.timestamps.lock().insert(service.id(), Instant::now());
        self.registry.add_service(service);
    }

    pub fn remove_service(&self, id: &str) -> Option<S> {
        self.timestamps.lock().remove(id);
        self.registry.remove_service(id)
    }

    /// Evict everything unseen for longer than `max_stale_time`.
    pub fn sweep_now(&self) {
        evict_stale(&self.registry, &self.timestamps, self.config.max_stale_time);
    }

    pub fn get(&self, id: &str) -> Option<S> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<S> {
        self.registry.list()
    }

    #[cfg(test)]
    fn timestamp_count(&self) -> usize {
        self.timestamps.lock().len()
    }
}

fn evict_stale<S: Service>(
    registry: &ServiceRegistry<S>,
    timestamps: &Mutex<HashMap<String, Instant>>,
    max_stale_time: Duration,
) {
    let stale: Vec<String> = {
        let mut timestamps = timestamps.lock();
        let stale: Vec<String> = timestamps
            .iter()
            .filter(|(_, seen)| seen.elapsed() > max_stale_time)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            timestamps.remove(id);
        }
        stale
    };
    for id in stale {
        debug!("Service {} went stale, evicting", id);
        registry.remove_service(&id);
    }
}

impl<S: Service> DiscoverySource<S> for TimedDiscovery<S> {
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent<S>> {
        self.registry.subscribe()
    }
}

impl<S: Service> Drop for TimedDiscovery<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSearcher;

    #[async_trait]
    impl Searcher for NullSearcher {
        async fn search(&self) {}
    }

    fn discovery(max_stale_time: Duration) -> TimedDiscovery<String> {
        TimedDiscovery::new(
            Arc::new(NullSearcher),
            TimedDiscoveryConfig {
                max_stale_time,
                ..TimedDiscoveryConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_stale_service_evicted() {
        let discovery = discovery(Duration::from_millis(10));
        let mut rx = discovery.subscribe();

        discovery.add_service("vacuum-1".to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;
        discovery.sweep_now();

        rx.recv().await.unwrap(); // available
        assert!(matches!(
            rx.recv().await.unwrap(),
            DiscoveryEvent::Unavailable(s) if s == "vacuum-1"
        ));
        assert!(discovery.list().is_empty());
        assert_eq!(discovery.timestamp_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_service_survives_sweep() {
        let discovery = discovery(Duration::from_secs(60));
        discovery.add_service("vacuum-1".to_string());
        discovery.sweep_now();
        assert_eq!(discovery.list().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_clears_timestamp() {
        let discovery = discovery(Duration::from_secs(60));
        discovery.add_service("vacuum-1".to_string());
        discovery.remove_service("vacuum-1");
        assert_eq!(discovery.timestamp_count(), 0);
        assert!(discovery.list().is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let discovery = discovery(Duration::from_secs(60));
        discovery.start();
        let count = discovery.tasks.lock().len();
        discovery.start();
        assert_eq!(discovery.tasks.lock().len(), count);
        discovery.stop();
        discovery.stop();
        assert!(discovery.tasks.lock().is_empty());
    }
}
