//! Event-driven service discovery.
//!
//! [`ServiceRegistry`] is the plain registry: services keyed by id, with
//! available/updated/unavailable events. [`TimedDiscovery`] layers periodic
//! searching and stale eviction on top, and [`MappedDiscovery`] pipes any
//! registry through an async mapper (for example, turning device sightings
//! into connected device handles). [`DeviceBrowser`] wires the timed variant
//! to the network manager's broadcast search.

pub mod browser;
pub mod events;
pub mod mapped;
pub mod registry;
pub mod timed;

pub use browser::{DeviceBrowser, DeviceService, Devices};
pub use events::DiscoveryEvent;
pub use mapped::{MappedDiscovery, ServiceMapper};
pub use registry::{DiscoverySource, Service, ServiceRegistry};
pub use timed::{Searcher, TimedDiscovery, TimedDiscoveryConfig};
