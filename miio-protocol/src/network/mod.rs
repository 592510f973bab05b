//! Shared UDP socket ownership and datagram dispatch.
//!
//! One [`NetworkManager`] serves every device and every discovery instance
//! in the process. The socket exists exactly while at least one
//! [`NetworkRef`] is held; inbound datagrams are routed to per-device
//! records, and transient socket failures are healed by a single-flighted
//! reset followed by a rate-limited recovery search.

pub mod events;
pub mod manager;

pub use events::NetworkEvent;
pub use manager::{ConnectOptions, NetworkConfig, NetworkManager, NetworkRef, DEVICE_PORT};
