//! miIO LAN Protocol Implementation
//!
//! This library talks to miIO smart-home devices over their UDP
//! request/reply protocol: broadcast discovery, the stamped handshake that
//! establishes a per-device token, and encrypted JSON-RPC calls with
//! transparent retry and socket recovery.
//!
//! A typical session acquires the shared socket, connects to a device and
//! calls methods on it:
//!
//! ```no_run
//! use miio_protocol::network::{ConnectOptions, NetworkManager};
//! use miio_protocol::device::CallOptions;
//! use serde_json::json;
//!
//! # async fn run() -> miio_protocol::Result<()> {
//! let network = NetworkManager::with_defaults();
//! let _guard = network.acquire().await?;
//!
//! let device = network
//!     .connect(ConnectOptions::new("192.168.1.8".parse().unwrap())
//!         .token("00112233445566778899aabbccddeeff".parse()?))
//!     .await?;
//! let power = device.call("get_prop", json!(["power"]), CallOptions::default()).await?;
//! println!("power: {}", power);
//! # Ok(())
//! # }
//! ```
//!
//! [`discovery::DeviceBrowser`] and [`discovery::Devices`] turn the same
//! machinery into an event-driven registry of everything on the network.

pub mod device;
pub mod discovery;
pub mod json;
pub mod network;
pub mod packet;
pub mod token;
pub mod transient;

mod error;
pub use error::{ProtocolError, Result};
pub use network::DEVICE_PORT;
