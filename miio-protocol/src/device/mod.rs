//! Per-device records and the call engine.
//!
//! A [`DeviceInfo`] is created by the network manager the first time a
//! device is seen, inbound or outbound, and lives as long as the manager.
//! It owns the handshake state, the request id space and the pending-call
//! map for that device. [`ModelRegistry`] wraps records into [`Device`]
//! handles once the model string is known.

pub mod info;
pub mod models;

pub use info::{CallOptions, DeviceInfo, DEFAULT_CALL_RETRIES};
pub use models::{Device, ModelRegistry};
