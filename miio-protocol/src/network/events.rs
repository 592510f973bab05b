use std::sync::Arc;

use crate::device::DeviceInfo;

/// Events emitted by the network manager.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A device answered a handshake broadcast or re-advertised itself.
    DeviceSeen { device: Arc<DeviceInfo> },
    /// The shared socket was torn down to recover from a failure.
    SocketReset { reason: String },
    /// A recovery search was requested after a transient failure.
    RecoveryDiscovery { reason: String },
}
