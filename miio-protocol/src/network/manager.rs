use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::events::NetworkEvent;
use crate::device::DeviceInfo;
use crate::error::{ProtocolError, Result};
use crate::packet;
use crate::token::{Token, TokenStorage};
use crate::transient;

/// UDP port miIO devices listen on.
pub const DEVICE_PORT: u16 = 54321;

/// Buffered events per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port devices listen on; also the target port of search broadcasts.
    pub port: u16,
    /// Where search broadcasts go.
    pub broadcast_address: IpAddr,
    /// Deadline for a handshake reply.
    pub handshake_timeout: Duration,
    /// Deadline for a single call attempt.
    pub call_timeout: Duration,
    /// Gap between the two broadcasts of one search pass.
    pub search_repeat_delay: Duration,
    /// How long a socket reset blocks socket access before the replacement
    /// is created.
    pub reset_clear_delay: Duration,
    /// Poll cadence while a recovery search waits for a live socket.
    pub recovery_poll_interval: Duration,
    /// How long a recovery search keeps waiting before giving up.
    pub recovery_poll_limit: Duration,
    /// Minimum spacing between two recovery searches.
    pub recovery_search_window: Duration,
    /// Pause before recreating a socket whose receive loop died.
    pub recreate_delay: Duration,
    /// Retry backoff: base, cap and jitter of the exponential schedule.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub backoff_jitter: Duration,
    /// Pause between connect attempts.
    pub connect_retry_delay: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEVICE_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(2),
            search_repeat_delay: Duration::from_millis(500),
            reset_clear_delay: Duration::from_millis(250),
            recovery_poll_interval: Duration::from_millis(50),
            recovery_poll_limit: Duration::from_millis(300),
            recovery_search_window: Duration::from_secs(1),
            recreate_delay: Duration::from_secs(1),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(8),
            backoff_jitter: Duration::from_millis(1000),
            connect_retry_delay: Duration::from_millis(500),
        }
    }
}

/// How to reach a device that discovery has not (yet) reported.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub address: IpAddr,
    /// Defaults to [`DEVICE_PORT`].
    pub port: Option<u16>,
    pub token: Option<Token>,
    /// Extra attempts after the first connect fails with a transient error.
    pub connection_retries: u32,
}

impl ConnectOptions {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: None,
            token: None,
            connection_retries: 3,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    pub fn connection_retries(mut self, retries: u32) -> Self {
        self.connection_retries = retries;
        self
    }
}

/// Handle that keeps the shared UDP socket alive. The socket is created by
/// the first reference and destroyed when the last one is released.
pub struct NetworkRef {
    shared: Arc<NetworkShared>,
    released: bool,
}

impl NetworkRef {
    /// Release this reference. Idempotent; also runs on drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.release_ref();
    }
}

impl Drop for NetworkRef {
    fn drop(&mut self) {
        self.release();
    }
}

/// Manager for the process-wide device socket.
#[derive(Clone)]
pub struct NetworkManager {
    shared: Arc<NetworkShared>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_defaults() -> Self {
        Self::new(NetworkConfig::default())
    }

    /// A manager whose enrichment step can look up tokens learned in
    /// earlier sessions.
    pub fn with_token_storage(config: NetworkConfig, storage: Arc<dyn TokenStorage>) -> Self {
        Self::build(config, Some(storage))
    }

    fn build(config: NetworkConfig, token_storage: Option<Arc<dyn TokenStorage>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(NetworkShared {
                config,
                token_storage,
                events,
                state: Mutex::new(NetworkState::default()),
            }),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.shared.events.subscribe()
    }

    /// Take a reference to the shared socket, creating it on the first
    /// acquisition. Broadcasting and calling both need a live reference.
    pub async fn acquire(&self) -> Result<NetworkRef> {
        let first = {
            let mut state = self.shared.state.lock();
            state.references += 1;
            state.references == 1
        };
        if first {
            // During a reset the timer recreates the socket when the flag
            // clears; creating one here would race it.
            let reset_pending = self.shared.state.lock().socket_reset_in_progress;
            if !reset_pending {
                if let Err(err) = self.shared.create_socket().await {
                    self.shared.release_ref();
                    return Err(err);
                }
            }
        }
        Ok(NetworkRef {
            shared: self.shared.clone(),
            released: false,
        })
    }

    /// Broadcast a handshake so devices on the local network identify
    /// themselves, repeating once after a short delay. Failures are
    /// classified and fed into socket recovery; none of them surface here.
    pub async fn search(&self) {
        debug!("Searching for devices via broadcast");
        self.shared.broadcast_handshake().await;

        let shared = self.shared.clone();
        tokio::spawn(async move {
            sleep(shared.config.search_repeat_delay).await;
            shared.broadcast_handshake().await;
        });
    }

    /// Connect to a device by address, retrying on transient failures with
    /// the socket-recovery pair in between.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Arc<DeviceInfo>> {
        let mut attempts_left = options.connection_retries;
        loop {
            match self.find_device_via_address(&options).await {
                Ok(device) => return Ok(device),
                Err(err) => {
                    if attempts_left == 0 || !transient::is_transient_connect(&err) {
                        return Err(err);
                    }
                    attempts_left -= 1;
                    let code = err
                        .code()
                        .map(transient::canonical_code)
                        .unwrap_or_else(|| "EIO".to_string());
                    let reason = format!("connect retry after transient error: {}", code);
                    warn!("Connect to {} failed, retrying: {}", options.address, err);
                    self.shared.reset_socket(&reason);
                    self.shared.request_recovery_discovery(&reason);
                    sleep(self.shared.config.connect_retry_delay).await;
                }
            }
        }
    }

    /// Resolve or create the record for an address, handshake with it and
    /// enrich it. Prefer [`NetworkManager::connect`], which adds retries.
    pub async fn find_device_via_address(&self, options: &ConnectOptions) -> Result<Arc<DeviceInfo>> {
        let port = options.port.unwrap_or(self.shared.config.port);
        let device = {
            let mut state = self.shared.state.lock();
            match state.addresses.get(&options.address) {
                Some(device) => device.clone(),
                None => {
                    let device = DeviceInfo::new(
                        Arc::downgrade(&self.shared),
                        None,
                        options.address,
                        port,
                    );
                    state.addresses.insert(options.address, device.clone());
                    device
                }
            }
        };
        if let Some(token) = options.token {
            device.set_manual_token(token);
        }

        match device.handshake().await {
            Ok(_) => {}
            // Without a token the handshake still teaches us the id;
            // enrichment below may find the token in storage.
            Err(ProtocolError::MissingToken) => {
                debug!("Device at {} did not reveal its token", options.address)
            }
            Err(err) => return Err(err),
        }

        // The handshake may have identified a device we already track.
        let device = {
            let mut state = self.shared.state.lock();
            match device.id() {
                Some(id) => match state.devices.get(&id) {
                    Some(existing) if !Arc::ptr_eq(existing, &device) => {
                        debug!("Address {} resolved to already known device {}", options.address, id);
                        existing.clone()
                    }
                    _ => {
                        state.devices.insert(id, device.clone());
                        device
                    }
                },
                None => device,
            }
        };

        device.enrich().await?;
        Ok(device)
    }

    /// Snapshot of all identified devices.
    pub fn list(&self) -> Vec<Arc<DeviceInfo>> {
        self.shared.state.lock().devices.values().cloned().collect()
    }

    pub fn device(&self, id: u32) -> Option<Arc<DeviceInfo>> {
        self.shared.state.lock().devices.get(&id).cloned()
    }
}

#[derive(Default)]
struct NetworkState {
    socket: Option<Arc<UdpSocket>>,
    recv_task: Option<JoinHandle<()>>,
    addresses: HashMap<IpAddr, Arc<DeviceInfo>>,
    devices: HashMap<u32, Arc<DeviceInfo>>,
    references: usize,
    socket_reset_in_progress: bool,
    recovery_pending: bool,
    last_recovery_discovery: Option<Instant>,
}

/// State shared between the manager handle, device records and background
/// tasks. Devices hold it weakly to avoid keeping each other alive.
pub(crate) struct NetworkShared {
    pub(crate) config: NetworkConfig,
    pub(crate) token_storage: Option<Arc<dyn TokenStorage>>,
    events: broadcast::Sender<NetworkEvent>,
    state: Mutex<NetworkState>,
}

impl NetworkShared {
    /// The live socket, or `ENOTCONN` while there is none (including during
    /// a reset). Callers classify that as transient and retry.
    pub(crate) fn require_socket(&self) -> Result<Arc<UdpSocket>> {
        let state = self.state.lock();
        if state.socket_reset_in_progress {
            return Err(ProtocolError::not_connected("socket reset in progress"));
        }
        state
            .socket
            .clone()
            .ok_or_else(|| ProtocolError::not_connected("socket not created"))
    }

    async fn create_socket(self: &Arc<Self>) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(ProtocolError::socket_io)?;
        socket.set_broadcast(true).map_err(ProtocolError::socket_io)?;
        let socket = Arc::new(socket);
        info!(
            "Device socket bound to {:?}",
            socket.local_addr().map_err(ProtocolError::socket_io)?
        );

        let task = tokio::spawn(recv_loop(Arc::downgrade(self), socket.clone()));
        let mut state = self.state.lock();
        if state.references == 0 {
            // Released while we were binding
            task.abort();
            return Ok(());
        }
        close_socket(&mut state);
        state.socket = Some(socket);
        state.recv_task = Some(task);
        Ok(())
    }

    fn release_ref(&self) {
        let mut state = self.state.lock();
        state.references = state.references.saturating_sub(1);
        if state.references == 0 {
            debug!("Last network reference released, closing socket");
            close_socket(&mut state);
        }
    }

    /// Tear down the socket after a failure. Single-flighted: a second
    /// reset while one is pending is a no-op. The replacement socket is
    /// created once the in-progress flag clears, provided references
    /// remain.
    pub(crate) fn reset_socket(self: &Arc<Self>, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.socket_reset_in_progress {
                return;
            }
            state.socket_reset_in_progress = true;
            close_socket(&mut state);
        }
        warn!("Resetting device socket: {}", reason);
        let _ = self.events.send(NetworkEvent::SocketReset {
            reason: reason.to_string(),
        });

        let shared = self.clone();
        tokio::spawn(async move {
            sleep(shared.config.reset_clear_delay).await;
            let recreate = {
                let mut state = shared.state.lock();
                state.socket_reset_in_progress = false;
                state.references > 0 && state.socket.is_none()
            };
            if recreate {
                if let Err(err) = shared.create_socket().await {
                    warn!("Could not recreate socket after reset: {}", err);
                }
            }
        });
    }

    /// Ask for an out-of-schedule search once the socket is live again.
    /// Deferred while a reset is pending, cancelled when the last reference
    /// goes away, and rate-limited to one search per window.
    pub(crate) fn request_recovery_discovery(self: &Arc<Self>, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.recovery_pending {
                return;
            }
            if let Some(last) = state.last_recovery_discovery {
                if last.elapsed() < self.config.recovery_search_window {
                    debug!("Recovery discovery suppressed, searched too recently");
                    return;
                }
            }
            state.recovery_pending = true;
        }
        info!("Requesting recovery discovery: {}", reason);
        let _ = self.events.send(NetworkEvent::RecoveryDiscovery {
            reason: reason.to_string(),
        });

        let shared = self.clone();
        tokio::spawn(async move {
            let mut waited = Duration::ZERO;
            loop {
                enum Step {
                    Search,
                    Wait,
                    Cancel,
                }
                let step = {
                    let state = shared.state.lock();
                    if state.references == 0 {
                        Step::Cancel
                    } else if !state.socket_reset_in_progress && state.socket.is_some() {
                        Step::Search
                    } else {
                        Step::Wait
                    }
                };
                match step {
                    Step::Search => {
                        shared.state.lock().last_recovery_discovery = Some(Instant::now());
                        NetworkManager {
                            shared: shared.clone(),
                        }
                        .search()
                        .await;
                        break;
                    }
                    Step::Cancel => {
                        debug!("Recovery discovery cancelled, no references left");
                        break;
                    }
                    Step::Wait => {
                        if waited >= shared.config.recovery_poll_limit {
                            debug!("Recovery discovery gave up waiting for a socket");
                            break;
                        }
                        sleep(shared.config.recovery_poll_interval).await;
                        waited += shared.config.recovery_poll_interval;
                    }
                }
            }
            shared.state.lock().recovery_pending = false;
        });
    }

    /// One handshake broadcast. Failures are classified; transient ones
    /// schedule a socket reset, the rest only reach the log.
    async fn broadcast_handshake(self: &Arc<Self>) {
        let socket = match self.require_socket() {
            Ok(socket) => socket,
            Err(err) => {
                if transient::is_transient(&err) {
                    self.reset_socket(&format!(
                        "discovery socket unavailable: {}",
                        err.code().unwrap_or("EIO")
                    ));
                } else {
                    debug!("Search skipped, socket unavailable: {}", err);
                }
                return;
            }
        };

        let frame = packet::Packet::new().handshake();
        let target = SocketAddr::new(self.config.broadcast_address, self.config.port);
        if let Err(err) = socket.send_to(&frame, target).await {
            let err = ProtocolError::socket_io(err);
            if transient::is_transient(&err) {
                self.reset_socket(&format!(
                    "discovery broadcast error: {}",
                    err.code().unwrap_or("EIO")
                ));
            } else {
                debug!("Search broadcast failed: {}", err);
            }
        }
    }

    /// Resolve a device record by id, falling back to the sender address,
    /// creating one when both are unknown. Keeps the id and address maps
    /// pointing at the same record, clearing stale keys before rebinding.
    pub(crate) fn find_device(
        self: &Arc<Self>,
        id: u32,
        remote: Option<SocketAddr>,
    ) -> Option<Arc<DeviceInfo>> {
        let mut state = self.state.lock();

        if let Some(device) = state.devices.get(&id).cloned() {
            if let Some(remote) = remote {
                let (old_address, moved) = device.update_remote(remote);
                if moved {
                    debug!("Device {} moved from {} to {}", id, old_address, remote.ip());
                    state.addresses.remove(&old_address);
                    state.addresses.insert(remote.ip(), device.clone());
                }
            }
            return Some(device);
        }

        let remote = remote?;
        if let Some(device) = state.addresses.get(&remote.ip()).cloned() {
            // A record created via connect just learned its id
            device.set_id(id);
            device.update_remote(remote);
            state.devices.insert(id, device.clone());
            return Some(device);
        }

        debug!("New device {} at {}", id, remote);
        let device = DeviceInfo::new(Arc::downgrade(self), Some(id), remote.ip(), remote.port());
        state.addresses.insert(remote.ip(), device.clone());
        state.devices.insert(id, device.clone());
        Some(device)
    }

    /// Route one inbound datagram. Handshake replies additionally enrich
    /// the device (once) and announce it to subscribers.
    fn handle_datagram(self: &Arc<Self>, data: &[u8], remote: SocketAddr) {
        let header = match packet::peek(data) {
            Ok(header) => header,
            Err(err) => {
                debug!("Dropping malformed datagram from {}: {}", remote, err);
                return;
            }
        };
        let Some(device_id) = header.known_device_id() else {
            debug!("Dropping datagram without device id from {}", remote);
            return;
        };
        let Some(device) = self.find_device(device_id, Some(remote)) else {
            return;
        };

        device.on_message(data);

        if !header.has_payload {
            // Handshake reply: the device is announcing itself
            let shared = self.clone();
            tokio::spawn(async move {
                if !device.is_enriched() {
                    if let Err(err) = device.enrich().await {
                        debug!("Could not enrich device {}: {}", device_id, err);
                    }
                }
                let _ = shared.events.send(NetworkEvent::DeviceSeen { device });
            });
        }
    }

    /// Recreate the socket after its receive loop stopped unexpectedly.
    fn schedule_socket_recreate(self: &Arc<Self>) {
        let shared = self.clone();
        tokio::spawn(async move {
            sleep(shared.config.recreate_delay).await;
            let recreate = {
                let state = shared.state.lock();
                state.references > 0 && state.socket.is_none() && !state.socket_reset_in_progress
            };
            if recreate {
                info!("Recreating device socket after receive loop exit");
                if let Err(err) = shared.create_socket().await {
                    warn!("Could not recreate socket: {}", err);
                }
            }
        });
    }
}

impl Drop for NetworkShared {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().recv_task.take() {
            task.abort();
        }
    }
}

fn close_socket(state: &mut NetworkState) {
    if let Some(task) = state.recv_task.take() {
        task.abort();
    }
    state.socket = None;
}

async fn recv_loop(shared: Weak<NetworkShared>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 4096];
    let mut consecutive_errors = 0u32;
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, remote)) => {
                consecutive_errors = 0;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.handle_datagram(&buf[..len], remote);
            }
            Err(err) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let err = ProtocolError::socket_io(err);
                warn!("Socket receive error: {}", err);
                if transient::is_transient(&err) {
                    shared.reset_socket(&format!(
                        "socket receive error: {}",
                        err.code().unwrap_or("EIO")
                    ));
                    // The reset closed this socket; this task is done.
                    return;
                }
                consecutive_errors += 1;
                if consecutive_errors >= 5 {
                    // Treat the socket as dead and hand it back for a
                    // delayed recreation.
                    warn!("Receive loop giving up after repeated errors");
                    {
                        let mut state = shared.state.lock();
                        let ours = state
                            .socket
                            .as_ref()
                            .map_or(false, |s| Arc::ptr_eq(s, &socket));
                        if ours {
                            state.socket = None;
                            state.recv_task = None;
                        }
                    }
                    shared.schedule_socket_recreate();
                    return;
                }
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
