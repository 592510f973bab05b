use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::json;
use crate::network::manager::{NetworkConfig, NetworkShared};
use crate::packet::Packet;
use crate::token::Token;
use crate::transient;

/// Request ids live in [1, 9999].
const MAX_REQUEST_ID: u16 = 9999;

/// Id advance when an attempt is retried, so a late reply to the abandoned
/// attempt cannot be mistaken for the new one.
const RETRY_ID_BUMP: u16 = 100;

/// Extra attempts per call unless overridden.
pub const DEFAULT_CALL_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Sub-device to address, for calls routed through a gateway.
    pub sid: Option<String>,
    /// Extra attempts after the first one fails.
    pub retries: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            sid: None,
            retries: DEFAULT_CALL_RETRIES,
        }
    }
}

/// Decoded reply routed to a pending call.
enum DeviceReply {
    Result(Value),
    Error { code: i64, message: String },
}

/// Outcome of a single call attempt that did not produce a result.
enum AttemptError {
    Retry { reason: String, recover: bool },
    Fatal(ProtocolError),
}

struct DeviceState {
    id: Option<u32>,
    address: IpAddr,
    port: u16,
    packet: Packet,
    auto_token: bool,
    token_changed: bool,
    model: Option<String>,
    enriched: bool,
    pending: HashMap<u16, oneshot::Sender<DeviceReply>>,
    last_id: u16,
    handshake_waiter: Option<oneshot::Sender<Result<Token>>>,
}

/// Record and call engine for one device.
///
/// Created and owned by the network manager; holds the manager weakly so
/// the two do not keep each other alive.
pub struct DeviceInfo {
    network: Weak<NetworkShared>,
    state: Mutex<DeviceState>,
    handshake_gate: tokio::sync::Mutex<()>,
    enrich_gate: tokio::sync::Mutex<()>,
}

impl DeviceInfo {
    pub(crate) fn new(
        network: Weak<NetworkShared>,
        id: Option<u32>,
        address: IpAddr,
        port: u16,
    ) -> Arc<Self> {
        let mut packet = Packet::new();
        if let Some(id) = id {
            packet.set_device_id(id);
        }
        Arc::new(Self {
            network,
            state: Mutex::new(DeviceState {
                id,
                address,
                port,
                packet,
                auto_token: false,
                token_changed: false,
                model: None,
                enriched: false,
                pending: HashMap::new(),
                last_id: 0,
                handshake_waiter: None,
            }),
            handshake_gate: tokio::sync::Mutex::new(()),
            enrich_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.state.lock().id
    }

    pub fn address(&self) -> IpAddr {
        self.state.lock().address
    }

    pub fn port(&self) -> u16 {
        self.state.lock().port
    }

    pub fn model(&self) -> Option<String> {
        self.state.lock().model.clone()
    }

    pub fn is_enriched(&self) -> bool {
        self.state.lock().enriched
    }

    pub fn token(&self) -> Option<Token> {
        self.state.lock().packet.token()
    }

    /// Whether the token came out of a handshake rather than configuration.
    pub fn auto_token(&self) -> bool {
        self.state.lock().auto_token
    }

    pub fn token_changed(&self) -> bool {
        self.state.lock().token_changed
    }

    pub fn needs_handshake(&self) -> bool {
        self.state.lock().packet.needs_handshake()
    }

    pub(crate) fn set_manual_token(&self, token: Token) {
        let mut state = self.state.lock();
        state.packet.set_token(token);
        state.auto_token = false;
        state.token_changed = true;
    }

    pub(crate) fn set_id(&self, id: u32) {
        let mut state = self.state.lock();
        state.id = Some(id);
        state.packet.set_device_id(id);
    }

    /// Adopt the sender address of an inbound frame. Returns the previous
    /// address and whether it changed, so the manager can rebind its maps.
    pub(crate) fn update_remote(&self, remote: SocketAddr) -> (IpAddr, bool) {
        let mut state = self.state.lock();
        let old = state.address;
        let moved = old != remote.ip();
        state.address = remote.ip();
        state.port = remote.port();
        (old, moved)
    }

    /// Feed one raw frame from the socket into this device's codec, waking
    /// whatever is waiting on it. Runs on the receive loop; replies are
    /// routed in arrival order.
    pub(crate) fn on_message(&self, raw: &[u8]) {
        let mut state = self.state.lock();
        match state.packet.decode(raw) {
            Ok(None) => {
                let had_token = state.packet.token().is_some();
                let has_token = state.packet.handle_handshake_reply();
                if has_token && !had_token {
                    state.auto_token = true;
                    state.token_changed = true;
                }
                let id = state.packet.device_id();
                if id != 0 && id != u32::MAX && state.id != Some(id) {
                    state.id = Some(id);
                }
                if let Some(waiter) = state.handshake_waiter.take() {
                    let result = match state.packet.token() {
                        Some(token) => Ok(token),
                        None => Err(ProtocolError::MissingToken),
                    };
                    let _ = waiter.send(result);
                }
            }
            Ok(Some(plain)) => match json::parse_lenient(&plain) {
                Ok(value) => route_reply(&mut state, value),
                Err(err) => debug!("Could not parse reply payload: {}", err),
            },
            Err(err) => debug!("Could not decode frame: {}", err),
        }
    }

    /// Establish the token and stamp used to seal data frames.
    ///
    /// Resolves immediately while the current stamp is fresh. Only one
    /// handshake is in flight at a time; concurrent callers share its
    /// outcome. A reply without a token fails with `missing-token`.
    pub async fn handshake(&self) -> Result<Token> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }
        let _gate = self.handshake_gate.lock().await;
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let network = self.network()?;
        let socket = network.require_socket()?;
        let (frame, target) = {
            let state = self.state.lock();
            (state.packet.handshake(), SocketAddr::new(state.address, state.port))
        };
        let (tx, rx) = oneshot::channel();
        self.state.lock().handshake_waiter = Some(tx);

        debug!("Handshaking with {}", target);
        if let Err(err) = socket.send_to(&frame, target).await {
            self.state.lock().handshake_waiter = None;
            return Err(ProtocolError::socket_io(err));
        }

        match timeout(network.config.handshake_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => {
                self.state.lock().handshake_waiter = None;
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Invoke a method on the device and return the decoded `result`.
    ///
    /// Transient failures anywhere on the path (handshake, send, reply
    /// deadline, stamp rejection) are retried with jittered exponential
    /// backoff until `retries` is exhausted, triggering socket recovery
    /// where the failure indicates the socket is gone.
    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        let network = self.network()?;
        let mut retries_left = options.retries;
        let mut attempt: u32 = 0;
        let mut retrying = false;
        loop {
            match self.try_call(&network, method, &params, &options, retrying).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Retry { reason, recover }) => {
                    if retries_left == 0 {
                        debug!("Call to {} exhausted its retries ({})", method, reason);
                        return Err(ProtocolError::Timeout);
                    }
                    retries_left -= 1;
                    retrying = true;
                    if recover {
                        network.reset_socket(&reason);
                        network.request_recovery_discovery(&reason);
                    } else {
                        debug!("Retrying call to {}: {}", method, reason);
                    }
                    let backoff = retry_backoff(&network.config, attempt);
                    attempt += 1;
                    sleep(backoff).await;
                }
            }
        }
    }

    async fn try_call(
        &self,
        network: &Arc<NetworkShared>,
        method: &str,
        params: &Value,
        options: &CallOptions,
        retrying: bool,
    ) -> std::result::Result<Value, AttemptError> {
        if let Err(err) = self.handshake().await {
            return Err(match err {
                ProtocolError::Timeout => AttemptError::Retry {
                    reason: "handshake timeout".to_string(),
                    recover: false,
                },
                err if transient::is_transient(&err) => AttemptError::Retry {
                    reason: format!(
                        "handshake network error: {}",
                        err.code().unwrap_or("EIO")
                    ),
                    recover: true,
                },
                err => AttemptError::Fatal(err),
            });
        }

        let (id, frame, target, reply_rx) = {
            let mut state = self.state.lock();
            let id = next_request_id(&mut state, retrying);
            let mut request = json!({ "id": id, "method": method, "params": params });
            if let Some(sid) = &options.sid {
                request["sid"] = json!(sid);
            }
            let payload = match serde_json::to_vec(&request) {
                Ok(payload) => payload,
                Err(err) => return Err(AttemptError::Fatal(err.into())),
            };
            let frame = match state.packet.build(&payload) {
                Ok(frame) => frame,
                Err(err) => return Err(AttemptError::Fatal(err)),
            };
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, tx);
            (id, frame, SocketAddr::new(state.address, state.port), rx)
        };

        debug!("Calling {} on {} (id {})", method, target, id);

        let socket = match network.require_socket() {
            Ok(socket) => socket,
            Err(err) => {
                self.remove_pending(id);
                return Err(classify_send_failure(err, "socket send throw"));
            }
        };
        if let Err(err) = socket.send_to(&frame, target).await {
            self.remove_pending(id);
            return Err(classify_send_failure(
                ProtocolError::socket_io(err),
                "socket send error",
            ));
        }

        match timeout(network.config.call_timeout, reply_rx).await {
            Ok(Ok(DeviceReply::Result(value))) => Ok(value),
            Ok(Ok(DeviceReply::Error { code, message })) => {
                if is_retryable_device_error(code, &message) {
                    debug!("Device requested a resend (code {}): {}", code, message);
                    self.state.lock().packet.mark_handshake_required();
                    Err(AttemptError::Retry {
                        reason: format!("device retryable error: {}", code),
                        recover: false,
                    })
                } else {
                    Err(AttemptError::Fatal(map_device_error(method, code, message)))
                }
            }
            Ok(Err(_)) | Err(_) => {
                self.remove_pending(id);
                Err(AttemptError::Retry {
                    reason: "call timeout".to_string(),
                    recover: false,
                })
            }
        }
    }

    /// Learn what this record is talking to: fetch `miIO.info`, pulling the
    /// token out of storage first when none is known. Single-flighted.
    pub async fn enrich(&self) -> Result<()> {
        if self.is_enriched() {
            return Ok(());
        }
        let _gate = self.enrich_gate.lock().await;
        if self.is_enriched() {
            return Ok(());
        }

        let network = self.network()?;
        if self.token().is_none() {
            if let (Some(storage), Some(id)) = (network.token_storage.clone(), self.id()) {
                match storage.load(id).await {
                    Ok(Some(token)) => {
                        debug!("Using stored token for device {}", id);
                        self.state.lock().packet.set_token(token);
                    }
                    Ok(None) => {}
                    Err(err) => warn!("Token storage lookup failed for {}: {}", id, err),
                }
            }
        }

        let had_token = self.token().is_some();
        match self.call("miIO.info", json!([]), CallOptions::default()).await {
            Ok(info) => {
                {
                    let mut state = self.state.lock();
                    state.model = info.get("model").and_then(Value::as_str).map(str::to_string);
                    state.token_changed = false;
                    state.enriched = true;
                }
                if let Some(model) = self.model() {
                    debug!("Device {:?} identified as {}", self.id(), model);
                }
                self.store_learned_token(&network).await;
                Ok(())
            }
            Err(ProtocolError::MissingToken) => Err(ProtocolError::MissingToken),
            Err(err) => {
                debug!("Could not query device info: {}", err);
                if had_token {
                    Err(ProtocolError::ConnectionFailure)
                } else {
                    Err(ProtocolError::MissingToken)
                }
            }
        }
    }

    /// Persist a token the handshake taught us, so later sessions can reach
    /// the device without re-learning it.
    async fn store_learned_token(&self, network: &Arc<NetworkShared>) {
        let Some(storage) = network.token_storage.clone() else {
            return;
        };
        let (id, token, auto) = {
            let state = self.state.lock();
            (state.id, state.packet.token(), state.auto_token)
        };
        if let (Some(id), Some(token), true) = (id, token, auto) {
            if let Err(err) = storage.store(id, token).await {
                debug!("Could not persist token for {}: {}", id, err);
            }
        }
    }

    fn fresh_token(&self) -> Option<Token> {
        let state = self.state.lock();
        if state.packet.needs_handshake() {
            None
        } else {
            state.packet.token()
        }
    }

    fn remove_pending(&self, id: u16) {
        self.state.lock().pending.remove(&id);
    }

    fn network(&self) -> Result<Arc<NetworkShared>> {
        self.network
            .upgrade()
            .ok_or_else(|| ProtocolError::not_connected("network manager is gone"))
    }

    #[cfg(test)]
    pub(crate) fn set_model_for_test(&self, model: &str) {
        self.state.lock().model = Some(model.to_string());
    }
}

impl fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeviceInfo")
            .field("id", &state.id)
            .field("address", &state.address)
            .field("port", &state.port)
            .field("model", &state.model)
            .finish()
    }
}

fn route_reply(state: &mut DeviceState, value: Value) {
    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        debug!("Reply without id, dropping");
        return;
    };
    if id == 0 || id > MAX_REQUEST_ID as u64 {
        debug!("Reply id {} out of range, dropping", id);
        return;
    }
    let Some(waiter) = state.pending.remove(&(id as u16)) else {
        // A reply to an attempt that already timed out and moved on
        debug!("Dropping reply with unknown id {}", id);
        return;
    };
    let reply = if let Some(error) = value.get("error") {
        DeviceReply::Error {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        }
    } else {
        DeviceReply::Result(value.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = waiter.send(reply);
}

fn next_request_id(state: &mut DeviceState, retrying: bool) -> u16 {
    let bump = if retrying { RETRY_ID_BUMP } else { 1 };
    let mut id = state.last_id.wrapping_add(bump);
    if id == 0 || id > MAX_REQUEST_ID {
        id = 1;
    }
    // Never hand out an id that is still waiting for its reply
    while state.pending.contains_key(&id) {
        id += 1;
        if id > MAX_REQUEST_ID {
            id = 1;
        }
    }
    state.last_id = id;
    id
}

fn classify_send_failure(err: ProtocolError, surface: &str) -> AttemptError {
    if transient::is_transient(&err) {
        AttemptError::Retry {
            reason: format!("{}: {}", surface, err.code().unwrap_or("EIO")),
            recover: true,
        }
    } else {
        AttemptError::Fatal(err)
    }
}

fn retry_backoff(config: &NetworkConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    let exponential = config
        .backoff_base
        .saturating_mul(factor)
        .min(config.backoff_cap);
    let jitter_ms = config.backoff_jitter.as_millis() as u64;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    } else {
        Duration::ZERO
    };
    exponential + jitter
}

fn is_retryable_device_error(code: i64, message: &str) -> bool {
    if code == -9999 || code == -30001 {
        return true;
    }
    let message = message.to_lowercase();
    message.contains("invalid stamp") || message.contains("invalid_stmp")
}

fn map_device_error(method: &str, code: i64, message: String) -> ProtocolError {
    let message = match code {
        -5001 if message == "invalid_arg" => "Invalid argument".to_string(),
        -5005 if message == "params error" => "Invalid argument".to_string(),
        -10000 => format!("Method `{}` is not supported", method),
        _ => message,
    };
    ProtocolError::Device { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state() -> DeviceState {
        DeviceState {
            id: None,
            address: IpAddr::from([127, 0, 0, 1]),
            port: 54321,
            packet: Packet::new(),
            auto_token: false,
            token_changed: false,
            model: None,
            enriched: false,
            pending: HashMap::new(),
            last_id: 0,
            handshake_waiter: None,
        }
    }

    #[test]
    fn test_first_id_is_one() {
        let mut state = empty_state();
        assert_eq!(next_request_id(&mut state, false), 1);
        assert_eq!(next_request_id(&mut state, false), 2);
    }

    #[test]
    fn test_retry_bumps_id_by_hundred() {
        let mut state = empty_state();
        next_request_id(&mut state, false);
        assert_eq!(next_request_id(&mut state, true), 101);
    }

    #[test]
    fn test_id_wraps_to_one() {
        let mut state = empty_state();
        state.last_id = MAX_REQUEST_ID;
        assert_eq!(next_request_id(&mut state, false), 1);

        state.last_id = 9950;
        assert_eq!(next_request_id(&mut state, true), 1);
    }

    #[test]
    fn test_id_skips_pending() {
        let mut state = empty_state();
        state.last_id = 1;
        let (tx, _rx) = oneshot::channel();
        state.pending.insert(2, tx);
        assert_eq!(next_request_id(&mut state, false), 3);
    }

    #[test]
    fn test_retryable_device_errors() {
        assert!(is_retryable_device_error(-9999, "user ack timeout"));
        assert!(is_retryable_device_error(-30001, "resend"));
        assert!(is_retryable_device_error(-1, "Invalid Stamp detected"));
        assert!(is_retryable_device_error(-1, "err: invalid_stmp"));
        assert!(!is_retryable_device_error(-5001, "invalid_arg"));
    }

    #[test]
    fn test_device_error_message_mapping() {
        let err = map_device_error("set_power", -5001, "invalid_arg".to_string());
        assert_eq!(err.to_string(), "Invalid argument");

        let err = map_device_error("set_power", -5001, "something else".to_string());
        assert_eq!(err.to_string(), "something else");

        let err = map_device_error("set_power", -5005, "params error".to_string());
        assert_eq!(err.to_string(), "Invalid argument");

        let err = map_device_error("set_power", -10000, "unknown".to_string());
        assert_eq!(err.to_string(), "Method `set_power` is not supported");
        assert_eq!(err.device_code(), Some(-10000));

        let err = map_device_error("set_power", -4004, "device busy".to_string());
        assert_eq!(err.to_string(), "device busy");
    }

    #[test]
    fn test_reply_routing_matches_pending_id() {
        let mut state = empty_state();
        let (tx, mut rx) = oneshot::channel();
        state.pending.insert(5, tx);

        route_reply(&mut state, json!({"id": 5, "result": ["ok"]}));
        match rx.try_recv().unwrap() {
            DeviceReply::Result(value) => assert_eq!(value, json!(["ok"])),
            DeviceReply::Error { .. } => panic!("expected a result"),
        }
        assert!(state.pending.is_empty());
    }

    #[test]
    fn test_stale_reply_dropped() {
        let mut state = empty_state();
        let (tx, mut rx) = oneshot::channel();
        state.pending.insert(101, tx);

        // Late reply to the abandoned first attempt
        route_reply(&mut state, json!({"id": 1, "result": ["late"]}));
        assert!(rx.try_recv().is_err());
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = NetworkConfig {
            backoff_jitter: Duration::ZERO,
            ..NetworkConfig::default()
        };
        assert_eq!(retry_backoff(&config, 0), Duration::from_secs(1));
        assert_eq!(retry_backoff(&config, 1), Duration::from_secs(2));
        assert_eq!(retry_backoff(&config, 2), Duration::from_secs(4));
        assert_eq!(retry_backoff(&config, 3), Duration::from_secs(8));
        assert_eq!(retry_backoff(&config, 10), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let config = NetworkConfig::default();
        for attempt in 0..4 {
            let backoff = retry_backoff(&config, attempt);
            let floor = Duration::from_secs(1 << attempt.min(3));
            assert!(backoff >= floor);
            assert!(backoff < floor + Duration::from_millis(1000));
        }
    }
}
