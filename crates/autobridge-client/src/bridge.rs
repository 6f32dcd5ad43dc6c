//! Bridge orchestrator.
//!
//! [`AutomationBridge`] is the single public entry point. It connects on
//! demand, admits requests against the concurrency limit, queues overflow
//! and heals itself after disconnects. Connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Connected -> Disconnected
//!       ^              |              |
//!       +--------------+--------------+  (failed attempt)
//! ```
//!
//! Lock order: the admission queue is always taken before the tracker's
//! table, and no lock is held while a frame is handed to the transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use autobridge_core::protocol::{AutomationResponse, OutboundFrame, close_codes};
use autobridge_core::version::check_version;
use autobridge_core::{BridgeError, ConnectionId, RequestId};
use autobridge_settings::BridgeSettings;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, instrument, warn};

use crate::connection::{ConnectionInfo, ConnectionManager, HEARTBEAT_TIMEOUT_REASON};
use crate::events::{BridgeEvent, EVENT_CAPACITY};
use crate::handshake::{HandshakeOptions, initiate_handshake};
use crate::launcher::{
    LaunchError, LaunchOptions, LaunchedPeer, PeerLauncher, ProcessLauncher, wait_until_ready,
};
use crate::policy::{CoalescePolicy, CompletionPolicy, EchoPolicy};
use crate::router::{MessageRouter, encode_request};
use crate::status::{
    AutoLaunchStatus, BridgeStatus, ConnectionState, Diagnostics, DisconnectRecord, ErrorRecord,
    HandshakeFailureRecord, HandshakeRecord,
};
use crate::tracker::{PendingResponse, RequestTracker};
use crate::transport::{ConnectTarget, Connector, TransportEvent, TransportPair, WsConnector};

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), BridgeError>>>;

/// Per-call request options.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestOptions {
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Options with an explicit timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

struct QueuedRequest {
    action: String,
    payload: Value,
    timeout: Duration,
    coalesce_key: Option<String>,
    reply: oneshot::Sender<Result<PendingResponse, BridgeError>>,
}

enum Admission {
    Pending(PendingResponse),
    Queued(oneshot::Receiver<Result<PendingResponse, BridgeError>>),
}

struct BridgeInner {
    settings: BridgeSettings,
    connector: Arc<dyn Connector>,
    launcher: RwLock<Arc<dyn PeerLauncher>>,
    connections: Arc<ConnectionManager>,
    tracker: RequestTracker,
    router: MessageRouter,
    events: broadcast::Sender<BridgeEvent>,
    state: Mutex<ConnectionState>,
    queue: Mutex<VecDeque<QueuedRequest>>,
    /// In-flight attempt and whether it may auto-launch the peer.
    connect_slot: Mutex<Option<(ConnectAttempt, bool)>>,
    /// Bumped by `stop`; attempts that straddle a stop discard their socket.
    epoch: AtomicU64,
    auto_launched: AtomicBool,
    launched_pid: Mutex<Option<u32>>,
    diagnostics: Mutex<Diagnostics>,
}

/// Client bridge to the automation peer. Clones share one bridge;
/// separately constructed bridges share nothing.
#[derive(Clone)]
pub struct AutomationBridge {
    inner: Arc<BridgeInner>,
}

impl AutomationBridge {
    /// Create a bridge over `connector`. Nothing connects until
    /// [`start`](Self::start) or the first request.
    pub fn new(settings: BridgeSettings, connector: impl Connector) -> Self {
        let completion = CompletionPolicy::from_settings(&settings);
        let tracker = RequestTracker::new(
            settings.limits.max_pending_requests,
            completion.clone(),
            CoalescePolicy::from_settings(&settings),
        );
        let connections = Arc::new(ConnectionManager::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let router = MessageRouter::new(
            tracker.clone(),
            connections.clone(),
            completion,
            EchoPolicy::from_settings(&settings),
            events.clone(),
            settings.limits.max_inbound_frame_bytes,
        );

        let launcher: Arc<dyn PeerLauncher> = Arc::new(ProcessLauncher::new());
        let inner = Arc::new(BridgeInner {
            settings,
            connector: Arc::new(connector),
            launcher: RwLock::new(launcher),
            connections,
            tracker,
            router,
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            queue: Mutex::new(VecDeque::new()),
            connect_slot: Mutex::new(None),
            epoch: AtomicU64::new(0),
            auto_launched: AtomicBool::new(false),
            launched_pid: Mutex::new(None),
            diagnostics: Mutex::new(Diagnostics::default()),
        });

        let weak = Arc::downgrade(&inner);
        inner.tracker.set_settle_hook(move || {
            if let Some(inner) = weak.upgrade() {
                inner.drain_queue();
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.connections.set_heartbeat_timeout_hook(move |removed| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_heartbeat_timeout(&removed);
            }
        });

        Self { inner }
    }

    /// Create a bridge that connects over WebSocket.
    pub fn websocket(settings: BridgeSettings) -> Self {
        Self::new(settings, WsConnector::new())
    }

    /// Replace the peer launcher used for auto-launch and [`launch_peer`](Self::launch_peer).
    #[must_use]
    pub fn with_launcher(self, launcher: impl PeerLauncher) -> Self {
        *self.inner.launcher.write() = Arc::new(launcher);
        self
    }

    /// Best-effort initial connection. Failures are logged and published as
    /// [`BridgeEvent::Error`]; requests still connect on demand. Does not
    /// auto-launch the peer.
    pub async fn start(&self) {
        if !self.inner.settings.enabled {
            info!("automation bridge disabled, not connecting");
            return;
        }
        if let Err(e) = self.inner.ensure_connected(false).await {
            warn!(error = %e, "initial connection failed, will connect on demand");
        }
    }

    /// Say goodbye, close every connection and reject everything pending
    /// with [`BridgeError::Stopped`]. Safe to call at any time; the bridge
    /// can be used again afterwards.
    pub fn stop(&self) {
        let inner = &self.inner;
        let _ = inner.epoch.fetch_add(1, Ordering::SeqCst);

        let goodbye = OutboundFrame::Goodbye {
            reason: "bridge stopping".to_string(),
        };
        match goodbye.to_json() {
            Ok(text) => {
                let _ = inner.connections.broadcast(&text);
            }
            Err(e) => warn!(error = %e, "failed to encode goodbye"),
        }
        inner
            .connections
            .close_all(close_codes::GOING_AWAY, "bridge stopped");
        let removed = inner.connections.take_all();
        inner.connections.stop_heartbeat();
        inner.set_state(ConnectionState::Disconnected);

        let rejected = inner.fail_everything(&BridgeError::Stopped);
        for connection in &removed {
            inner.record_disconnect(
                &connection.id,
                close_codes::GOING_AWAY,
                "bridge stopped",
            );
        }
        info!(
            connections = removed.len(),
            rejected, "automation bridge stopped"
        );
    }

    /// Send `action` to the peer and wait for it to settle.
    ///
    /// Connects lazily, auto-launching the peer once per bridge if that is
    /// configured. At the concurrency limit the request waits in a bounded
    /// FIFO queue; when that is full it fails with
    /// [`BridgeError::Capacity`].
    #[instrument(skip_all, fields(action = %action))]
    pub async fn send_request(
        &self,
        action: &str,
        payload: Value,
        options: RequestOptions,
    ) -> Result<AutomationResponse, BridgeError> {
        let inner = &self.inner;
        if !inner.settings.enabled {
            return Err(BridgeError::Disabled);
        }
        inner
            .ensure_connected(true)
            .await
            .map_err(|e| match e {
                BridgeError::Connectivity { .. } => e,
                other => BridgeError::connectivity(other.to_string()),
            })?;

        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(inner.settings.timeouts.request_timeout_ms));
        match inner.admit(action, payload, timeout)? {
            Admission::Pending(response) => response.await,
            Admission::Queued(slot) => match slot.await {
                Ok(Ok(response)) => response.await,
                Ok(Err(e)) => Err(e),
                Err(_) => Err(BridgeError::Stopped),
            },
        }
    }

    /// [`send_request`](Self::send_request) with default options.
    pub async fn send_automation_request(
        &self,
        action: &str,
        payload: Value,
    ) -> Result<AutomationResponse, BridgeError> {
        self.send_request(action, payload, RequestOptions::default())
            .await
    }

    /// Launch the peer now. Not subject to the once-per-bridge auto-launch guard.
    pub async fn launch_peer(&self) -> Result<LaunchedPeer, LaunchError> {
        self.inner.launch().await
    }

    /// Whether any connection is registered.
    pub fn is_connected(&self) -> bool {
        self.inner.connections.is_connected()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Subscribe to bridge events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the bridge.
    pub fn get_status(&self) -> BridgeStatus {
        let inner = &self.inner;
        let settings = &inner.settings;
        let diagnostics = inner.diagnostics.lock().clone();
        BridgeStatus {
            enabled: settings.enabled,
            state: self.state(),
            connected: inner.connections.is_connected(),
            host: settings.host.clone(),
            ports: settings.ports.clone(),
            connections: inner.connections.connections(),
            last_handshake: diagnostics.last_handshake,
            last_handshake_failure: diagnostics.last_handshake_failure,
            last_disconnect: diagnostics.last_disconnect,
            last_error: diagnostics.last_error,
            last_message_at: inner.connections.last_message_at(),
            pending_requests: inner.tracker.pending_count(),
            max_pending_requests: inner.tracker.max_pending_requests(),
            queued_requests: inner.queue.lock().len(),
            max_queued_requests: settings.limits.max_queued_requests,
            version: diagnostics.version,
            auto_launch: AutoLaunchStatus {
                enabled: settings.auto_launch.enabled,
                launched: inner.auto_launched.load(Ordering::SeqCst),
                pid: *inner.launched_pid.lock(),
            },
        }
    }
}

impl BridgeInner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = ?*state, to = ?next, "bridge state");
            *state = next;
        }
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn record_error(&self, message: String) {
        self.diagnostics.lock().last_error = Some(ErrorRecord {
            at: Utc::now(),
            message: message.clone(),
        });
        self.emit(BridgeEvent::Error { message });
    }

    fn record_disconnect(&self, id: &ConnectionId, code: u16, reason: &str) {
        self.diagnostics.lock().last_disconnect = Some(DisconnectRecord {
            at: Utc::now(),
            code,
            reason: reason.to_owned(),
        });
        self.emit(BridgeEvent::Disconnected {
            connection_id: id.clone(),
            code,
            reason: reason.to_owned(),
        });
    }

    // ── Connecting ──────────────────────────────────────────────────

    /// Join the in-flight connection attempt or start one.
    ///
    /// A caller allowed to launch that joined an attempt which was not gets
    /// a launching attempt of its own if the joined one fails.
    async fn ensure_connected(self: &Arc<Self>, allow_launch: bool) -> Result<(), BridgeError> {
        loop {
            if self.connections.is_connected() {
                return Ok(());
            }
            let (attempt, launches) = self.join_or_start_attempt(allow_launch);
            let result = attempt.await;
            let retry_with_launch = result.is_err()
                && allow_launch
                && !launches
                && self.settings.auto_launch.enabled
                && !self.auto_launched.load(Ordering::SeqCst);
            if !retry_with_launch {
                return result;
            }
            debug!("joined attempt could not launch the peer, retrying with launch");
        }
    }

    fn join_or_start_attempt(self: &Arc<Self>, allow_launch: bool) -> (ConnectAttempt, bool) {
        let mut slot = self.connect_slot.lock();
        if let Some((attempt, launches)) = slot.as_ref() {
            return (attempt.clone(), *launches);
        }
        let inner = self.clone();
        let task = tokio::spawn(async move {
            let result = inner.connect_or_launch(allow_launch).await;
            *inner.connect_slot.lock() = None;
            if let Err(e) = &result {
                inner.record_error(e.to_string());
            }
            result
        });
        let attempt: ConnectAttempt = async move {
            task.await.unwrap_or_else(|e| {
                Err(BridgeError::connectivity(format!("connect task failed: {e}")))
            })
        }
        .boxed()
        .shared();
        *slot = Some((attempt.clone(), allow_launch));
        (attempt, allow_launch)
    }

    async fn connect_or_launch(self: &Arc<Self>, allow_launch: bool) -> Result<(), BridgeError> {
        let cause = match self.connect_once().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if !allow_launch || !self.settings.auto_launch.enabled {
            return Err(cause);
        }
        if self.auto_launched.swap(true, Ordering::SeqCst) {
            debug!("peer already auto-launched once, not relaunching");
            return Err(cause);
        }

        info!(error = %cause, "peer unreachable, auto-launching");
        if let Err(e) = self.launch().await {
            return Err(BridgeError::connectivity(format!(
                "{cause}; auto-launch failed: {e}"
            )));
        }
        let launch = &self.settings.auto_launch;
        let ready = wait_until_ready(
            Duration::from_millis(launch.timeout_ms),
            Duration::from_millis(launch.poll_interval_ms),
            || {
                let inner = self.clone();
                async move { inner.connect_once().await.is_ok() }
            },
        )
        .await;
        ready.map_err(|e| BridgeError::connectivity(format!("launched peer unreachable: {e}")))
    }

    async fn launch(&self) -> Result<LaunchedPeer, LaunchError> {
        let options = LaunchOptions::from_settings(&self.settings.auto_launch)?;
        let launcher = self.launcher.read().clone();
        let peer = launcher.launch(&options).await?;
        *self.launched_pid.lock() = peer.pid;
        Ok(peer)
    }

    /// One pass over the configured ports. Stops at the first that handshakes.
    async fn connect_once(self: &Arc<Self>) -> Result<(), BridgeError> {
        if self.connections.is_connected() {
            return Ok(());
        }
        let mut last_error = None;
        for &port in &self.settings.ports {
            match self.connect_port(port).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(port, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
            }
        }
        if !self.connections.is_connected() {
            self.set_state(ConnectionState::Disconnected);
        }
        Err(last_error.unwrap_or_else(|| BridgeError::connectivity("no ports configured")))
    }

    #[instrument(skip(self))]
    async fn connect_port(self: &Arc<Self>, port: u16) -> Result<(), BridgeError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let settings = &self.settings;
        let target = ConnectTarget {
            host: settings.host.clone(),
            port,
            protocols: settings.protocols.clone(),
            capability_token: settings.capability_token.clone(),
        };

        self.set_state(ConnectionState::Connecting);
        let connect_timeout = Duration::from_millis(settings.timeouts.connect_timeout_ms);
        let pair = match time::timeout(connect_timeout, self.connector.connect(&target)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(BridgeError::connectivity(e.to_string())),
            Err(_) => {
                return Err(BridgeError::connectivity(format!(
                    "connecting to {} timed out after {}ms",
                    target.url(),
                    settings.timeouts.connect_timeout_ms
                )));
            }
        };
        let TransportPair {
            sink,
            mut events,
            remote_addr,
            protocol,
        } = pair;

        self.set_state(ConnectionState::Handshaking);
        let options = HandshakeOptions {
            timeout: Duration::from_millis(settings.timeouts.handshake_timeout_ms),
            hello_delay: Duration::from_millis(settings.timeouts.hello_delay_ms),
            capability_token: settings.capability_token.clone(),
        };
        let metadata = match initiate_handshake(&sink, &mut events, &options).await {
            Ok(metadata) => metadata,
            Err(error) => {
                self.diagnostics.lock().last_handshake_failure = Some(HandshakeFailureRecord {
                    at: Utc::now(),
                    port,
                    error: error.to_string(),
                });
                self.emit(BridgeEvent::HandshakeFailed {
                    port,
                    error: error.clone(),
                });
                return Err(BridgeError::Handshake(error));
            }
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            sink.close(close_codes::GOING_AWAY, "bridge stopped");
            return Err(BridgeError::Stopped);
        }

        let version = check_version(
            metadata.peer_version(),
            &settings.version.minimum_peer_version,
            &settings.version.feature_gates,
        );
        for warning in &version.warnings {
            warn!(port, %warning, "peer version check");
        }

        let id = self
            .connections
            .register_socket(sink, port, metadata.clone(), remote_addr, protocol);
        {
            let mut diagnostics = self.diagnostics.lock();
            diagnostics.last_handshake = Some(HandshakeRecord {
                at: Utc::now(),
                port,
                metadata: metadata.clone(),
            });
            diagnostics.version = Some(version.clone());
        }
        self.set_state(ConnectionState::Connected);
        info!(connection_id = %id, port, session_id = ?metadata.session_id(), "connected to automation peer");
        self.emit(BridgeEvent::Connected {
            connection_id: id.clone(),
            port,
            metadata,
            version,
        });

        self.connections.start_heartbeat(
            Duration::from_millis(settings.heartbeat.interval_ms),
            Duration::from_millis(settings.heartbeat.timeout_ms),
        );
        let _ = tokio::spawn(read_loop(Arc::downgrade(self), id, events));
        Ok(())
    }

    // ── Connection lifecycle ────────────────────────────────────────

    fn handle_socket_error(&self, id: &ConnectionId, message: String) {
        warn!(connection_id = %id, error = %message, "socket error");
        self.record_error(message);
    }

    fn handle_close(&self, id: &ConnectionId, code: u16, reason: &str) {
        let Some(info) = self.connections.remove_socket(id) else {
            return;
        };
        info!(connection_id = %id, port = info.port, code, reason, "connection closed");
        self.record_disconnect(id, code, reason);
        self.settle_if_disconnected(code, reason);
    }

    /// The heartbeat already dropped these connections; the transports'
    /// own close reports will find nothing left to remove.
    fn handle_heartbeat_timeout(&self, removed: &[ConnectionInfo]) {
        if removed.is_empty() {
            return;
        }
        for info in removed {
            warn!(connection_id = %info.id, port = info.port, "connection dropped by heartbeat");
            self.record_disconnect(
                &info.id,
                close_codes::HEARTBEAT_TIMEOUT,
                HEARTBEAT_TIMEOUT_REASON,
            );
        }
        self.settle_if_disconnected(close_codes::HEARTBEAT_TIMEOUT, HEARTBEAT_TIMEOUT_REASON);
    }

    /// Once the last connection is gone, reject everything in flight.
    fn settle_if_disconnected(&self, code: u16, reason: &str) {
        if self.connections.is_connected() {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.connections.stop_heartbeat();
        let reason = if reason.is_empty() {
            format!("closed with code {code}")
        } else {
            format!("{reason} (code {code})")
        };
        let rejected = self.fail_everything(&BridgeError::disconnected(reason));
        if rejected > 0 {
            warn!(rejected, "rejected in-flight requests after disconnect");
        }
    }

    /// Reject every queued and pending request with `error`.
    fn fail_everything(&self, error: &BridgeError) -> usize {
        let queued: Vec<QueuedRequest> = self.queue.lock().drain(..).collect();
        let count = queued.len();
        for item in queued {
            let _ = item.reply.send(Err(error.clone()));
        }
        count + self.tracker.reject_all(error)
    }

    // ── Admission ───────────────────────────────────────────────────

    fn admit(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Admission, BridgeError> {
        let coalesce_key = self.tracker.create_coalesce_key(action, &payload);
        let mut queue = self.queue.lock();

        if let Some(existing) = coalesce_key
            .as_deref()
            .and_then(|key| self.tracker.get_coalesced_request(key))
        {
            debug!(action, "joined in-flight request");
            return Ok(Admission::Pending(existing));
        }

        if queue.is_empty() && self.tracker.has_capacity() {
            let (id, response) = self.tracker.create_request(action, timeout, coalesce_key);
            drop(queue);
            self.transmit(&id, action, payload);
            return Ok(Admission::Pending(response));
        }

        let max_queued = self.settings.limits.max_queued_requests;
        if queue.len() >= max_queued {
            let error = BridgeError::Capacity {
                pending: self.tracker.pending_count(),
                queued: queue.len(),
                max_queued,
            };
            warn!(action, %error, "rejecting request");
            return Err(error);
        }

        let (reply, slot) = oneshot::channel();
        queue.push_back(QueuedRequest {
            action: action.to_owned(),
            payload,
            timeout,
            coalesce_key,
            reply,
        });
        debug!(action, queued = queue.len(), "request queued");
        Ok(Admission::Queued(slot))
    }

    /// Move queued requests onto the wire while capacity remains.
    fn drain_queue(&self) {
        loop {
            let (id, item, response) = {
                let mut queue = self.queue.lock();
                if !self.connections.is_connected() || !self.tracker.has_capacity() {
                    return;
                }
                let Some(item) = queue.pop_front() else {
                    return;
                };
                if item.reply.is_closed() {
                    debug!(action = %item.action, "dropping queued request, caller gone");
                    continue;
                }
                if let Some(existing) = item
                    .coalesce_key
                    .as_deref()
                    .and_then(|key| self.tracker.get_coalesced_request(key))
                {
                    let _ = item.reply.send(Ok(existing));
                    continue;
                }
                let (id, response) =
                    self.tracker
                        .create_request(&item.action, item.timeout, item.coalesce_key.clone());
                (id, item, response)
            };

            let QueuedRequest {
                action,
                payload,
                reply,
                ..
            } = item;
            debug!(request_id = %id, action = %action, "dequeued request");
            let _ = reply.send(Ok(response));
            self.transmit(&id, &action, payload);
        }
    }

    /// Put a tracked request on the wire; a refused send rejects it.
    fn transmit(&self, id: &RequestId, action: &str, payload: Value) {
        let sent = encode_request(id, action, payload)
            .map_err(|e| e.to_string())
            .and_then(|text| self.connections.send_primary(&text).map_err(|e| e.to_string()));
        if let Err(message) = sent {
            warn!(request_id = %id, action, error = %message, "failed to send request");
            let _ = self.tracker.reject_request(
                id,
                BridgeError::SendFailure {
                    action: action.to_owned(),
                    message,
                },
            );
        }
    }
}

async fn read_loop(
    bridge: Weak<BridgeInner>,
    id: ConnectionId,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = bridge.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(text) => {
                let _ = inner.router.handle_inbound(&id, &text);
            }
            TransportEvent::Error(message) => inner.handle_socket_error(&id, message),
            TransportEvent::Closed { code, reason } => {
                inner.handle_close(&id, code, &reason);
                return;
            }
        }
    }
    if let Some(inner) = bridge.upgrade() {
        inner.handle_close(&id, close_codes::ABNORMAL, "transport ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[tokio::test]
    async fn disabled_bridge_rejects_without_connecting() {
        let settings = BridgeSettings {
            enabled: false,
            ..BridgeSettings::default()
        };
        let (connector, _peers) = MemoryConnector::new();
        let attempts = connector.clone();
        let bridge = AutomationBridge::new(settings, connector);

        bridge.start().await;
        let err = bridge
            .send_automation_request("list_assets", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Disabled);
        assert_eq!(attempts.attempts(), 0);
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let (connector, _peers) = MemoryConnector::new();
        let bridge = AutomationBridge::new(BridgeSettings::default(), connector);
        bridge.stop();
        bridge.stop();
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn status_before_connecting() {
        let (connector, _peers) = MemoryConnector::new();
        let bridge = AutomationBridge::new(BridgeSettings::default(), connector);
        let status = bridge.get_status();
        assert!(status.enabled);
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.pending_requests, 0);
        assert_eq!(status.queued_requests, 0);
        assert!(status.connections.is_empty());
        assert!(!status.auto_launch.launched);
    }

    #[tokio::test]
    async fn refused_connection_is_a_connectivity_error() {
        let (connector, _peers) = MemoryConnector::new();
        connector.set_refusing(true);
        let bridge = AutomationBridge::new(BridgeSettings::default(), connector);
        let mut events = bridge.subscribe();

        let err = bridge
            .send_automation_request("list_assets", json!({}))
            .await
            .unwrap_err();
        assert_matches!(err, BridgeError::Connectivity { .. });
        assert_matches!(events.try_recv(), Ok(BridgeEvent::Error { .. }));
        assert!(bridge.get_status().last_error.is_some());
    }

    #[test]
    fn request_options_timeout() {
        assert!(RequestOptions::default().timeout.is_none());
        assert_eq!(
            RequestOptions::with_timeout(Duration::from_secs(2)).timeout,
            Some(Duration::from_secs(2))
        );
    }
}
