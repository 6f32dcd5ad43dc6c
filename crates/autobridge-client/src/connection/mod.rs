//! Connection table.
//!
//! Owns every registered transport sink. The first registered connection
//! becomes primary; removing the primary clears it without failing over.

mod heartbeat;

pub use heartbeat::{HeartbeatResult, run_heartbeat};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use autobridge_core::ConnectionId;
use autobridge_core::protocol::OutboundFrame;
use autobridge_core::protocol::close_codes::HEARTBEAT_TIMEOUT;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handshake::HandshakeMetadata;
use crate::transport::{TransportError, TransportSink};

/// Close reason sent when the heartbeat gives up on the peer.
pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Read-only view of one connection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// Peer port.
    pub port: u16,
    /// Remote IP address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    /// Remote port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    /// Negotiated sub-protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Peer session id from the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Sanitized handshake metadata.
    pub metadata: HandshakeMetadata,
    /// When the connection was registered.
    pub connected_at: DateTime<Utc>,
    /// Whether outbound sends use this connection.
    pub primary: bool,
}

struct Record {
    info: ConnectionInfo,
    sink: TransportSink,
}

#[derive(Default)]
struct Table {
    records: HashMap<ConnectionId, Record>,
    primary: Option<ConnectionId>,
}

impl Table {
    fn snapshot(&self, record: &Record) -> ConnectionInfo {
        let mut info = record.info.clone();
        info.primary = self.primary.as_ref() == Some(&info.id);
        info
    }
}

/// Called with the connections dropped by a heartbeat timeout.
type TimeoutHook = Arc<dyn Fn(Vec<ConnectionInfo>) + Send + Sync>;

/// Tracks live connections to the peer.
pub struct ConnectionManager {
    table: RwLock<Table>,
    /// Bumped on every inbound frame; the heartbeat watches it advance.
    message_seq: AtomicU64,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
    heartbeat: Mutex<Option<CancellationToken>>,
    on_heartbeat_timeout: Mutex<Option<TimeoutHook>>,
}

impl ConnectionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            message_seq: AtomicU64::new(0),
            last_message_at: Mutex::new(None),
            heartbeat: Mutex::new(None),
            on_heartbeat_timeout: Mutex::new(None),
        }
    }

    /// Install the callback run after a heartbeat timeout drops every
    /// connection. It runs with no table lock held.
    pub fn set_heartbeat_timeout_hook(
        &self,
        hook: impl Fn(Vec<ConnectionInfo>) + Send + Sync + 'static,
    ) {
        *self.on_heartbeat_timeout.lock() = Some(Arc::new(hook));
    }

    /// Register a handshaken socket. The first one becomes primary.
    pub fn register_socket(
        &self,
        sink: TransportSink,
        port: u16,
        metadata: HandshakeMetadata,
        remote: Option<SocketAddr>,
        protocol: Option<String>,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        let info = ConnectionInfo {
            id: id.clone(),
            port,
            remote_address: remote.map(|a| a.ip().to_string()),
            remote_port: remote.map(|a| a.port()),
            protocol,
            session_id: metadata.session_id().map(str::to_owned),
            metadata,
            connected_at: Utc::now(),
            primary: false,
        };

        let mut table = self.table.write();
        if table.primary.is_none() {
            table.primary = Some(id.clone());
        }
        let _ = table.records.insert(id.clone(), Record { info, sink });
        info!(connection_id = %id, port, total = table.records.len(), "connection registered");
        id
    }

    /// Remove a connection. Returns `None` if it was already gone.
    pub fn remove_socket(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        let mut table = self.table.write();
        let record = table.records.remove(id)?;
        let was_primary = table.primary.as_ref() == Some(id);
        if was_primary {
            table.primary = None;
        }
        let mut info = record.info;
        info.primary = was_primary;
        debug!(connection_id = %id, was_primary, remaining = table.records.len(), "connection removed");
        Some(info)
    }

    /// Remove every connection, returning what was removed.
    pub fn take_all(&self) -> Vec<ConnectionInfo> {
        let mut table = self.table.write();
        let primary = table.primary.take();
        table
            .records
            .drain()
            .map(|(id, record)| {
                let mut info = record.info;
                info.primary = primary.as_ref() == Some(&id);
                info
            })
            .collect()
    }

    /// Whether any connection is registered.
    pub fn is_connected(&self) -> bool {
        !self.table.read().records.is_empty()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.table.read().records.len()
    }

    /// Id of the primary connection.
    pub fn primary_id(&self) -> Option<ConnectionId> {
        self.table.read().primary.clone()
    }

    /// Snapshot of every connection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let table = self.table.read();
        let mut all: Vec<_> = table.records.values().map(|r| table.snapshot(r)).collect();
        all.sort_by_key(|c| c.connected_at);
        all
    }

    /// Snapshot of one connection.
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        let table = self.table.read();
        table.records.get(id).map(|r| table.snapshot(r))
    }

    /// Send on the primary connection.
    pub fn send_primary(&self, text: &str) -> Result<(), TransportError> {
        let table = self.table.read();
        let record = table
            .primary
            .as_ref()
            .and_then(|id| table.records.get(id))
            .ok_or(TransportError::NotConnected)?;
        record.sink.send(text)
    }

    /// Send on a specific connection.
    pub fn send_to(&self, id: &ConnectionId, text: &str) -> Result<(), TransportError> {
        let table = self.table.read();
        let record = table.records.get(id).ok_or(TransportError::NotConnected)?;
        record.sink.send(text)
    }

    /// Send to every connection. Returns how many accepted the frame.
    pub fn broadcast(&self, text: &str) -> usize {
        let table = self.table.read();
        let mut delivered = 0;
        for (id, record) in &table.records {
            match record.sink.send(text) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(connection_id = %id, error = %e, "broadcast send failed"),
            }
        }
        delivered
    }

    /// Request close of one connection. The record stays until the
    /// transport reports the close.
    pub fn close(&self, id: &ConnectionId, code: u16, reason: &str) -> bool {
        let table = self.table.read();
        match table.records.get(id) {
            Some(record) => {
                record.sink.close(code, reason);
                true
            }
            None => false,
        }
    }

    /// Request close of every connection without waiting.
    pub fn close_all(&self, code: u16, reason: &str) {
        let table = self.table.read();
        for record in table.records.values() {
            record.sink.close(code, reason);
        }
        if !table.records.is_empty() {
            info!(code, reason, count = table.records.len(), "closing all connections");
        }
    }

    /// Record inbound activity.
    pub fn update_last_message_time(&self) {
        let _ = self.message_seq.fetch_add(1, Ordering::Relaxed);
        *self.last_message_at.lock() = Some(Utc::now());
    }

    /// When the last inbound frame arrived.
    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        *self.last_message_at.lock()
    }

    pub(crate) fn message_seq(&self) -> u64 {
        self.message_seq.load(Ordering::Relaxed)
    }

    /// Ping every connection.
    pub(crate) fn ping_all(&self) {
        match OutboundFrame::ping().to_json() {
            Ok(ping) => {
                let _ = self.broadcast(&ping);
            }
            Err(e) => warn!(error = %e, "failed to encode ping"),
        }
    }

    /// Start the liveness heartbeat. A zero interval disables it; calling
    /// again while it runs is a no-op.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration, timeout: Duration) {
        if interval.is_zero() {
            debug!("heartbeat disabled");
            return;
        }
        let mut slot = self.heartbeat.lock();
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        drop(slot);

        let manager = Arc::downgrade(self);
        let _ = tokio::spawn(async move {
            let result = run_heartbeat(manager.clone(), interval, timeout, cancel).await;
            if result == HeartbeatResult::TimedOut {
                if let Some(manager) = manager.upgrade() {
                    manager.drop_silent_connections(timeout);
                }
            }
        });
    }

    /// Close and forget every connection after the peer went quiet. The
    /// records go now; a silent peer may never answer the close.
    fn drop_silent_connections(&self, timeout: Duration) {
        warn!(?timeout, "peer stopped responding, closing connections");
        self.close_all(HEARTBEAT_TIMEOUT, HEARTBEAT_TIMEOUT_REASON);
        let removed = self.take_all();
        self.stop_heartbeat();
        let hook = self.on_heartbeat_timeout.lock().clone();
        if let Some(hook) = hook {
            hook(removed);
        }
    }

    /// Stop the heartbeat if it is running.
    pub fn stop_heartbeat(&self) {
        if let Some(cancel) = self.heartbeat.lock().take() {
            cancel.cancel();
        }
    }

    /// Whether the heartbeat task is running.
    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outgoing;
    use tokio::sync::mpsc;

    fn sink() -> (TransportSink, mpsc::Receiver<Outgoing>) {
        TransportSink::channel(8)
    }

    #[test]
    fn first_registration_becomes_primary() {
        let manager = ConnectionManager::new();
        assert!(!manager.is_connected());

        let (a, _rx_a) = sink();
        let (b, _rx_b) = sink();
        let first = manager.register_socket(a, 8090, HandshakeMetadata::default(), None, None);
        let second = manager.register_socket(b, 8091, HandshakeMetadata::default(), None, None);

        assert!(manager.is_connected());
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(manager.primary_id(), Some(first.clone()));
        assert!(manager.get(&first).unwrap().primary);
        assert!(!manager.get(&second).unwrap().primary);
    }

    #[test]
    fn removing_primary_does_not_fail_over() {
        let manager = ConnectionManager::new();
        let (a, _rx_a) = sink();
        let (b, _rx_b) = sink();
        let first = manager.register_socket(a, 8090, HandshakeMetadata::default(), None, None);
        let _second = manager.register_socket(b, 8090, HandshakeMetadata::default(), None, None);

        let removed = manager.remove_socket(&first).unwrap();
        assert!(removed.primary);
        assert!(manager.primary_id().is_none());
        assert!(manager.is_connected());
        assert_eq!(manager.send_primary("x"), Err(TransportError::NotConnected));
    }

    #[test]
    fn remove_is_idempotent() {
        let manager = ConnectionManager::new();
        let (a, _rx) = sink();
        let id = manager.register_socket(a, 8090, HandshakeMetadata::default(), None, None);
        assert!(manager.remove_socket(&id).is_some());
        assert!(manager.remove_socket(&id).is_none());
        assert!(!manager.is_connected());
    }

    #[test]
    fn registration_records_remote_and_session() {
        let manager = ConnectionManager::new();
        let (a, _rx) = sink();
        let mut ack = serde_json::Map::new();
        let _ = ack.insert("sessionId".into(), serde_json::json!("sess-9"));
        let id = manager.register_socket(
            a,
            8090,
            HandshakeMetadata::from_ack(ack),
            Some("127.0.0.1:50123".parse().unwrap()),
            Some("mcp-automation".into()),
        );
        let info = manager.get(&id).unwrap();
        assert_eq!(info.remote_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(info.remote_port, Some(50123));
        assert_eq!(info.session_id.as_deref(), Some("sess-9"));
        assert_eq!(info.protocol.as_deref(), Some("mcp-automation"));
    }

    #[tokio::test]
    async fn send_primary_and_broadcast() {
        let manager = ConnectionManager::new();
        let (a, mut rx_a) = sink();
        let (b, mut rx_b) = sink();
        let _ = manager.register_socket(a, 1, HandshakeMetadata::default(), None, None);
        let _ = manager.register_socket(b, 1, HandshakeMetadata::default(), None, None);

        manager.send_primary("only-primary").unwrap();
        assert_eq!(rx_a.recv().await, Some(Outgoing::Text("only-primary".into())));
        assert!(rx_b.try_recv().is_err());

        assert_eq!(manager.broadcast("all"), 2);
        assert_eq!(rx_a.recv().await, Some(Outgoing::Text("all".into())));
        assert_eq!(rx_b.recv().await, Some(Outgoing::Text("all".into())));
    }

    #[tokio::test]
    async fn close_all_keeps_records_until_transport_closes() {
        let manager = ConnectionManager::new();
        let (a, mut rx) = sink();
        let _ = manager.register_socket(a, 1, HandshakeMetadata::default(), None, None);

        manager.close_all(1001, "stopping");
        assert!(manager.is_connected());
        assert_eq!(
            rx.recv().await,
            Some(Outgoing::Close {
                code: 1001,
                reason: "stopping".into()
            })
        );
        assert_eq!(manager.take_all().len(), 1);
        assert!(!manager.is_connected());
    }

    #[test]
    fn last_message_time_updates() {
        let manager = ConnectionManager::new();
        assert!(manager.last_message_at().is_none());
        manager.update_last_message_time();
        assert!(manager.last_message_at().is_some());
        assert_eq!(manager.message_seq(), 1);
    }

    #[tokio::test]
    async fn zero_interval_disables_heartbeat() {
        let manager = Arc::new(ConnectionManager::new());
        manager.start_heartbeat(Duration::ZERO, Duration::from_secs(1));
        assert!(!manager.heartbeat_running());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_and_closes_silent_connections() {
        let manager = Arc::new(ConnectionManager::new());
        let (a, mut rx) = sink();
        let _ = manager.register_socket(a, 1, HandshakeMetadata::default(), None, None);
        manager.start_heartbeat(Duration::from_millis(100), Duration::from_millis(300));
        assert!(manager.heartbeat_running());

        let mut pings = 0;
        let close = loop {
            match rx.recv().await.unwrap() {
                Outgoing::Text(text) => {
                    assert!(text.contains("\"ping\""));
                    pings += 1;
                }
                Outgoing::Close { code, .. } => break code,
            }
        };
        assert_eq!(close, HEARTBEAT_TIMEOUT);
        assert!(pings >= 2);
        assert!(!manager.heartbeat_running());
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_hands_dropped_connections_to_hook() {
        let manager = Arc::new(ConnectionManager::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        manager.set_heartbeat_timeout_hook(move |removed| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(removed);
            }
        });
        let (a, _rx_a) = sink();
        let id = manager.register_socket(a, 8090, HandshakeMetadata::default(), None, None);
        manager.start_heartbeat(Duration::from_millis(100), Duration::from_millis(300));

        let removed = rx.await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, id);
        assert!(removed[0].primary);
        assert!(!manager.is_connected());
        assert!(manager.primary_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_heartbeat_cancels() {
        let manager = Arc::new(ConnectionManager::new());
        manager.start_heartbeat(Duration::from_millis(100), Duration::from_millis(300));
        manager.stop_heartbeat();
        assert!(!manager.heartbeat_running());
    }
}
