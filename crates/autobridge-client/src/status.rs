//! Read-only status snapshot.

use autobridge_core::version::VersionReport;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection::ConnectionInfo;
use crate::handshake::HandshakeMetadata;

/// Connection lifecycle of the bridge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    Disconnected,
    /// Opening a transport.
    Connecting,
    /// Transport open, hello/ack in progress.
    Handshaking,
    /// At least one registered connection.
    Connected,
}

/// Last successful handshake.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRecord {
    /// When it completed.
    pub at: DateTime<Utc>,
    /// Peer port.
    pub port: u16,
    /// Sanitized ack metadata.
    pub metadata: HandshakeMetadata,
}

/// Last failed handshake.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeFailureRecord {
    /// When it failed.
    pub at: DateTime<Utc>,
    /// Peer port.
    pub port: u16,
    /// Error description.
    pub error: String,
}

/// Last disconnect.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRecord {
    /// When the connection closed.
    pub at: DateTime<Utc>,
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

/// Last error.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Description.
    pub message: String,
}

/// Auto-launch state.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoLaunchStatus {
    /// Whether auto-launch is configured.
    pub enabled: bool,
    /// Whether the one automatic launch has been used.
    pub launched: bool,
    /// Pid of the last launched peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Snapshot of the bridge, computed on demand.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    /// Whether the bridge is enabled.
    pub enabled: bool,
    /// Connection lifecycle state.
    pub state: ConnectionState,
    /// Whether any connection is registered.
    pub connected: bool,
    /// Peer host.
    pub host: String,
    /// Peer ports.
    pub ports: Vec<u16>,
    /// Registered connections.
    pub connections: Vec<ConnectionInfo>,
    /// Last successful handshake.
    pub last_handshake: Option<HandshakeRecord>,
    /// Last failed handshake.
    pub last_handshake_failure: Option<HandshakeFailureRecord>,
    /// Last disconnect.
    pub last_disconnect: Option<DisconnectRecord>,
    /// Last error.
    pub last_error: Option<ErrorRecord>,
    /// When the last inbound frame arrived.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Requests on the wire.
    pub pending_requests: usize,
    /// Concurrency limit.
    pub max_pending_requests: usize,
    /// Requests waiting for capacity.
    pub queued_requests: usize,
    /// Queue bound.
    pub max_queued_requests: usize,
    /// Peer version check from the last handshake.
    pub version: Option<VersionReport>,
    /// Auto-launch state.
    pub auto_launch: AutoLaunchStatus,
}

/// Diagnostic history kept by the bridge for status reporting.
#[derive(Clone, Debug, Default)]
pub(crate) struct Diagnostics {
    pub(crate) last_handshake: Option<HandshakeRecord>,
    pub(crate) last_handshake_failure: Option<HandshakeFailureRecord>,
    pub(crate) last_disconnect: Option<DisconnectRecord>,
    pub(crate) last_error: Option<ErrorRecord>,
    pub(crate) version: Option<VersionReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_value(ConnectionState::Handshaking).unwrap();
        assert_eq!(json, "handshaking");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn auto_launch_omits_missing_pid() {
        let json = serde_json::to_value(AutoLaunchStatus::default()).unwrap();
        assert!(json.get("pid").is_none());
        assert_eq!(json["launched"], false);
    }
}
