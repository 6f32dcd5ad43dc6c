//! Bridge lifecycle notifications.
//!
//! The event set is closed, so subscribers match on [`BridgeEvent`] rather
//! than registering callbacks by name. Delivery uses a
//! `tokio::sync::broadcast` channel; slow subscribers miss events instead of
//! slowing the bridge.

use autobridge_core::protocol::EventFrame;
use autobridge_core::version::VersionReport;
use autobridge_core::{ConnectionId, HandshakeError};

use crate::handshake::HandshakeMetadata;

/// Capacity of the event channel.
pub const EVENT_CAPACITY: usize = 256;

/// Something observable happened to the bridge.
#[derive(Clone, Debug)]
pub enum BridgeEvent {
    /// A connection completed its handshake and was registered.
    Connected {
        /// New connection.
        connection_id: ConnectionId,
        /// Peer port.
        port: u16,
        /// Sanitized ack metadata.
        metadata: HandshakeMetadata,
        /// Peer version check.
        version: VersionReport,
    },
    /// A registered connection closed.
    Disconnected {
        /// Closed connection.
        connection_id: ConnectionId,
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A transport opened but the handshake failed.
    HandshakeFailed {
        /// Peer port.
        port: u16,
        /// Why it failed.
        error: HandshakeError,
    },
    /// A socket error or failed connection attempt.
    Error {
        /// Description.
        message: String,
    },
    /// An event frame with no pending request to complete.
    Message(EventFrame),
}

impl BridgeEvent {
    /// Short name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::HandshakeFailed { .. } => "handshakeFailed",
            Self::Error { .. } => "error",
            Self::Message(_) => "message",
        }
    }
}
