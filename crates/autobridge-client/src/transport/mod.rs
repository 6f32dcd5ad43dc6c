//! Abstract bidirectional message socket.
//!
//! A [`Connector`] opens a [`TransportPair`]: a clonable [`TransportSink`]
//! with a single writer task behind it, and a receiver of
//! [`TransportEvent`]s fed by the socket's reader task. The rest of the crate
//! never touches a concrete socket type.

mod memory;
mod websocket;

pub use memory::{MemoryConnector, PeerMessage, PeerSocket};
pub use websocket::{CAPABILITY_TOKEN_HEADER, CLOSE_HANDSHAKE_TIMEOUT, WsConnector};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default capacity of a transport's outbound channel.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Default capacity of a transport's inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Longest close reason a WebSocket close frame can carry.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Transport-level failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying error.
        message: String,
    },
    /// The request to open the socket could not be built.
    #[error("invalid connect request for {url}: {message}")]
    InvalidRequest {
        /// Target URL.
        url: String,
        /// What was wrong.
        message: String,
    },
    /// The socket is closed.
    #[error("transport is closed")]
    Closed,
    /// The outbound buffer is full.
    #[error("transport send buffer is full")]
    Full,
    /// There is no connection to send on.
    #[error("no primary connection")]
    NotConnected,
}

/// Where and how to connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Peer host.
    pub host: String,
    /// Peer port.
    pub port: u16,
    /// Offered sub-protocols.
    pub protocols: Vec<String>,
    /// Capability token sent as a header.
    pub capability_token: Option<String>,
}

impl ConnectTarget {
    /// `ws://host:port` for this target.
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Something that happened on the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame.
    Message(String),
    /// A socket error. Always followed by [`TransportEvent::Closed`].
    Error(String),
    /// The socket closed.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Item consumed by a transport's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    /// Send a text frame.
    Text(String),
    /// Send a close frame and stop writing.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half of a transport. Clones share the same writer task.
#[derive(Clone, Debug)]
pub struct TransportSink {
    tx: mpsc::Sender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl TransportSink {
    /// Create a sink and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        };
        (sink, rx)
    }

    /// Queue a text frame.
    ///
    /// Fails synchronously when the socket is closed or the buffer is full.
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.tx
            .try_send(Outgoing::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Full,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    /// Request a close. Does not wait for the close handshake.
    pub fn close(&self, code: u16, reason: &str) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let reason = clamp_reason(reason).to_owned();
        if self.tx.try_send(Outgoing::Close { code, reason }).is_err() {
            tracing::debug!(code, "close frame not queued, writer already gone");
        }
    }

    /// Whether frames can still be queued.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Mark the socket closed from the read side.
    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// An opened socket.
#[derive(Debug)]
pub struct TransportPair {
    /// Write half.
    pub sink: TransportSink,
    /// Inbound events, in arrival order.
    pub events: mpsc::Receiver<TransportEvent>,
    /// Remote address, when the transport has one.
    pub remote_addr: Option<SocketAddr>,
    /// Negotiated sub-protocol.
    pub protocol: Option<String>,
}

/// Opens transports to the peer.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a socket to `target`.
    async fn connect(&self, target: &ConnectTarget) -> Result<TransportPair, TransportError>;
}

fn clamp_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
