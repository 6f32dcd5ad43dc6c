//! # autobridge-client
//!
//! Client side of the automation bridge: a long-lived connection to a
//! stateful peer process carrying request/response traffic.
//!
//! - **Transport**: [`transport::Connector`] abstraction with WebSocket and
//!   in-memory implementations
//! - **Connections**: [`connection::ConnectionManager`] tracks sockets, the
//!   primary connection and heartbeat liveness
//! - **Handshake**: [`handshake::initiate_handshake`] gates traffic on a
//!   hello/ack exchange
//! - **Requests**: [`tracker::RequestTracker`] owns in-flight requests,
//!   timeouts and coalescing
//! - **Routing**: [`router::MessageRouter`] classifies inbound frames and
//!   drives two-phase completion
//! - **Orchestration**: [`bridge::AutomationBridge`] is the public entry point

#![deny(unsafe_code)]

pub mod bridge;
pub mod connection;
pub mod events;
pub mod handshake;
pub mod launcher;
pub mod policy;
pub mod router;
pub mod status;
pub mod tracker;
pub mod transport;

pub use bridge::{AutomationBridge, RequestOptions};
pub use events::BridgeEvent;
pub use launcher::{LaunchError, LaunchOptions, LaunchedPeer, PeerLauncher, ProcessLauncher};
pub use status::{BridgeStatus, ConnectionState};
pub use transport::{ConnectTarget, Connector, MemoryConnector, PeerSocket, WsConnector};
