//! # autobridge-core
//!
//! Shared vocabulary for the automation bridge:
//!
//! - **Wire envelope**: [`protocol::OutboundFrame`], [`protocol::InboundFrame`],
//!   [`protocol::AutomationResponse`] and close codes
//! - **Errors**: [`errors::BridgeError`] taxonomy via `thiserror`
//! - **Branded IDs**: [`ids::RequestId`], [`ids::ConnectionId`]
//! - **Version checks**: [`version::compare_versions`], [`version::check_version`]
//! - **Logging**: [`logging::init_subscriber`], [`logging::sanitize_for_log`]

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod version;

pub use errors::{BridgeError, HandshakeError};
pub use ids::{ConnectionId, RequestId};
pub use protocol::{AutomationResponse, InboundFrame, OutboundFrame};
