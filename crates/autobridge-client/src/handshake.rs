//! Hello/ack handshake.
//!
//! Runs once per transport, before the socket is registered. The whole
//! exchange is a single future raced against the handshake deadline, so
//! the timeout, error and close paths need no listener cleanup.

use std::time::Duration;

use autobridge_core::HandshakeError;
use autobridge_core::logging::sanitize_for_log;
use autobridge_core::protocol::{InboundFrame, OutboundFrame, close_codes};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};

use crate::transport::{TransportEvent, TransportSink};

/// Replacement for redacted metadata values.
pub const REDACTED: &str = "[redacted]";

const REDACTED_KEYS: &[&str] = &["capabilityToken", "capability_token", "token"];
const VERSION_KEYS: &[&str] = &["version", "pluginVersion", "serverVersion"];

/// Handshake parameters.
#[derive(Clone, Debug)]
pub struct HandshakeOptions {
    /// Deadline for the whole exchange, post-open delay included.
    pub timeout: Duration,
    /// Pause before sending hello so the peer can attach its listener.
    pub hello_delay: Duration,
    /// Token included in the hello frame.
    pub capability_token: Option<String>,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            hello_delay: Duration::from_millis(50),
            capability_token: None,
        }
    }
}

/// Sanitized ack payload attached to a connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HandshakeMetadata(Map<String, Value>);

impl HandshakeMetadata {
    /// Strip the frame type and redact credentials from an ack payload.
    pub fn from_ack(mut ack: Map<String, Value>) -> Self {
        let _ = ack.remove("type");
        for key in REDACTED_KEYS {
            if let Some(value) = ack.get_mut(*key) {
                *value = Value::from(REDACTED);
            }
        }
        Self(ack)
    }

    /// Peer session id, if the ack carried one.
    pub fn session_id(&self) -> Option<&str> {
        self.0.get("sessionId").and_then(Value::as_str)
    }

    /// Peer version, if the ack carried one.
    pub fn peer_version(&self) -> Option<&str> {
        VERSION_KEYS
            .iter()
            .find_map(|key| self.0.get(*key).and_then(Value::as_str))
    }

    /// Raw metadata field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Metadata as a JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Send hello and wait for exactly one ack.
///
/// On failure the transport is closed with the code for the failure class
/// (unless the peer already closed it) and the error is returned.
pub async fn initiate_handshake(
    sink: &TransportSink,
    events: &mut mpsc::Receiver<TransportEvent>,
    options: &HandshakeOptions,
) -> Result<HandshakeMetadata, HandshakeError> {
    #[allow(clippy::cast_possible_truncation)]
    let timeout_ms = options.timeout.as_millis() as u64;

    let outcome = match time::timeout(options.timeout, exchange(sink, events, options)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout { timeout_ms }),
    };

    match &outcome {
        Ok(metadata) => {
            debug!(session_id = ?metadata.session_id(), "handshake complete");
        }
        Err(err) => {
            warn!(error = %err, "handshake failed");
            if let Some(code) = err.close_code() {
                sink.close(code, &err.to_string());
            }
        }
    }
    outcome
}

async fn exchange(
    sink: &TransportSink,
    events: &mut mpsc::Receiver<TransportEvent>,
    options: &HandshakeOptions,
) -> Result<HandshakeMetadata, HandshakeError> {
    if !options.hello_delay.is_zero() {
        time::sleep(options.hello_delay).await;
    }

    let hello = OutboundFrame::Hello {
        capability_token: options.capability_token.clone(),
    };
    let text = hello.to_json().map_err(|e| HandshakeError::Transport {
        message: e.to_string(),
    })?;
    sink.send(text).map_err(|e| HandshakeError::Transport {
        message: e.to_string(),
    })?;

    match events.recv().await {
        Some(TransportEvent::Message(text)) => match InboundFrame::parse(&text) {
            Ok(InboundFrame::Ack(map)) => Ok(HandshakeMetadata::from_ack(map)),
            Ok(other) => Err(HandshakeError::UnexpectedFrame {
                frame_type: sanitize_for_log(other.frame_type()),
            }),
            Err(e) => Err(HandshakeError::InvalidPayload {
                detail: e.to_string(),
            }),
        },
        Some(TransportEvent::Error(message)) => Err(HandshakeError::Transport { message }),
        Some(TransportEvent::Closed { code, reason }) => Err(HandshakeError::Closed {
            code,
            reason: sanitize_for_log(&reason),
        }),
        None => Err(HandshakeError::Closed {
            code: close_codes::ABNORMAL,
            reason: "transport dropped".to_string(),
        }),
    }
}
