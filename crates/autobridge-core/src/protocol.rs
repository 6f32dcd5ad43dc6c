//! Wire envelope for the automation bridge.
//!
//! Every frame is one JSON object whose `type` field selects the shape:
//! `hello`, `ack`, `request`, `response`, `event`, `ping`, `pong`, `goodbye`.
//! Outbound frames are serialized from [`OutboundFrame`]; inbound text is
//! classified by [`InboundFrame::parse`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::RequestId;

/// Error code attached to responses whose echoed action does not match.
pub const ACTION_MISMATCH: &str = "ACTION_MISMATCH";

/// WebSocket close codes used by the bridge.
pub mod close_codes {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (bridge shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// No ack before the handshake deadline.
    pub const HANDSHAKE_TIMEOUT: u16 = 4002;
    /// First handshake frame was not valid JSON.
    pub const HANDSHAKE_INVALID_PAYLOAD: u16 = 4003;
    /// First handshake frame was not an ack.
    pub const HANDSHAKE_UNEXPECTED_FRAME: u16 = 4004;
    /// Peer stopped sending anything across several heartbeat ticks.
    pub const HEARTBEAT_TIMEOUT: u16 = 4005;
}

// ── Outbound ────────────────────────────────────────────────────────

/// Frames the bridge sends to the peer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Opening frame of the handshake.
    #[serde(rename_all = "camelCase")]
    Hello {
        /// Shared-secret capability token, when configured.
        #[serde(skip_serializing_if = "Option::is_none")]
        capability_token: Option<String>,
    },
    /// Application request.
    #[serde(rename_all = "camelCase")]
    Request {
        /// Correlation identifier echoed by the response.
        request_id: RequestId,
        /// Action name.
        action: String,
        /// Action arguments.
        payload: Value,
    },
    /// Liveness check.
    Ping {
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
    /// Liveness reply.
    Pong {
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
    /// Shutdown notice.
    Goodbye {
        /// Human-readable reason.
        reason: String,
    },
}

impl OutboundFrame {
    /// Build a ping stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Build a pong stamped with the current time.
    #[must_use]
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Serialize to the text sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// Why inbound text could not be classified.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Text is not JSON.
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    /// JSON is not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// Object has no string `type` field.
    #[error("frame has no type field")]
    MissingType,
    /// Known type, malformed body.
    #[error("malformed {frame_type} frame: {source}")]
    InvalidBody {
        /// The `type` field.
        frame_type: String,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

/// Body of a `response` frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    /// Request being answered.
    pub request_id: RequestId,
    /// Whether the peer considers the action successful.
    #[serde(default)]
    pub success: bool,
    /// Human-readable message.
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: Option<String>,
    /// Error code or description.
    #[serde(default, deserialize_with = "lenient_string")]
    pub error: Option<String>,
    /// Action-specific result payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Action the peer believes it answered.
    #[serde(default)]
    pub action: Option<String>,
}

impl ResponseFrame {
    /// The echoed action: the frame's own `action`, else `result.action`.
    #[must_use]
    pub fn echoed_action(&self) -> Option<&str> {
        self.action.as_deref().or_else(|| {
            self.result
                .as_ref()
                .and_then(|r| r.get("action"))
                .and_then(Value::as_str)
        })
    }
}

/// Body of an `event` frame.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    /// Request this event completes, if any.
    #[serde(default)]
    pub request_id: Option<RequestId>,
    /// Event name.
    #[serde(default)]
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Option<Value>,
    /// Result carried directly on the frame.
    #[serde(default)]
    pub result: Option<Value>,
    /// Outcome carried directly on the frame.
    #[serde(default)]
    pub success: Option<bool>,
    /// Message carried directly on the frame.
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: Option<String>,
    /// Error carried directly on the frame.
    #[serde(default, deserialize_with = "lenient_string")]
    pub error: Option<String>,
}

impl EventFrame {
    fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.get(key))
    }

    /// Outcome from the frame, falling back to `payload.success`.
    #[must_use]
    pub fn outcome(&self) -> Option<bool> {
        self.success
            .or_else(|| self.payload_field("success").and_then(Value::as_bool))
    }

    /// Message from the frame, falling back to `payload.message`.
    #[must_use]
    pub fn outcome_message(&self) -> Option<String> {
        self.message.clone().or_else(|| {
            self.payload_field("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
    }

    /// Error from the frame, falling back to `payload.error`.
    #[must_use]
    pub fn outcome_error(&self) -> Option<String> {
        self.error
            .clone()
            .or_else(|| self.payload_field("error").and_then(value_to_text))
    }

    /// Result from the frame, falling back to `payload.result`.
    #[must_use]
    pub fn outcome_result(&self) -> Option<Value> {
        self.result
            .clone()
            .or_else(|| self.payload_field("result").cloned())
    }
}

/// A classified inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Peer-initiated hello (unexpected for a client).
    Hello(Map<String, Value>),
    /// Handshake acknowledgement carrying peer metadata.
    Ack(Map<String, Value>),
    /// Peer-initiated request (unexpected for a client).
    Request(Map<String, Value>),
    /// Response to a bridge request.
    Response(ResponseFrame),
    /// Out-of-band event.
    Event(EventFrame),
    /// Liveness check from the peer.
    Ping,
    /// Liveness reply from the peer.
    Pong,
    /// Peer is going away.
    Goodbye {
        /// Optional reason.
        reason: Option<String>,
    },
    /// A frame type this bridge does not know.
    Unknown(String),
}

impl InboundFrame {
    /// Classify raw inbound text.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(FrameError::InvalidJson)?;
        let Value::Object(map) = value else {
            return Err(FrameError::NotAnObject);
        };
        let frame_type = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_owned();

        let frame = match frame_type.as_str() {
            "hello" => Self::Hello(map),
            "ack" => Self::Ack(map),
            "request" => Self::Request(map),
            "response" => Self::Response(decode(&frame_type, Value::Object(map))?),
            "event" => Self::Event(decode(&frame_type, Value::Object(map))?),
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "goodbye" => Self::Goodbye {
                reason: map.get("reason").and_then(value_to_text),
            },
            _ => Self::Unknown(frame_type.clone()),
        };
        Ok(frame)
    }

    /// The wire `type` of this frame.
    #[must_use]
    pub fn frame_type(&self) -> &str {
        match self {
            Self::Hello(_) => "hello",
            Self::Ack(_) => "ack",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Goodbye { .. } => "goodbye",
            Self::Unknown(t) => t,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(frame_type: &str, value: Value) -> Result<T, FrameError> {
    serde_json::from_value(value).map_err(|source| FrameError::InvalidBody {
        frame_type: frame_type.to_owned(),
        source,
    })
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Accept a string, null, or any other JSON value (rendered as JSON text).
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_text))
}

// ── Caller-facing response ──────────────────────────────────────────

/// The settled outcome of an automation request, as delivered to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationResponse {
    /// Request this response settles.
    pub request_id: RequestId,
    /// Whether the action succeeded.
    pub success: bool,
    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error code or description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Action-specific result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Action echoed by the peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl From<ResponseFrame> for AutomationResponse {
    fn from(frame: ResponseFrame) -> Self {
        Self {
            request_id: frame.request_id,
            success: frame.success,
            message: frame.message,
            error: frame.error,
            result: frame.result,
            action: frame.action,
        }
    }
}
