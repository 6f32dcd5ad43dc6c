//! Error taxonomy for the automation bridge.
//!
//! [`BridgeError`] is what callers of `send_request` receive. It is `Clone`
//! because coalesced callers share a single underlying request and must all
//! observe the identical outcome.
//!
//! An action-echo mismatch is deliberately absent: it is delivered as a
//! resolved response with `success == false` and
//! [`ACTION_MISMATCH`](crate::protocol::ACTION_MISMATCH) as its error code.

use thiserror::Error;

use crate::protocol::close_codes;

// ── Error code constants ────────────────────────────────────────────

/// Not connected, lazy connect failed or auto-launch failed.
pub const CONNECTIVITY_ERROR: &str = "CONNECTIVITY_ERROR";
/// Hello/ack exchange failed.
pub const HANDSHAKE_ERROR: &str = "HANDSHAKE_ERROR";
/// No settlement before the per-request deadline.
pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
/// Initial response arrived but the completion event did not.
pub const EVENT_TIMEOUT: &str = "EVENT_TIMEOUT";
/// The transport refused the outbound frame.
pub const SEND_FAILED: &str = "SEND_FAILED";
/// Concurrency limit and secondary queue are both exhausted.
pub const CAPACITY_EXCEEDED: &str = "CAPACITY_EXCEEDED";
/// The peer connection closed while the request was in flight.
pub const DISCONNECTED: &str = "DISCONNECTED";
/// The bridge was stopped while the request was in flight.
pub const SERVER_STOPPED: &str = "SERVER_STOPPED";
/// The bridge is disabled by configuration.
pub const BRIDGE_DISABLED: &str = "BRIDGE_DISABLED";

/// Why a hello/ack handshake failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// No frame arrived before the handshake deadline.
    #[error("handshake timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The first frame was not parseable JSON.
    #[error("invalid handshake payload: {detail}")]
    InvalidPayload {
        /// Parser detail.
        detail: String,
    },

    /// The first frame parsed but was not an `ack`.
    #[error("expected ack frame, received '{frame_type}'")]
    UnexpectedFrame {
        /// The `type` field of the offending frame.
        frame_type: String,
    },

    /// The transport reported an error mid-handshake.
    #[error("transport error during handshake: {message}")]
    Transport {
        /// Transport error description.
        message: String,
    },

    /// The transport closed before an ack arrived.
    #[error("connection closed during handshake ({code}: {reason})")]
    Closed {
        /// Close code reported by the transport.
        code: u16,
        /// Close reason reported by the transport.
        reason: String,
    },
}

impl HandshakeError {
    /// Close code the bridge sends when abandoning the socket for this failure.
    ///
    /// Returns `None` when the socket is already gone.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Timeout { .. } => Some(close_codes::HANDSHAKE_TIMEOUT),
            Self::InvalidPayload { .. } => Some(close_codes::HANDSHAKE_INVALID_PAYLOAD),
            Self::UnexpectedFrame { .. } => Some(close_codes::HANDSHAKE_UNEXPECTED_FRAME),
            Self::Transport { .. } => Some(close_codes::ABNORMAL),
            Self::Closed { .. } => None,
        }
    }
}

/// Errors surfaced to callers of the bridge.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The bridge could not reach the peer.
    #[error("automation peer unavailable: {message}")]
    Connectivity {
        /// What went wrong.
        message: String,
    },

    /// The transport opened but the handshake failed.
    #[error("{0}")]
    Handshake(#[from] HandshakeError),

    /// No response before the request deadline.
    #[error("request '{action}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Requested action.
        action: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// Initial response arrived, completion event did not.
    #[error("request '{action}' was acknowledged but no completion event arrived within {timeout_ms}ms")]
    EventTimeout {
        /// Requested action.
        action: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The transport rejected the outbound frame.
    #[error("failed to send request '{action}': {message}")]
    SendFailure {
        /// Requested action.
        action: String,
        /// Transport error description.
        message: String,
    },

    /// Concurrency limit reached and the queue is full.
    #[error("request capacity exhausted ({pending} in flight, {queued}/{max_queued} queued)")]
    Capacity {
        /// Requests currently in flight.
        pending: usize,
        /// Requests currently queued.
        queued: usize,
        /// Queue bound.
        max_queued: usize,
    },

    /// The connection closed while the request was pending.
    #[error("connection to automation peer lost: {reason}")]
    Disconnected {
        /// Close reason.
        reason: String,
    },

    /// The bridge was stopped while the request was pending.
    #[error("automation bridge stopped")]
    Stopped,

    /// The bridge is disabled by configuration.
    #[error("automation bridge is disabled")]
    Disabled,
}

impl BridgeError {
    /// Shorthand for a connectivity error.
    #[must_use]
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
        }
    }

    /// Shorthand for a disconnect-triggered rejection.
    #[must_use]
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => CONNECTIVITY_ERROR,
            Self::Handshake(_) => HANDSHAKE_ERROR,
            Self::RequestTimeout { .. } => REQUEST_TIMEOUT,
            Self::EventTimeout { .. } => EVENT_TIMEOUT,
            Self::SendFailure { .. } => SEND_FAILED,
            Self::Capacity { .. } => CAPACITY_EXCEEDED,
            Self::Disconnected { .. } => DISCONNECTED,
            Self::Stopped => SERVER_STOPPED,
            Self::Disabled => BRIDGE_DISABLED,
        }
    }

    /// Whether resubmitting the same request later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn codes_are_distinct_per_kind() {
        let errors = [
            BridgeError::connectivity("down"),
            BridgeError::Handshake(HandshakeError::Timeout { timeout_ms: 5 }),
            BridgeError::RequestTimeout {
                action: "a".into(),
                timeout_ms: 1,
            },
            BridgeError::EventTimeout {
                action: "a".into(),
                timeout_ms: 1,
            },
            BridgeError::SendFailure {
                action: "a".into(),
                message: "closed".into(),
            },
            BridgeError::Capacity {
                pending: 1,
                queued: 1,
                max_queued: 1,
            },
            BridgeError::disconnected("gone"),
            BridgeError::Stopped,
            BridgeError::Disabled,
        ];
        let mut codes: Vec<&str> = errors.iter().map(BridgeError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn timeout_display_mentions_action_and_deadline() {
        let err = BridgeError::RequestTimeout {
            action: "list_assets".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "request 'list_assets' timed out after 250ms");
    }

    #[test]
    fn handshake_error_converts() {
        let err: BridgeError = HandshakeError::UnexpectedFrame {
            frame_type: "response".into(),
        }
        .into();
        assert_matches!(err, BridgeError::Handshake(HandshakeError::UnexpectedFrame { .. }));
        assert_eq!(err.code(), HANDSHAKE_ERROR);
        assert!(err.to_string().contains("response"));
    }

    #[test]
    fn handshake_close_codes_per_failure_class() {
        assert_eq!(
            HandshakeError::Timeout { timeout_ms: 1 }.close_code(),
            Some(close_codes::HANDSHAKE_TIMEOUT)
        );
        assert_eq!(
            HandshakeError::InvalidPayload { detail: "x".into() }.close_code(),
            Some(close_codes::HANDSHAKE_INVALID_PAYLOAD)
        );
        assert_eq!(
            HandshakeError::UnexpectedFrame {
                frame_type: "x".into()
            }
            .close_code(),
            Some(close_codes::HANDSHAKE_UNEXPECTED_FRAME)
        );
        assert_eq!(
            HandshakeError::Closed {
                code: 1000,
                reason: String::new()
            }
            .close_code(),
            None
        );
    }

    #[test]
    fn only_disabled_is_not_retryable() {
        assert!(!BridgeError::Disabled.is_retryable());
        assert!(BridgeError::Stopped.is_retryable());
        assert!(BridgeError::disconnected("x").is_retryable());
    }
}
