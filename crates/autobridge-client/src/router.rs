//! Inbound frame dispatch.
//!
//! Classifies each inbound frame and drives the two-phase completion
//! protocol for pending requests:
//!
//! ```text
//! AWAITING_INITIAL --response(fail | done marker)--> SETTLED
//! AWAITING_INITIAL --response(ack)-----------------> AWAITING_EVENT
//! AWAITING_EVENT   --response | event--------------> SETTLED
//! ```
//!
//! Requests that do not wait for an event settle on their first response.
//! Frames for settled requests are logged and discarded.

use std::sync::Arc;

use autobridge_core::logging::sanitize_for_log;
use autobridge_core::protocol::{
    ACTION_MISMATCH, AutomationResponse, EventFrame, InboundFrame, OutboundFrame, ResponseFrame,
    close_codes,
};
use autobridge_core::{ConnectionId, RequestId};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::connection::ConnectionManager;
use crate::events::BridgeEvent;
use crate::policy::{CompletionPolicy, EchoPolicy, EchoVerdict};
use crate::tracker::{RequestStage, RequestTracker};

/// What the router did with a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Routed {
    /// Frame exceeded the size limit.
    Oversized,
    /// Frame could not be parsed.
    Malformed,
    /// A pending request settled.
    Settled(RequestId),
    /// A request moved to waiting for its completion event.
    AwaitingEvent(RequestId),
    /// Frame referenced a request that is not pending, or not waiting for it.
    Discarded,
    /// Event published to subscribers.
    Published,
    /// Ping answered.
    Pong,
    /// Peer said goodbye; its connection is closing.
    Goodbye,
    /// Frame needs no action.
    Ignored,
}

/// Routes inbound frames to the tracker and connection table.
pub struct MessageRouter {
    tracker: RequestTracker,
    connections: Arc<ConnectionManager>,
    completion: CompletionPolicy,
    echo: EchoPolicy,
    events: broadcast::Sender<BridgeEvent>,
    max_frame_bytes: usize,
}

impl MessageRouter {
    /// Create a router.
    pub fn new(
        tracker: RequestTracker,
        connections: Arc<ConnectionManager>,
        completion: CompletionPolicy,
        echo: EchoPolicy,
        events: broadcast::Sender<BridgeEvent>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            tracker,
            connections,
            completion,
            echo,
            events,
            max_frame_bytes,
        }
    }

    /// Handle one inbound text frame from `connection_id`.
    #[instrument(skip_all, fields(connection_id = %connection_id, frame_type))]
    pub fn handle_inbound(&self, connection_id: &ConnectionId, text: &str) -> Routed {
        if text.len() > self.max_frame_bytes {
            warn!(
                bytes = text.len(),
                limit = self.max_frame_bytes,
                "dropping oversized frame"
            );
            return Routed::Oversized;
        }
        self.connections.update_last_message_time();

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, frame = %sanitize_for_log(text), "dropping malformed frame");
                return Routed::Malformed;
            }
        };
        let _ = tracing::Span::current().record("frame_type", frame.frame_type());

        match frame {
            InboundFrame::Response(response) => self.handle_response(response),
            InboundFrame::Event(event) => self.handle_event(event),
            InboundFrame::Ping => self.reply_pong(connection_id),
            InboundFrame::Pong => Routed::Ignored,
            InboundFrame::Goodbye { reason } => {
                let reason = reason.as_deref().map_or_else(String::new, sanitize_for_log);
                debug!(%reason, "peer said goodbye");
                let _ = self
                    .connections
                    .close(connection_id, close_codes::NORMAL, "peer goodbye");
                Routed::Goodbye
            }
            InboundFrame::Hello(_) | InboundFrame::Ack(_) | InboundFrame::Request(_) => {
                debug!("ignoring unexpected frame after handshake");
                Routed::Ignored
            }
            InboundFrame::Unknown(frame_type) => {
                debug!(frame_type = %sanitize_for_log(&frame_type), "ignoring unknown frame type");
                Routed::Ignored
            }
        }
    }

    fn handle_response(&self, frame: ResponseFrame) -> Routed {
        let id = frame.request_id.clone();
        let Some(pending) = self.tracker.get_pending_request(&id) else {
            debug!(request_id = %id, "discarding response for settled request");
            return Routed::Discarded;
        };

        let echoed = frame.echoed_action().map(str::to_owned);
        let mut response = AutomationResponse::from(frame);
        self.apply_echo_check(&pending.action, echoed.as_deref(), &mut response);

        if !pending.wait_for_event {
            return self.resolve(&id, response);
        }

        match pending.stage {
            RequestStage::AwaitingInitial => {
                if !response.success
                    || self
                        .completion
                        .is_done(&pending.action, response.result.as_ref())
                {
                    return self.resolve(&id, response);
                }
                let timeout = self.completion.event_timeout(&pending.action);
                if self.tracker.await_completion_event(&id, response, timeout) {
                    Routed::AwaitingEvent(id)
                } else {
                    Routed::Discarded
                }
            }
            RequestStage::AwaitingEvent => {
                let merged = merge_responses(pending.initial_response, response);
                self.resolve(&id, merged)
            }
        }
    }

    fn handle_event(&self, event: EventFrame) -> Routed {
        let Some(request_id) = event.request_id.as_ref() else {
            debug!(event = %sanitize_for_log(&event.event), "publishing unsolicited event");
            let _ = self.events.send(BridgeEvent::Message(event));
            return Routed::Published;
        };

        // Events for settled or non-waiting requests are late duplicates.
        let pending = self
            .tracker
            .get_pending_request(request_id)
            .filter(|p| p.wait_for_event);
        let Some(pending) = pending else {
            debug!(
                %request_id,
                event = %sanitize_for_log(&event.event),
                "dropping event for a request not awaiting one"
            );
            return Routed::Discarded;
        };

        if pending.stage == RequestStage::AwaitingInitial {
            debug!(request_id = %pending.request_id, "completion event arrived before initial response");
        }
        let completed = merge_event(&pending.request_id, pending.initial_response, &event);
        self.resolve(&pending.request_id, completed)
    }

    fn resolve(&self, id: &RequestId, response: AutomationResponse) -> Routed {
        if self.tracker.resolve_request(id, response) {
            Routed::Settled(id.clone())
        } else {
            Routed::Discarded
        }
    }

    fn reply_pong(&self, connection_id: &ConnectionId) -> Routed {
        let pong = match OutboundFrame::pong().to_json() {
            Ok(pong) => pong,
            Err(e) => {
                warn!(error = %e, "failed to encode pong");
                return Routed::Ignored;
            }
        };
        if let Err(e) = self.connections.send_to(connection_id, &pong) {
            debug!(error = %e, "failed to send pong");
        }
        Routed::Pong
    }

    fn apply_echo_check(
        &self,
        expected: &str,
        echoed: Option<&str>,
        response: &mut AutomationResponse,
    ) {
        let verdict = self.echo.check(expected, echoed);
        if verdict != EchoVerdict::Mismatch {
            return;
        }
        let echoed = echoed.map_or_else(String::new, sanitize_for_log);
        warn!(
            request_id = %response.request_id,
            expected,
            echoed = %echoed,
            "response echoed a different action"
        );
        mark_mismatch(response, expected, &echoed);
    }
}

fn mark_mismatch(response: &mut AutomationResponse, expected: &str, echoed: &str) {
    response.success = false;
    if response.error.as_deref().is_none_or(str::is_empty) {
        response.error = Some(ACTION_MISMATCH.to_string());
    }
    let note = format!("action mismatch: requested '{expected}', response echoed '{echoed}'");
    response.message = Some(match response.message.take().filter(|m| !m.is_empty()) {
        Some(message) => format!("{message} ({note})"),
        None => note,
    });
}

/// Merge a second response over the stored initial one.
fn merge_responses(
    initial: Option<AutomationResponse>,
    latest: AutomationResponse,
) -> AutomationResponse {
    let Some(initial) = initial else {
        return latest;
    };
    AutomationResponse {
        request_id: latest.request_id,
        success: latest.success,
        message: latest.message.or(initial.message),
        error: latest.error.or(initial.error),
        result: latest.result.or(initial.result),
        action: latest.action.or(initial.action),
    }
}

/// Build the final response from a completion event, falling back to the
/// initial response for anything the event omits.
fn merge_event(
    id: &RequestId,
    initial: Option<AutomationResponse>,
    event: &EventFrame,
) -> AutomationResponse {
    let error = event.outcome_error();
    let success = event.outcome().unwrap_or_else(|| {
        error.is_none() && initial.as_ref().is_none_or(|i| i.success)
    });
    let (message, initial_error, result, action) = match initial {
        Some(i) => (i.message, i.error, i.result, i.action),
        None => (None, None, None, None),
    };
    AutomationResponse {
        request_id: id.clone(),
        success,
        message: event.outcome_message().or(message),
        error: error.or(initial_error),
        result: event.outcome_result().or(result),
        action,
    }
}

/// Encode an outbound request frame.
pub fn encode_request(
    request_id: &RequestId,
    action: &str,
    payload: Value,
) -> Result<String, serde_json::Error> {
    OutboundFrame::Request {
        request_id: request_id.clone(),
        action: action.to_owned(),
        payload,
    }
    .to_json()
}
