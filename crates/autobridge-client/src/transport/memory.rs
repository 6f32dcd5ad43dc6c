//! In-process transport.
//!
//! [`MemoryConnector`] hands the peer side of every accepted connection to
//! its owner as a [`PeerSocket`]. Useful for embedding the bridge next to an
//! in-process peer and for driving the bridge deterministically in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use autobridge_core::protocol::close_codes;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    ConnectTarget, Connector, EVENT_CHANNEL_CAPACITY, OUTBOUND_CHANNEL_CAPACITY, Outgoing,
    TransportError, TransportEvent, TransportPair, TransportSink,
};

/// What the peer side observes from the bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    /// A text frame sent by the bridge.
    Text(String),
    /// The bridge closed the connection.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Connector whose peers live in the same process.
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<PeerSocket>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Create a connector and the stream of peer sockets it accepts.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerSocket>) {
        let (accept, incoming) = mpsc::unbounded_channel();
        let connector = Self {
            accept,
            refusing: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        (connector, incoming)
    }

    /// Refuse (or stop refusing) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of connect attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<TransportPair, TransportError> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = || TransportError::Connect {
            url: target.url(),
            message: "connection refused".to_string(),
        };
        if self.refusing.load(Ordering::SeqCst) {
            return Err(refused());
        }

        let (sink, mut outgoing) = TransportSink::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let peer = PeerSocket {
            target: target.clone(),
            inbound,
            events: events_tx.clone(),
            client: sink.clone(),
        };
        if self.accept.send(peer).is_err() {
            return Err(refused());
        }

        // Relay bridge -> peer. A close from the bridge side is echoed back
        // to the bridge as a Closed event, as a real close handshake would.
        let client = sink.clone();
        let _ = tokio::spawn(async move {
            while let Some(item) = outgoing.recv().await {
                match item {
                    Outgoing::Text(text) => {
                        let _ = inbound_tx.send(PeerMessage::Text(text));
                    }
                    Outgoing::Close { code, reason } => {
                        client.mark_closed();
                        let _ = inbound_tx.send(PeerMessage::Closed {
                            code,
                            reason: reason.clone(),
                        });
                        let _ = events_tx.send(TransportEvent::Closed { code, reason }).await;
                        break;
                    }
                }
            }
        });

        Ok(TransportPair {
            sink,
            events,
            remote_addr: None,
            protocol: target.protocols.first().cloned(),
        })
    }
}

/// Peer end of an in-process connection.
#[derive(Debug)]
pub struct PeerSocket {
    target: ConnectTarget,
    inbound: mpsc::UnboundedReceiver<PeerMessage>,
    events: mpsc::Sender<TransportEvent>,
    client: TransportSink,
}

impl PeerSocket {
    /// The target the bridge connected to.
    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Next thing the bridge sent. `None` once the bridge side is gone.
    pub async fn recv(&mut self) -> Option<PeerMessage> {
        self.inbound.recv().await
    }

    /// Next text frame parsed as JSON.
    ///
    /// Returns `None` on close or on a frame that is not JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        match self.recv().await? {
            PeerMessage::Text(text) => serde_json::from_str(&text).ok(),
            PeerMessage::Closed { .. } => None,
        }
    }

    /// Next JSON frame whose `type` is `frame_type`, discarding others.
    pub async fn recv_frame(&mut self, frame_type: &str) -> Option<Value> {
        loop {
            let frame = self.recv_json().await?;
            if frame.get("type").and_then(Value::as_str) == Some(frame_type) {
                return Some(frame);
            }
        }
    }

    /// Wait until the bridge closes this connection, discarding frames.
    pub async fn recv_close(&mut self) -> Option<(u16, String)> {
        loop {
            if let PeerMessage::Closed { code, reason } = self.recv().await? {
                return Some((code, reason));
            }
        }
    }

    /// Frame already sent by the bridge, without waiting.
    pub fn try_recv(&mut self) -> Option<PeerMessage> {
        self.inbound.try_recv().ok()
    }

    /// Send a text frame to the bridge.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.events
            .try_send(TransportEvent::Message(text.into()))
            .is_ok()
    }

    /// Send a JSON frame to the bridge.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Answer the bridge's hello with `ack`, returning the hello frame.
    pub async fn accept_handshake(&mut self, ack: Value) -> Option<Value> {
        let hello = self.recv_frame("hello").await?;
        let mut ack = ack;
        if let Value::Object(map) = &mut ack {
            let _ = map.insert("type".to_string(), Value::from("ack"));
        }
        self.send_json(&ack).then_some(hello)
    }

    /// Report a socket error to the bridge.
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.events
            .try_send(TransportEvent::Error(message.into()))
            .is_ok()
    }

    /// Close the connection from the peer side.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.client.mark_closed();
        let _ = self.events.try_send(TransportEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    /// Drop the connection without a close frame.
    pub fn abort(self) {
        self.close(close_codes::ABNORMAL, "connection lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> ConnectTarget {
        ConnectTarget {
            host: "memory".into(),
            port: 8090,
            protocols: vec!["mcp-automation".into()],
            capability_token: None,
        }
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut incoming) = MemoryConnector::new();
        let mut pair = connector.connect(&target()).await.unwrap();
        let mut peer = incoming.recv().await.unwrap();
        assert_eq!(pair.protocol.as_deref(), Some("mcp-automation"));

        pair.sink.send(r#"{"type":"ping","timestamp":1}"#).unwrap();
        let frame = peer.recv_json().await.unwrap();
        assert_eq!(frame["type"], "ping");

        assert!(peer.send_json(&json!({"type": "pong"})));
        assert_eq!(
            pair.events.recv().await,
            Some(TransportEvent::Message(r#"{"type":"pong"}"#.into()))
        );
    }

    #[tokio::test]
    async fn refusing_connector_fails() {
        let (connector, _incoming) = MemoryConnector::new();
        connector.set_refusing(true);
        let err = connector.connect(&target()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn bridge_close_reaches_both_sides() {
        let (connector, mut incoming) = MemoryConnector::new();
        let mut pair = connector.connect(&target()).await.unwrap();
        let mut peer = incoming.recv().await.unwrap();

        pair.sink.close(4004, "unexpected frame");
        assert_eq!(peer.recv_close().await, Some((4004, "unexpected frame".into())));
        assert_eq!(
            pair.events.recv().await,
            Some(TransportEvent::Closed {
                code: 4004,
                reason: "unexpected frame".into()
            })
        );
        assert!(!pair.sink.is_open());
    }

    #[tokio::test]
    async fn peer_close_marks_sink_closed() {
        let (connector, mut incoming) = MemoryConnector::new();
        let mut pair = connector.connect(&target()).await.unwrap();
        let peer = incoming.recv().await.unwrap();

        peer.close(1000, "bye");
        assert!(!pair.sink.is_open());
        assert_matches::assert_matches!(
            pair.events.recv().await,
            Some(TransportEvent::Closed { code: 1000, .. })
        );
    }

    #[tokio::test]
    async fn accept_handshake_replies_with_ack() {
        let (connector, mut incoming) = MemoryConnector::new();
        let mut pair = connector.connect(&target()).await.unwrap();
        let mut peer = incoming.recv().await.unwrap();

        pair.sink.send(r#"{"type":"hello"}"#).unwrap();
        let hello = peer.accept_handshake(json!({"sessionId": "s1"})).await.unwrap();
        assert_eq!(hello["type"], "hello");

        let Some(TransportEvent::Message(text)) = pair.events.recv().await else {
            panic!("expected ack");
        };
        let ack: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(ack, json!({"type": "ack", "sessionId": "s1"}));
    }
}
