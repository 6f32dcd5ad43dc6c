//! WebSocket transport over `tokio-tungstenite`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autobridge_core::protocol::close_codes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ConnectTarget, Connector, EVENT_CHANNEL_CAPACITY, OUTBOUND_CHANNEL_CAPACITY, Outgoing,
    TransportError, TransportEvent, TransportPair, TransportSink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Header carrying the capability token on the upgrade request.
pub const CAPABILITY_TOKEN_HEADER: &str = "x-capability-token";

/// Close code reported when the peer closes without a status.
const NO_STATUS: u16 = 1005;

/// How long a locally initiated close waits for the peer's reply.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Close requested by this side, reported if the peer never sends its own.
type LocalClose = Arc<Mutex<Option<(u16, String)>>>;

/// Opens `ws://` connections with a writer task and a reader task per socket.
///
/// The two tasks share a cancellation token. A local close that the peer
/// leaves unanswered for [`CLOSE_HANDSHAKE_TIMEOUT`] tears the socket down
/// and reports the local close code.
#[derive(Clone, Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<TransportPair, TransportError> {
        let url = target.url();
        let invalid = |message: String| TransportError::InvalidRequest {
            url: url.clone(),
            message,
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| invalid(e.to_string()))?;
        if !target.protocols.is_empty() {
            let value = HeaderValue::from_str(&target.protocols.join(", "))
                .map_err(|e| invalid(format!("sub-protocol header: {e}")))?;
            let _ = request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        if let Some(token) = &target.capability_token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| invalid(format!("capability token header: {e}")))?;
            let _ = request.headers_mut().insert(CAPABILITY_TOKEN_HEADER, value);
        }

        let (stream, response) =
            connect_async(request)
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.clone(),
                    message: e.to_string(),
                })?;

        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let remote_addr = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            #[allow(unreachable_patterns)]
            _ => None,
        };
        debug!(%url, ?protocol, "websocket connected");

        let (sink, outgoing) = TransportSink::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (ws_tx, ws_rx) = stream.split();
        let done = CancellationToken::new();
        let local_close = LocalClose::default();
        let _ = tokio::spawn(writer_loop(ws_tx, outgoing, done.clone(), local_close.clone()));
        let _ = tokio::spawn(reader_loop(ws_rx, events_tx, sink.clone(), done, local_close));

        Ok(TransportPair {
            sink,
            events,
            remote_addr,
            protocol,
        })
    }
}

async fn writer_loop(
    mut ws_tx: futures::stream::SplitSink<WsStream, Message>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    done: CancellationToken,
    local_close: LocalClose,
) {
    loop {
        let item = tokio::select! {
            () = done.cancelled() => break,
            item = outgoing.recv() => item,
        };
        let Some(item) = item else { break };
        match item {
            Outgoing::Text(text) => {
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            Outgoing::Close { code, reason } => {
                *local_close.lock() = Some((code, reason.clone()));
                // 1005/1006/1015 are reserved for local reporting and must
                // not appear on the wire.
                let frame = (!matches!(code, 1005 | 1006 | 1015)).then(|| CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                });
                let sent = ws_tx.send(Message::Close(frame));
                match time::timeout(CLOSE_HANDSHAKE_TIMEOUT, sent).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "websocket close failed"),
                    Err(_) => debug!("websocket close frame not flushed in time"),
                }
                if time::timeout(CLOSE_HANDSHAKE_TIMEOUT, done.cancelled())
                    .await
                    .is_err()
                {
                    debug!(code, "peer did not answer close, dropping socket");
                    done.cancel();
                }
                break;
            }
        }
    }
}

async fn reader_loop(
    mut ws_rx: futures::stream::SplitStream<WsStream>,
    events: mpsc::Sender<TransportEvent>,
    sink: TransportSink,
    done: CancellationToken,
    local_close: LocalClose,
) {
    let mut closed: Option<(u16, String)> = None;

    loop {
        let item = tokio::select! {
            () = done.cancelled() => break,
            item = ws_rx.next() => item,
        };
        let Some(item) = item else { break };
        let event = match item {
            Ok(Message::Text(text)) => TransportEvent::Message(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => TransportEvent::Message(text),
                Err(_) => {
                    warn!(len = bytes.len(), "dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                closed = Some(frame.map_or_else(
                    || (NO_STATUS, String::new()),
                    |f| (u16::from(f.code), f.reason.as_str().to_owned()),
                ));
                // Keep polling so the close reply is flushed.
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                if closed.is_none() {
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                }
                break;
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }

    done.cancel();
    sink.mark_closed();
    let (code, reason) = closed
        .or_else(|| local_close.lock().take())
        .unwrap_or_else(|| (close_codes::ABNORMAL, "connection lost".to_string()));
    let _ = events.send(TransportEvent::Closed { code, reason }).await;
}
