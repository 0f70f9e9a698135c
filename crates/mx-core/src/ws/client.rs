//! Single WebSocket session with STOMP framing and heart-beats.
//!
//! Each session opened by [`WsConnector`] runs as a tokio task that:
//! 1. Connects to the broker WebSocket endpoint (TLS when `wss://`).
//! 2. Decodes inbound text messages into STOMP frames and forwards them.
//! 3. Encodes outbound frames queued by the connection manager.
//! 4. Sends an EOL heart-beat on a timer.
//! 5. Reports why it ended, exactly once, then exits.
//!
//! Reconnection is deliberately *not* handled here; a closed session is gone
//! and the owner decides whether to open another.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::MxError;
use crate::stomp::{self, Frame};

/// Capacity of the per-session inbound and outbound queues.
const QUEUE_CAPACITY: usize = 1024;

/// Something that happened on an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded STOMP frame.
    Frame(Frame),
    /// The session ended. Always the last event.
    Closed(String),
}

/// Handles to one open transport session.
///
/// Dropping `outbound` or signalling `shutdown` closes the session.
pub struct TransportSession {
    /// Frames to write to the broker.
    pub outbound: mpsc::Sender<Frame>,
    /// Frames read from the broker, terminated by [`TransportEvent::Closed`].
    pub inbound: mpsc::Receiver<TransportEvent>,
    /// Shutdown signal for the session task.
    pub shutdown: watch::Sender<bool>,
}

impl TransportSession {
    /// Build a session from raw channel halves.
    pub fn new(
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<TransportEvent>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            shutdown,
        }
    }
}

/// Opens transport sessions. One call = one physical connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Broker host name sent in the STOMP `host` header.
    fn host(&self) -> String;

    /// Open a new session.
    async fn open(&self) -> Result<TransportSession, MxError>;
}

/// Configuration for the WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnConfig {
    /// Full WebSocket URL (e.g. `ws://localhost:8080/ws`).
    pub url: String,
    /// Extra HTTP headers for the handshake.
    pub extra_headers: HashMap<String, String>,
    /// Interval between outbound heart-beats. `None` disables them.
    pub heartbeat_interval: Option<Duration>,
}

/// Production [`Connector`] over `tokio-tungstenite`.
pub struct WsConnector {
    config: WsConnConfig,
}

impl WsConnector {
    pub fn new(config: WsConnConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn host(&self) -> String {
        extract_host(&self.config.url)
    }

    async fn open(&self) -> Result<TransportSession, MxError> {
        info!("[ws] connecting to {}", self.config.url);
        let stream = connect_ws(&self.config).await?;
        info!("[ws] handshake completed");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(QUEUE_CAPACITY);
        let heartbeat = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let reason =
                session_loop(stream, heartbeat, outbound_rx, inbound_tx.clone(), shutdown_rx).await;
            let _ = inbound_tx.send(TransportEvent::Closed(reason)).await;
        });

        Ok(TransportSession::new(outbound_tx, inbound_rx, shutdown_tx))
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Read/write loop for one session. Returns the close reason.
async fn session_loop(
    stream: WsStream,
    heartbeat: Option<Duration>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    inbound_tx: mpsc::Sender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> String {
    let (mut ws_write, mut ws_read) = stream.split();

    tokio::pin! {
        let heartbeat_tick = async {
            if let Some(period) = heartbeat {
                let mut interval = tokio::time::interval(period);
                // First tick fires immediately; skip it.
                interval.tick().await;
                loop {
                    interval.tick().await;
                }
            } else {
                std::future::pending::<()>().await
            }
        };
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("[ws] shutdown signal received");
                let _ = ws_write
                    .send(Message::Text(Frame::disconnect().encode().into()))
                    .await;
                let _ = ws_write.close().await;
                return "closed by client".to_string();
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match stomp::decode(&text) {
                        Ok(frames) => {
                            for frame in frames {
                                if inbound_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                    let _ = ws_write.close().await;
                                    return "session dropped".to_string();
                                }
                            }
                        }
                        Err(e) => warn!("[ws] undecodable frame dropped: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!("[ws] received close frame");
                        return frame
                            .map(|f| format!("closed by server: {}", f.reason.as_str()))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Err(e)) => {
                        error!("[ws] read error: {e}");
                        return format!("read error: {e}");
                    }
                    None => {
                        warn!("[ws] stream ended");
                        return "stream ended".to_string();
                    }
                    _ => {} // Binary, Pong, Frame — ignore
                }
            }

            out = outbound_rx.recv() => {
                let Some(frame) = out else {
                    let _ = ws_write.close().await;
                    return "session dropped".to_string();
                };
                if let Err(e) = ws_write.send(Message::Text(frame.encode().into())).await {
                    error!("[ws] send error: {e}");
                    return format!("send error: {e}");
                }
            }

            _ = &mut heartbeat_tick => {
                if let Err(e) = ws_write.send(Message::Text("\n".into())).await {
                    error!("[ws] heart-beat send error: {e}");
                    return format!("heart-beat error: {e}");
                }
            }
        }
    }
}

/// Establish the WebSocket connection.
async fn connect_ws(config: &WsConnConfig) -> Result<WsStream, MxError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| MxError::WebSocket(format!("invalid url {}: {e}", config.url)))?;

    // STOMP-over-WebSocket brokers negotiate the sub-protocol.
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("v12.stomp"));

    for (key, value) in &config.extra_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| MxError::WebSocket(format!("invalid header name {key}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| MxError::WebSocket(format!("invalid header value for {key}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| MxError::WebSocket(e.to_string()))?;
    Ok(stream)
}

/// Extract the host from a URL string.
fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.host_str().unwrap_or("").to_string())
        .unwrap_or_default()
}
