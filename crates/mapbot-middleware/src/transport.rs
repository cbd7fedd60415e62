//! Device transport seam.
//!
//! The device link never touches sockets directly. It asks a
//! [`DeviceTransport`] for a fresh [`DeviceConnection`] (a text sink plus a
//! text stream) every time it (re)connects.
//!
//! - [`WebSocketTransport`] – the robot's WebSocket endpoint, via
//!   `tokio-tungstenite`.
//! - [`ChannelTransport`] – in-process peer built from Tokio channels; lets
//!   tests and local runs play the robot's side of the conversation.

use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future, sink, stream};
use mapbot_types::{DeviceCommand, MapError};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

/// Outbound half of a device connection. Items are serialized JSON texts.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = MapError> + Send>>;

/// Inbound half of a device connection. Ends when the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, MapError>> + Send>>;

/// One open connection to the robot.
pub struct DeviceConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Open a new connection. Timeouts are the caller's concern.
    async fn connect(&self) -> Result<DeviceConnection, MapError>;

    /// Human-readable peer address for log lines.
    fn describe(&self) -> String;
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket
// ────────────────────────────────────────────────────────────────────────────

pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            url: format!("ws://{host}:{port}"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DeviceTransport for WebSocketTransport {
    async fn connect(&self) -> Result<DeviceConnection, MapError> {
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| MapError::Transport(format!("connect {}: {e}", self.url)))?;
        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx
            .sink_map_err(|e| MapError::Transport(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, MapError>(Message::Text(text.into()))));

        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| MapError::Serialization(e.to_string())),
                ),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "device sent close frame");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(MapError::Transport(e.to_string()))),
            })
        });

        Ok(DeviceConnection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-process channel transport
// ────────────────────────────────────────────────────────────────────────────

/// How a [`ChannelTransport`] answers the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    Refuse,
    /// Never answer; the attempt hangs until the caller gives up.
    Stall,
    /// Accept, but never complete a write: a robot that stopped reading.
    Unresponsive,
}

/// The robot's side of one [`ChannelTransport`] connection.
pub struct DevicePeer {
    /// Texts the link transmitted.
    pub received: mpsc::UnboundedReceiver<String>,
    /// Texts (or errors) to inject into the link's inbound stream. Dropping
    /// this ends the stream, which the link sees as a closed socket.
    pub outbound: mpsc::UnboundedSender<Result<String, MapError>>,
}

impl DevicePeer {
    /// Inject one inbound JSON message.
    pub fn send_json(&self, value: &Value) -> Result<(), MapError> {
        self.send_raw(value.to_string())
    }

    /// Inject raw text, malformed or not.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), MapError> {
        self.outbound
            .send(Ok(text.into()))
            .map_err(|_| MapError::Channel("device link stream closed".into()))
    }

    /// Next command the link transmitted, decoded.
    pub async fn next_command(&mut self) -> Option<DeviceCommand> {
        while let Some(text) = self.received.recv().await {
            if let Ok(cmd) = serde_json::from_str(&text) {
                return Some(cmd);
            }
        }
        None
    }
}

pub struct ChannelTransport {
    peers: mpsc::UnboundedSender<DevicePeer>,
    mode: Mutex<ConnectMode>,
    delay: Mutex<Duration>,
    attempts: AtomicUsize,
}

impl ChannelTransport {
    /// Create a transport plus the receiver on which every accepted
    /// connection's [`DevicePeer`] is handed out.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DevicePeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let transport = Self {
            peers,
            mode: Mutex::new(ConnectMode::Accept),
            delay: Mutex::new(Duration::ZERO),
            attempts: AtomicUsize::new(0),
        };
        (transport, accepted)
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    /// Hold every later connection attempt for `delay` before answering.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Number of connection attempts seen so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceTransport for ChannelTransport {
    async fn connect(&self) -> Result<DeviceConnection, MapError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap_or_else(|e| e.into_inner());
        match mode {
            ConnectMode::Refuse => {
                return Err(MapError::Transport("connection refused".into()));
            }
            ConnectMode::Stall => future::pending::<()>().await,
            ConnectMode::Accept | ConnectMode::Unresponsive => {}
        }
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (to_device, received) = mpsc::unbounded_channel::<String>();
        let (outbound, from_device) = mpsc::unbounded_channel::<Result<String, MapError>>();

        self.peers
            .send(DevicePeer { received, outbound })
            .map_err(|_| MapError::Transport("no device listening".into()))?;

        let sink: FrameSink = if mode == ConnectMode::Unresponsive {
            Box::pin(sink::unfold(to_device, |tx, _text: String| async move {
                future::pending::<()>().await;
                Ok::<_, MapError>(tx)
            }))
        } else {
            Box::pin(sink::unfold(to_device, |tx, text: String| async move {
                tx.send(text)
                    .map_err(|_| MapError::Transport("device hung up".into()))?;
                Ok::<_, MapError>(tx)
            }))
        };
        let stream = stream::unfold(from_device, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(DeviceConnection {
            sink,
            stream: Box::pin(stream),
        })
    }

    fn describe(&self) -> String {
        "in-process channel".to_string()
    }
}
