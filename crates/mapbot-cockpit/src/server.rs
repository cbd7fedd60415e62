//! [`CockpitServer`] – HTTP + WebSocket gateway for browser operators.
//!
//! Listens on `0.0.0.0:3000` (configurable via [`CockpitServer::with_port`]).
//!
//! * WebSocket upgrades → bidirectional bridge between one browser and the
//!   bridge's [`AppContext`].
//! * Regular HTTP requests → a small JSON/PNG API:
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | `GET` | `/health` | liveness and uptime |
//! | `GET` | `/api/status` | device link, pose (heading in degrees), stream stats |
//! | `GET` | `/api/maps?page=&limit=&name=` | stored maps, newest first, without grids |
//! | `GET` | `/api/maps/current` | live snapshot, 404 while idle |
//! | `GET` | `/api/maps/{id}` | stored map record |
//! | `GET`/`POST` | `/api/maps/{id}/export` | PNG rendering |
//! | `DELETE` | `/api/maps/{id}` | removes a stored map |

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use mapbot_memory::MapFilter;
use mapbot_middleware::Topic;
use mapbot_runtime::{AppContext, export_map_image};
use mapbot_types::{Event, MapError, MapMetadata, MapRecord, RelayedFrame};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{ClientAction, GatewayMessage, RobotPresence, translate_event};

/// Default TCP port for the gateway.
pub const DEFAULT_PORT: u16 = 3000;

/// Control commands accepted per second from one browser.
pub const CONTROL_RATE_PER_SEC: u32 = 20;

/// Frames buffered per viewer before the relay starts skipping.
const VIEWER_BUFFER: usize = 8;

const MAX_REQUEST_HEAD: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use mapbot_cockpit::CockpitServer;
/// use mapbot_memory::InMemoryMapStore;
/// use mapbot_middleware::WebSocketTransport;
/// use mapbot_runtime::{AppContext, PipelineConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let ctx = AppContext::new(
///         PipelineConfig::default(),
///         Arc::new(WebSocketTransport::new("192.168.1.100", 8080)),
///         Arc::new(InMemoryMapStore::new()),
///     );
///     CockpitServer::new(ctx).run().await.expect("gateway failed");
/// }
/// ```
pub struct CockpitServer {
    ctx: AppContext,
    port: u16,
}

/// State shared by every connection handler.
struct Gateway {
    ctx: AppContext,
    started: Instant,
}

impl CockpitServer {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:<port>` and serve forever.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::Transport`] if the TCP listener cannot bind.
    pub async fn run(self) -> Result<(), MapError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MapError::Transport(format!("bind error on {addr}: {e}")))?;
        info!("gateway listening on http://localhost:{}", self.port);
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(self, listener: TcpListener) {
        let gateway = Arc::new(Gateway {
            ctx: self.ctx,
            started: Instant::now(),
        });

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = Arc::clone(&gateway);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, gateway).await {
                            debug!(%peer, error = %e, "client connection ended with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept error"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
) -> Result<(), MapError> {
    // `peek` leaves the request in the socket for the WebSocket handshaker.
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| MapError::Transport(format!("peek error from {peer}: {e}")))?;

    let header_preview = String::from_utf8_lossy(&buf[..n]);
    let is_ws_upgrade = header_preview.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });

    if is_ws_upgrade {
        handle_ws(stream, peer, gateway).await
    } else {
        handle_http(stream, gateway).await
    }
}

// ---------------------------------------------------------------------------
// Plain HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct HttpResponse {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl HttpResponse {
    fn json(status: u16, body: &impl Serialize) -> Self {
        match serde_json::to_vec(body) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::from_error(&MapError::from(e)),
        }
    }

    fn png(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "image/png",
            body,
        }
    }

    fn from_error(e: &MapError) -> Self {
        let status = match e {
            MapError::NotFound(_) => 404,
            MapError::Validation(_) => 400,
            _ => 500,
        };
        Self::json(status, &json!({ "error": e.to_string() }))
    }

    fn not_found(message: &str) -> Self {
        Self::json(404, &json!({ "error": message }))
    }

    fn to_bytes(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            _ => "Internal Server Error",
        };
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            self.status,
            reason,
            self.content_type,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

async fn handle_http(mut stream: TcpStream, gateway: Arc<Gateway>) -> Result<(), MapError> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| MapError::Transport(format!("HTTP read error: {e}")))?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&head);
    let mut parts = head.lines().next().unwrap_or_default().split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or("/");

    let response = route(&gateway, method, target).await;
    debug!(method, target, status = response.status, "http request");
    stream
        .write_all(&response.to_bytes())
        .await
        .map_err(|e| MapError::Transport(format!("HTTP write error: {e}")))?;
    Ok(())
}

/// Stored map without its grid, for listings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MapSummary {
    id: Uuid,
    session_id: String,
    name: String,
    width: usize,
    height: usize,
    resolution: f64,
    metadata: MapMetadata,
    created_at: DateTime<Utc>,
}

impl From<MapRecord> for MapSummary {
    fn from(r: MapRecord) -> Self {
        Self {
            id: r.id,
            session_id: r.session_id,
            name: r.name,
            width: r.width,
            height: r.height,
            resolution: r.resolution,
            metadata: r.metadata,
            created_at: r.created_at,
        }
    }
}

async fn route(gateway: &Gateway, method: &str, target: &str) -> HttpResponse {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let ctx = &gateway.ctx;

    match (method, segments.as_slice()) {
        ("GET", ["health"]) => HttpResponse::json(
            200,
            &json!({
                "status": "healthy",
                "timestamp": Utc::now().to_rfc3339(),
                "uptime": gateway.started.elapsed().as_secs_f64(),
            }),
        ),
        ("GET", ["api", "status"]) => HttpResponse::json(200, &ctx.status().await),
        ("GET", ["api", "maps"]) => {
            let page = query_param(query, "page").and_then(|v| v.parse().ok()).unwrap_or(1);
            let limit = query_param(query, "limit").and_then(|v| v.parse().ok()).unwrap_or(10);
            let filter = MapFilter {
                name_contains: query_param(query, "name").filter(|n| !n.is_empty()),
            };
            let store = ctx.mapper.lock().await.store();
            match store.find_many(&filter, page, limit).await {
                Ok(maps) => {
                    let maps: Vec<MapSummary> = maps.into_iter().map(MapSummary::from).collect();
                    HttpResponse::json(200, &json!({ "maps": maps, "page": page, "limit": limit }))
                }
                Err(e) => HttpResponse::from_error(&e),
            }
        }
        ("GET", ["api", "maps", "current"]) => match ctx.mapper.lock().await.current_map_data() {
            Some(snapshot) => HttpResponse::json(200, &snapshot),
            None => HttpResponse::not_found("No active mapping session"),
        },
        ("GET" | "POST", ["api", "maps", id, "export"]) => {
            let store = ctx.mapper.lock().await.store();
            match export_map_image(store.as_ref(), id).await {
                Ok(png) => HttpResponse::png(png),
                Err(e) => HttpResponse::from_error(&e),
            }
        }
        ("GET", ["api", "maps", id]) => {
            let Ok(id) = Uuid::parse_str(id) else {
                return HttpResponse::not_found("Map not found");
            };
            let store = ctx.mapper.lock().await.store();
            match store.find_by_id(id).await {
                Ok(record) => HttpResponse::json(200, &record),
                Err(e) => HttpResponse::from_error(&e),
            }
        }
        ("DELETE", ["api", "maps", id]) => {
            let Ok(id) = Uuid::parse_str(id) else {
                return HttpResponse::not_found("Map not found");
            };
            let store = ctx.mapper.lock().await.store();
            match store.delete(id).await {
                Ok(true) => {
                    info!(map_id = %id, "map deleted");
                    HttpResponse::json(200, &json!({ "deleted": true }))
                }
                Ok(false) => HttpResponse::not_found("Map not found"),
                Err(e) => HttpResponse::from_error(&e),
            }
        }
        _ => HttpResponse::not_found("Not found"),
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.replace('+', " "))
}

// ---------------------------------------------------------------------------
// WebSocket: one browser ↔ the bridge
// ---------------------------------------------------------------------------

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

enum Downstream {
    Forward(GatewayMessage),
    Skip,
    Closed,
}

fn downstream(result: Result<Event, RecvError>, client_id: &str) -> Downstream {
    match result {
        Ok(event) => translate_event(&event).map_or(Downstream::Skip, Downstream::Forward),
        Err(RecvError::Lagged(n)) => {
            warn!(client = client_id, skipped = n, "browser lagging behind event bus");
            Downstream::Skip
        }
        Err(RecvError::Closed) => Downstream::Closed,
    }
}

async fn send(ws_tx: &mut WsSink, message: &GatewayMessage) -> Result<(), MapError> {
    let json = message.to_json()?;
    ws_tx
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| MapError::Transport(e.to_string()))
}

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
) -> Result<(), MapError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| MapError::Transport(format!("WS handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let ctx = &gateway.ctx;
    let mut device = ctx.subscribe(Topic::DeviceStatus);
    let mut observations = ctx.subscribe(Topic::Observations);
    let mut maps = ctx.subscribe(Topic::MapUpdates);
    let mut alerts = ctx.subscribe(Topic::SystemAlerts);
    let (mut session, mut frames) = ClientSession::new(ctx.clone());
    let client_id = session.client_id().to_string();
    info!(client = %client_id, %peer, "browser connected");

    let result = async {
        send(&mut ws_tx, &session.greeting().await).await?;
        loop {
            let outgoing = tokio::select! {
                r = device.recv() => downstream(r, &client_id),
                r = observations.recv() => downstream(r, &client_id),
                r = maps.recv() => downstream(r, &client_id),
                r = alerts.recv() => downstream(r, &client_id),
                Some(frame) = frames.recv() => Downstream::Forward(GatewayMessage::Frame(frame)),
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        for reply in session.handle_text(text.as_str()).await {
                            send(&mut ws_tx, &reply).await?;
                        }
                        Downstream::Skip
                    }
                    Some(Ok(Message::Close(_))) | None => Downstream::Closed,
                    Some(Err(e)) => {
                        debug!(client = %client_id, error = %e, "websocket read error");
                        Downstream::Closed
                    }
                    Some(Ok(_)) => Downstream::Skip,
                },
            };
            match outgoing {
                Downstream::Forward(message) => send(&mut ws_tx, &message).await?,
                Downstream::Skip => {}
                Downstream::Closed => return Ok::<(), MapError>(()),
            }
        }
    }
    .await;

    session.close().await;
    info!(client = %client_id, "browser disconnected");
    result
}

// ---------------------------------------------------------------------------
// Upstream actions
// ---------------------------------------------------------------------------

/// Per-browser state: identity, frame viewer channel and control limiter.
pub struct ClientSession {
    ctx: AppContext,
    client_id: String,
    viewer: mpsc::Sender<RelayedFrame>,
    limiter: DefaultDirectRateLimiter,
}

impl ClientSession {
    /// New session plus the receiving end of its frame channel.
    pub fn new(ctx: AppContext) -> (Self, mpsc::Receiver<RelayedFrame>) {
        let (viewer, frames) = mpsc::channel(VIEWER_BUFFER);
        let rate = NonZeroU32::new(CONTROL_RATE_PER_SEC).unwrap_or(NonZeroU32::MIN);
        let session = Self {
            ctx,
            client_id: Uuid::new_v4().to_string(),
            viewer,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        };
        (session, frames)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn greeting(&self) -> GatewayMessage {
        let status = if self.ctx.link.status().await.connected {
            RobotPresence::RobotOnline
        } else {
            RobotPresence::RobotOffline
        };
        GatewayMessage::Connected {
            client_id: self.client_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            status,
        }
    }

    /// Decode and execute one upstream frame; returns the direct replies.
    pub async fn handle_text(&mut self, text: &str) -> Vec<GatewayMessage> {
        match ClientAction::parse(text) {
            Ok(action) => self.handle_action(action).await,
            Err(e) => {
                debug!(client = %self.client_id, error = %e, "rejected upstream message");
                vec![GatewayMessage::error(e.to_string())]
            }
        }
    }

    pub async fn handle_action(&mut self, action: ClientAction) -> Vec<GatewayMessage> {
        let ctx = &self.ctx;
        match action {
            ClientAction::Control(command) => {
                if self.limiter.check().is_err() {
                    warn!(client = %self.client_id, "control rate limit exceeded, command dropped");
                    return Vec::new();
                }
                match ctx.drive(command).await {
                    Ok(outcome) => {
                        debug!(client = %self.client_id, ?outcome, "control command accepted");
                        Vec::new()
                    }
                    Err(e) => failure(e, "Failed to send control command"),
                }
            }
            ClientAction::StartMapping => {
                // Confirmation reaches every browser through the bus.
                ctx.start_mapping(&self.client_id).await;
                Vec::new()
            }
            ClientAction::StopMapping => match ctx.stop_mapping().await {
                Ok(Some(_)) => Vec::new(),
                Ok(None) => vec![GatewayMessage::MappingStopped { map_id: None }],
                Err(e) => failure(e, "Failed to stop mapping"),
            },
            ClientAction::RequestStream => {
                ctx.relay
                    .lock()
                    .await
                    .add_viewer(self.client_id.clone(), Box::new(self.viewer.clone()));
                Vec::new()
            }
            ClientAction::StopStream => {
                ctx.relay.lock().await.remove_viewer(&self.client_id);
                Vec::new()
            }
            ClientAction::Calibrate(request) => {
                let distances = request.map(|r| (r.reference_distance, r.measured_distance));
                match ctx.calibrate(distances).await {
                    Ok(_) => {
                        info!(client = %self.client_id, "calibration started");
                        vec![GatewayMessage::CalibrationStarted]
                    }
                    Err(e) => failure(e, "Failed to start calibration"),
                }
            }
            ClientAction::ResetPosition(p) => match ctx.reset_position(p.x, p.y, p.theta).await {
                Ok(()) => Vec::new(),
                Err(e) => failure(e, "Failed to reset position"),
            },
            ClientAction::EmergencyStop => match ctx.emergency_stop().await {
                Ok(_) => Vec::new(),
                Err(e) => failure(e, "Failed to send emergency stop"),
            },
        }
    }

    /// Detach from the frame relay.
    pub async fn close(&self) {
        self.ctx.relay.lock().await.remove_viewer(&self.client_id);
    }
}

/// Validation errors go back verbatim; anything else is logged and
/// summarised.
fn failure(e: MapError, summary: &str) -> Vec<GatewayMessage> {
    match e {
        MapError::Validation(_) => vec![GatewayMessage::error(e.to_string())],
        other => {
            error!(error = %other, "{summary}");
            vec![GatewayMessage::error(summary)]
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
