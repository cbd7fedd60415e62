//! `mapbot-cockpit` – The Real-Time Gateway
//!
//! Boots a lightweight HTTP + WebSocket server (default port `3000`) that:
//!
//! 1. **Bridges** the bridge's event bus to every connected browser over a
//!    persistent WebSocket so that sensor readings, map snapshots, camera
//!    frames and robot link status stream to the UI in real time.
//!
//! 2. **Accepts** upstream actions from the browser (`control`,
//!    `startMapping`, `stopMapping`, `requestStream`, `stopStream`,
//!    `calibrate`, `resetPosition`, `emergencyStop`) and routes them through
//!    the validated operator actions on [`AppContext`]. Control input is
//!    rate limited per browser.
//!
//! 3. **Serves** a small JSON/PNG API for health, status and stored maps.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mapbot_cockpit::CockpitServer;
//! use mapbot_memory::InMemoryMapStore;
//! use mapbot_middleware::WebSocketTransport;
//! use mapbot_runtime::{AppContext, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = AppContext::new(
//!         PipelineConfig::default(),
//!         Arc::new(WebSocketTransport::new("192.168.1.100", 8080)),
//!         Arc::new(InMemoryMapStore::new()),
//!     );
//!     CockpitServer::new(ctx)
//!         .run()
//!         .await
//!         .expect("gateway failed");
//! }
//! ```
//!
//! [`AppContext`]: mapbot_runtime::AppContext

pub mod protocol;
pub mod server;

pub use protocol::{ClientAction, GatewayMessage, translate_event};
pub use server::{ClientSession, CockpitServer, DEFAULT_PORT};
