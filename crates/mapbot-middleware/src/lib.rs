//! `mapbot-middleware` – The Nervous System
//!
//! Routes asynchronous data between the robot, the mapping pipeline, and
//! browser viewers without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.
//! - [`transport`] – [`DeviceTransport`][transport::DeviceTransport] seam with
//!   a WebSocket client and an in-process channel peer.
//! - [`device_link`] – [`DeviceLink`][device_link::DeviceLink]: the single
//!   resilient connection to the robot, with command queue, heartbeat and
//!   reconnect loop.
//! - [`frame_relay`] – [`FrameRelay`][frame_relay::FrameRelay]: bounded frame
//!   history and live viewer fan-out.

pub mod bus;
pub mod device_link;
pub mod frame_relay;
pub mod transport;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use device_link::{DeviceLink, DeviceLinkConfig, SendOutcome};
pub use frame_relay::{FrameRelay, RelayStats, ViewerChannel};
pub use transport::{ChannelTransport, DeviceTransport, WebSocketTransport};
