use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Spatial primitives
// ────────────────────────────────────────────────────────────────────────────

/// A point in the world frame, in real-valued world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A world-frame point rounded to whole world units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WorldPoint {
    pub x: i64,
    pub y: i64,
}

impl WorldPoint {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Robot pose in the fixed world frame.
///
/// `theta` is kept in `(-π, π]` by the fusion unit that owns the pose.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device wire protocol
// ────────────────────────────────────────────────────────────────────────────

/// Inbound envelope as sent by the robot firmware: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEnvelope {
    #[serde(rename = "type", alias = "kind")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound command envelope: `{"cmd": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub cmd: String,
    pub data: Value,
}

impl DeviceCommand {
    pub fn new(cmd: impl Into<String>, data: Value) -> Self {
        Self {
            cmd: cmd.into(),
            data,
        }
    }
}

/// Raw ultrasonic sample reported under the `sensor` kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSensorSample {
    /// Raw range reading in world units.
    pub ultrasonic: f64,
    /// Servo position in degrees; 90 is straight ahead.
    pub servo_angle: f64,
    #[serde(default)]
    pub battery: Option<f64>,
    /// Device-side capture time (opaque to the host).
    #[serde(default)]
    pub timestamp: u64,
}

/// Camera frame reported under the `frame` kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFrame {
    /// Base64-encoded JPEG payload, passed through untouched.
    pub data: String,
    pub frame_id: u64,
}

/// A frame as delivered to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedFrame {
    pub data: String,
    pub frame_id: u64,
    /// Relay time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Robot status report (`status` kind).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

// ────────────────────────────────────────────────────────────────────────────
// Control
// ────────────────────────────────────────────────────────────────────────────

/// Operator steering input coming from a browser.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    /// Degrees, `[-90, 90]`; positive turns right.
    pub steering: f64,
    /// Percent, `[0, 100]`.
    pub throttle: f64,
    pub brake: bool,
}

/// Differential-drive command sent to the robot as the `move` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCommand {
    pub motor_left: u8,
    pub motor_right: u8,
    pub servo_angle: u8,
}

// ────────────────────────────────────────────────────────────────────────────
// Fusion output
// ────────────────────────────────────────────────────────────────────────────

/// A filtered, calibrated range reading expressed in the world frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedObservation {
    /// Median-filtered, calibrated distance.
    pub distance: f64,
    /// Servo angle in degrees, as reported.
    pub angle: f64,
    pub robot_position: WorldPoint,
    pub world_obstacle_point: WorldPoint,
    pub battery: f64,
    pub timestamp: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Mapping
// ────────────────────────────────────────────────────────────────────────────

/// Ternary classification of one occupancy-grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellState {
    Unknown,
    Free,
    Occupied,
}

impl CellState {
    /// Wire value: `-1` unknown, `0` free, `1` occupied.
    pub fn as_i8(self) -> i8 {
        match self {
            CellState::Unknown => -1,
            CellState::Free => 0,
            CellState::Occupied => 1,
        }
    }

    pub fn from_i8(value: i8) -> Self {
        match value {
            1 => CellState::Occupied,
            0 => CellState::Free,
            _ => CellState::Unknown,
        }
    }
}

/// Ternary view of the whole grid, indexed `grid[gx][gy]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub grid: Vec<Vec<i8>>,
    pub width: usize,
    pub height: usize,
    /// Cell edge length in world units.
    pub resolution: f64,
    /// World coordinate of cell `(0, 0)`.
    pub origin: Point2,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapMetadata {
    /// Session length in milliseconds.
    pub duration: i64,
    pub update_count: u64,
    /// Percentage of touched cells, `[0, 100]`.
    pub coverage: f64,
}

/// A finished mapping session as persisted by a map store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapRecord {
    pub id: Uuid,
    pub session_id: String,
    pub name: String,
    pub grid: Vec<Vec<i8>>,
    pub width: usize,
    pub height: usize,
    pub resolution: f64,
    pub origin: Point2,
    pub metadata: MapMetadata,
    pub created_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Device link status
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the device link for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub connected: bool,
    pub queue_size: usize,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

// ────────────────────────────────────────────────────────────────────────────
// Event bus
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"mapbot-middleware::device_link"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Every payload that travels over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    DeviceConnected,
    DeviceDisconnected,
    SensorData(RawSensorSample),
    Frame(VideoFrame),
    DeviceStatus(StatusReport),
    DeviceError(Value),
    CalibrationComplete(Value),
    Observation(FusedObservation),
    MapUpdate(MapSnapshot),
    MappingStarted { session_id: String },
    MappingStopped { session_id: String, map_id: Uuid },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every crate in the workspace.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapError {
    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Validation Error: {0}")]
    Validation(String),

    /// The robot link is down; the command was not transmitted.
    #[error("Device Unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Persistence Error: {0}")]
    Persistence(String),

    #[error("Export Error: {0}")]
    Export(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Channel Error: {0}")]
    Channel(String),
}

impl From<serde_json::Error> for MapError {
    fn from(e: serde_json::Error) -> Self {
        MapError::Serialization(e.to_string())
    }
}
