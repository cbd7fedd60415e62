//! Browser-facing wire protocol.
//!
//! Every WebSocket text frame is a JSON object.
//!
//! * Downstream (gateway → browser): `{"event": "<name>", "data": {...}}`,
//!   see [`GatewayMessage`].
//! * Upstream (browser → gateway): `{"action": "<name>", "data": {...}}`,
//!   see [`ClientAction`]. `data` may be omitted for actions that take none.

use chrono::Utc;
use mapbot_types::{
    ControlCommand, Event, EventPayload, MapError, MapSnapshot, Point2, RelayedFrame, WorldPoint,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Downstream
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotPresence {
    RobotOnline,
    RobotOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UltrasonicReading {
    pub distance: f64,
    pub angle: f64,
}

/// Grid snapshot as pushed to browsers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapPush {
    pub grid: Vec<Vec<i8>>,
    pub width: usize,
    pub height: usize,
    pub resolution: f64,
    pub origin: Point2,
    /// RFC 3339 push time.
    pub timestamp: String,
}

impl MapPush {
    pub fn new(snapshot: MapSnapshot) -> Self {
        Self {
            grid: snapshot.grid,
            width: snapshot.width,
            height: snapshot.height,
            resolution: snapshot.resolution,
            origin: snapshot.origin,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum GatewayMessage {
    /// Greeting sent once per browser connection.
    Connected {
        client_id: String,
        timestamp: i64,
        status: RobotPresence,
    },
    Sensor {
        ultrasonic: UltrasonicReading,
        position: WorldPoint,
        timestamp: i64,
    },
    Map(MapPush),
    Frame(RelayedFrame),
    Status {
        battery: Option<f64>,
        connected: bool,
        speed: f64,
    },
    RobotStatus {
        connected: bool,
    },
    MappingStarted {
        session_id: String,
    },
    MappingStopped {
        map_id: Option<Uuid>,
    },
    CalibrationStarted,
    Error {
        message: String,
    },
}

impl GatewayMessage {
    pub fn error(message: impl Into<String>) -> Self {
        GatewayMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, MapError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Browser-facing form of a bus event, or `None` for events browsers do
/// not see.
pub fn translate_event(event: &Event) -> Option<GatewayMessage> {
    let message = match &event.payload {
        EventPayload::DeviceConnected => GatewayMessage::RobotStatus { connected: true },
        EventPayload::DeviceDisconnected => GatewayMessage::RobotStatus { connected: false },
        EventPayload::DeviceStatus(report) => GatewayMessage::Status {
            battery: report.battery,
            connected: true,
            speed: report.speed.unwrap_or(0.0),
        },
        EventPayload::DeviceError(detail) => GatewayMessage::error(device_error_text(detail)),
        EventPayload::Observation(obs) => GatewayMessage::Sensor {
            ultrasonic: UltrasonicReading {
                distance: obs.distance,
                angle: obs.angle,
            },
            position: obs.robot_position,
            timestamp: Utc::now().timestamp_millis(),
        },
        EventPayload::MapUpdate(snapshot) => GatewayMessage::Map(MapPush::new(snapshot.clone())),
        EventPayload::MappingStarted { session_id } => GatewayMessage::MappingStarted {
            session_id: session_id.clone(),
        },
        EventPayload::MappingStopped { map_id, .. } => GatewayMessage::MappingStopped {
            map_id: Some(*map_id),
        },
        EventPayload::SensorData(_)
        | EventPayload::Frame(_)
        | EventPayload::CalibrationComplete(_) => return None,
    };
    Some(message)
}

fn device_error_text(detail: &Value) -> String {
    match detail {
        Value::String(s) => format!("device error: {s}"),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(msg) => format!("device error: {msg}"),
            None => format!("device error: {detail}"),
        },
        other => format!("device error: {other}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRequest {
    pub reference_distance: f64,
    pub measured_distance: f64,
}

/// Position reset; `theta` in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PositionRequest {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub theta: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    Control(ControlCommand),
    StartMapping,
    StopMapping,
    RequestStream,
    StopStream,
    Calibrate(Option<CalibrationRequest>),
    ResetPosition(PositionRequest),
    EmergencyStop,
}

#[derive(Deserialize)]
struct Envelope {
    action: String,
    #[serde(default)]
    data: Value,
}

impl ClientAction {
    /// Decode one upstream text frame.
    pub fn parse(text: &str) -> Result<Self, MapError> {
        let Envelope { action, data } = serde_json::from_str(text)?;
        let action = match action.as_str() {
            "control" => ClientAction::Control(serde_json::from_value(data)?),
            "startMapping" => ClientAction::StartMapping,
            "stopMapping" => ClientAction::StopMapping,
            "requestStream" => ClientAction::RequestStream,
            "stopStream" => ClientAction::StopStream,
            "calibrate" if is_blank(&data) => ClientAction::Calibrate(None),
            "calibrate" => ClientAction::Calibrate(Some(serde_json::from_value(data)?)),
            "resetPosition" if is_blank(&data) => ClientAction::ResetPosition(PositionRequest {
                x: 0.0,
                y: 0.0,
                theta: 0.0,
            }),
            "resetPosition" => ClientAction::ResetPosition(serde_json::from_value(data)?),
            "emergencyStop" => ClientAction::EmergencyStop,
            other => return Err(MapError::Validation(format!("unknown action '{other}'"))),
        };
        Ok(action)
    }
}

/// Absent, `null` or `{}`.
fn is_blank(data: &Value) -> bool {
    data.is_null() || data.as_object().is_some_and(|o| o.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapbot_types::{FusedObservation, StatusReport};
    use serde_json::json;

    fn to_value(msg: &GatewayMessage) -> Value {
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[test]
    fn connected_greeting_shape() {
        let msg = GatewayMessage::Connected {
            client_id: "abc".into(),
            timestamp: 5,
            status: RobotPresence::RobotOffline,
        };
        assert_eq!(
            to_value(&msg),
            json!({"event": "connected", "data": {"clientId": "abc", "timestamp": 5, "status": "robot_offline"}})
        );
    }

    #[test]
    fn calibration_started_has_no_data() {
        let v = to_value(&GatewayMessage::CalibrationStarted);
        assert_eq!(v["event"], "calibrationStarted");
    }

    #[test]
    fn map_message_carries_snapshot_fields() {
        let msg = GatewayMessage::Map(MapPush::new(MapSnapshot {
            grid: vec![vec![-1, 0], vec![1, -1]],
            width: 2,
            height: 2,
            resolution: 10.0,
            origin: Point2::new(-10.0, -10.0),
        }));
        let v = to_value(&msg);
        assert_eq!(v["event"], "map");
        assert_eq!(v["data"]["grid"], json!([[-1, 0], [1, -1]]));
        assert_eq!(v["data"]["width"], 2);
        assert_eq!(v["data"]["origin"]["x"], -10.0);
    }

    #[test]
    fn link_events_become_robot_status() {
        let up = translate_event(&Event::new("t", EventPayload::DeviceConnected)).unwrap();
        let down = translate_event(&Event::new("t", EventPayload::DeviceDisconnected)).unwrap();
        assert_eq!(up, GatewayMessage::RobotStatus { connected: true });
        assert_eq!(down, GatewayMessage::RobotStatus { connected: false });
    }

    #[test]
    fn status_report_defaults_speed_to_zero() {
        let ev = Event::new(
            "t",
            EventPayload::DeviceStatus(StatusReport {
                battery: Some(80.0),
                speed: None,
            }),
        );
        assert_eq!(
            translate_event(&ev),
            Some(GatewayMessage::Status {
                battery: Some(80.0),
                connected: true,
                speed: 0.0
            })
        );
    }

    #[test]
    fn observation_becomes_sensor_message() {
        let ev = Event::new(
            "t",
            EventPayload::Observation(FusedObservation {
                distance: 42.0,
                angle: 90.0,
                robot_position: WorldPoint::new(3, 4),
                world_obstacle_point: WorldPoint::new(45, 4),
                battery: 0.0,
                timestamp: 0,
            }),
        );
        let v = to_value(&translate_event(&ev).unwrap());
        assert_eq!(v["event"], "sensor");
        assert_eq!(v["data"]["ultrasonic"]["distance"], 42.0);
        assert_eq!(v["data"]["position"], json!({"x": 3, "y": 4}));
    }

    #[test]
    fn raw_samples_are_not_forwarded() {
        let ev = Event::new("t", EventPayload::CalibrationComplete(json!({})));
        assert!(translate_event(&ev).is_none());
    }

    #[test]
    fn device_error_message_is_extracted() {
        let ev = Event::new("t", EventPayload::DeviceError(json!({"message": "servo stuck"})));
        assert_eq!(
            translate_event(&ev),
            Some(GatewayMessage::error("device error: servo stuck"))
        );
    }

    #[test]
    fn parses_every_action() {
        assert_eq!(
            ClientAction::parse(r#"{"action":"control","data":{"steering":10,"throttle":50,"brake":false}}"#).unwrap(),
            ClientAction::Control(ControlCommand {
                steering: 10.0,
                throttle: 50.0,
                brake: false
            })
        );
        assert_eq!(ClientAction::parse(r#"{"action":"startMapping"}"#).unwrap(), ClientAction::StartMapping);
        assert_eq!(ClientAction::parse(r#"{"action":"stopMapping"}"#).unwrap(), ClientAction::StopMapping);
        assert_eq!(ClientAction::parse(r#"{"action":"requestStream"}"#).unwrap(), ClientAction::RequestStream);
        assert_eq!(ClientAction::parse(r#"{"action":"stopStream"}"#).unwrap(), ClientAction::StopStream);
        assert_eq!(ClientAction::parse(r#"{"action":"calibrate"}"#).unwrap(), ClientAction::Calibrate(None));
        assert_eq!(ClientAction::parse(r#"{"action":"calibrate","data":{}}"#).unwrap(), ClientAction::Calibrate(None));
        assert_eq!(
            ClientAction::parse(r#"{"action":"calibrate","data":{"referenceDistance":100,"measuredDistance":105}}"#).unwrap(),
            ClientAction::Calibrate(Some(CalibrationRequest {
                reference_distance: 100.0,
                measured_distance: 105.0
            }))
        );
        assert_eq!(
            ClientAction::parse(r#"{"action":"resetPosition","data":{"x":1,"theta":90}}"#).unwrap(),
            ClientAction::ResetPosition(PositionRequest {
                x: 1.0,
                y: 0.0,
                theta: 90.0
            })
        );
        assert_eq!(ClientAction::parse(r#"{"action":"emergencyStop"}"#).unwrap(), ClientAction::EmergencyStop);
    }

    #[test]
    fn rejects_unknown_and_malformed_actions() {
        assert!(matches!(
            ClientAction::parse(r#"{"action":"selfDestruct"}"#),
            Err(MapError::Validation(_))
        ));
        assert!(matches!(
            ClientAction::parse("not json at all"),
            Err(MapError::Serialization(_))
        ));
        assert!(matches!(
            ClientAction::parse(r#"{"action":"control","data":{"steering":"left"}}"#),
            Err(MapError::Serialization(_))
        ));
    }
}
