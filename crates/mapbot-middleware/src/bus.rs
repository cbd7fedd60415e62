//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! Traffic is partitioned into six [`Topic`] lanes so components only
//! receive the messages they care about:
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Telemetry`] | Raw range samples from the robot |
//! | [`Topic::Frames`] | Camera frames on their way to the frame relay |
//! | [`Topic::DeviceStatus`] | Link up/down, status reports, device errors, calibration acks |
//! | [`Topic::Observations`] | Fused world-frame observations |
//! | [`Topic::MapUpdates`] | Periodic occupancy snapshots |
//! | [`Topic::SystemAlerts`] | Mapping-session lifecycle |

use mapbot_types::{Event, EventPayload, MapError};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all first-class routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    Frames,
    DeviceStatus,
    Observations,
    MapUpdates,
    SystemAlerts,
}

impl Topic {
    /// The lane a payload travels on.
    pub fn of(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::SensorData(_) => Topic::Telemetry,
            EventPayload::Frame(_) => Topic::Frames,
            EventPayload::DeviceConnected
            | EventPayload::DeviceDisconnected
            | EventPayload::DeviceStatus(_)
            | EventPayload::DeviceError(_)
            | EventPayload::CalibrationComplete(_) => Topic::DeviceStatus,
            EventPayload::Observation(_) => Topic::Observations,
            EventPayload::MapUpdate(_) => Topic::MapUpdates,
            EventPayload::MappingStarted { .. } | EventPayload::MappingStopped { .. } => {
                Topic::SystemAlerts
            }
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    telemetry: broadcast::Sender<Event>,
    frames: broadcast::Sender<Event>,
    device_status: broadcast::Sender<Event>,
    observations: broadcast::Sender<Event>,
    map_updates: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (telemetry, _) = broadcast::channel(capacity);
        let (frames, _) = broadcast::channel(capacity);
        let (device_status, _) = broadcast::channel(capacity);
        let (observations, _) = broadcast::channel(capacity);
        let (map_updates, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            telemetry,
            frames,
            device_status,
            observations,
            map_updates,
            system_alerts,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`MapError::Channel`] when nobody is listening on the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, MapError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| MapError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Publish `event` on the lane chosen by [`Topic::of`].
    pub fn publish(&self, event: Event) -> Result<usize, MapError> {
        let topic = Topic::of(&event.payload);
        self.publish_to(topic, event)
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Telemetry => &self.telemetry,
            Topic::Frames => &self.frames,
            Topic::DeviceStatus => &self.device_status,
            Topic::Observations => &self.observations,
            Topic::MapUpdates => &self.map_updates,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapbot_types::{RawSensorSample, StatusReport};

    fn sensor_event() -> Event {
        Event::new(
            "mapbot-middleware::test",
            EventPayload::SensorData(RawSensorSample {
                ultrasonic: 42.0,
                servo_angle: 90.0,
                battery: Some(80.0),
                timestamp: 1,
            }),
        )
    }

    #[test]
    fn payloads_route_to_expected_lanes() {
        assert_eq!(Topic::of(&sensor_event().payload), Topic::Telemetry);
        assert_eq!(
            Topic::of(&EventPayload::DeviceStatus(StatusReport::default())),
            Topic::DeviceStatus
        );
        assert_eq!(Topic::of(&EventPayload::DeviceDisconnected), Topic::DeviceStatus);
        assert_eq!(
            Topic::of(&EventPayload::MappingStarted {
                session_id: "s".into()
            }),
            Topic::SystemAlerts
        );
    }

    #[test]
    fn publish_without_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::Telemetry, sensor_event());
        assert!(matches!(result, Err(MapError::Channel(_))));
    }

    #[tokio::test]
    async fn publish_routes_by_payload() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut telemetry = bus.subscribe_to(Topic::Telemetry);

        let event = sensor_event();
        assert_eq!(bus.publish(event.clone())?, 1);

        let received = telemetry.recv().await?;
        assert_eq!(received.id, event.id);
        assert_eq!(telemetry.topic(), Topic::Telemetry);
        Ok(())
    }

    /// Two independent subscribers on the same topic both receive the event.
    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::Telemetry);
        let mut subscriber2 = bus.subscribe_to(Topic::Telemetry);
        assert_eq!(bus.subscriber_count(Topic::Telemetry), 2);

        let event = sensor_event();
        bus.publish_to(Topic::Telemetry, event.clone())?;

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    /// A subscriber on `Frames` must not receive events published to
    /// `Telemetry` because they are routed through separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut frames = bus.subscribe_to(Topic::Frames);
        let _telemetry = bus.subscribe_to(Topic::Telemetry);

        bus.publish_to(Topic::Telemetry, sensor_event())?;

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), frames.recv()).await;
        assert!(result.is_err(), "Frames subscriber must not receive a Telemetry event");
        Ok(())
    }

    /// Flooding a low-capacity channel while a subscriber sleeps must produce
    /// a `Lagged` error rather than panicking or blocking.
    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        let bus = EventBus::new(64);
        let mut slow_sub = bus.subscribe_to(Topic::Telemetry);

        for _ in 0..1_000 {
            let _ = bus.publish_to(Topic::Telemetry, sensor_event());
        }

        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
