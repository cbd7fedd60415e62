//! [`AppContext`] – the bridge's service graph and event pipeline.
//!
//! Every service is constructed once here and handed out as a shared handle;
//! there are no process-wide singletons. [`AppContext::spawn`] starts the
//! three pipeline tasks:
//!
//! ```text
//! Telemetry ──▶ SensorFusion ──▶ OccupancyMapper ──▶ Observations
//! Frames    ──▶ FrameRelay ──▶ viewers
//! ticker    ──▶ current map snapshot ──▶ MapUpdates   (only while mapping)
//! ```
//!
//! Operator actions (drive, calibrate, mapping start/stop, position reset)
//! are also methods on the context so that every front end applies the same
//! validation before anything reaches the robot.

use std::sync::Arc;
use std::time::Duration;

use mapbot_hal::to_motor_command;
use mapbot_kernel::validator::{InputValidator, OperatorRequest};
use mapbot_memory::MapStore;
use mapbot_middleware::transport::DeviceTransport;
use mapbot_middleware::{
    DeviceLink, DeviceLinkConfig, EventBus, FrameRelay, RelayStats, SendOutcome, Topic,
    TopicReceiver,
};
use mapbot_perception::fusion::SensorFusion;
use mapbot_perception::geometry::{deg_to_rad, rad_to_deg};
use mapbot_types::{
    ControlCommand, Event, EventPayload, FusedObservation, LinkStatus, MapError, MapRecord,
    MapSnapshot, RawSensorSample, VideoFrame,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mapper::{MapperConfig, OccupancyMapper};

const SOURCE: &str = "mapbot-runtime::pipeline";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Period of the map snapshot push while a session is active.
    pub map_push_interval: Duration,
    /// Frame relay history depth.
    pub camera_buffer_size: usize,
    pub mapper: MapperConfig,
    pub link: DeviceLinkConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            map_push_interval: Duration::from_millis(200),
            camera_buffer_size: mapbot_middleware::frame_relay::DEFAULT_BUFFER_SIZE,
            mapper: MapperConfig::default(),
            link: DeviceLinkConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Pose as shown to operators, heading in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoseReport {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub robot: LinkStatus,
    pub position: PoseReport,
    pub stream: RelayStats,
    pub mapping_session: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// AppContext
// ─────────────────────────────────────────────────────────────────────────────

/// Shared handles on every bridge service. Clones are cheap and share state.
#[derive(Clone)]
pub struct AppContext {
    pub bus: Arc<EventBus>,
    pub link: DeviceLink,
    pub fusion: Arc<Mutex<SensorFusion>>,
    pub mapper: Arc<Mutex<OccupancyMapper>>,
    pub relay: Arc<Mutex<FrameRelay>>,
    pub validator: Arc<InputValidator>,
    config: PipelineConfig,
}

impl AppContext {
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn DeviceTransport>,
        store: Arc<dyn MapStore>,
    ) -> Self {
        let bus = Arc::new(EventBus::default());
        let link = DeviceLink::new(config.link, transport, Arc::clone(&bus));
        Self {
            link,
            fusion: Arc::new(Mutex::new(SensorFusion::new())),
            mapper: Arc::new(Mutex::new(OccupancyMapper::new(config.mapper, store))),
            relay: Arc::new(Mutex::new(FrameRelay::new(config.camera_buffer_size))),
            validator: Arc::new(InputValidator::standard()),
            bus,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self, topic: Topic) -> TopicReceiver {
        self.bus.subscribe_to(topic)
    }

    /// Start the pipeline tasks. Subscriptions are taken before this returns,
    /// so nothing published afterwards is missed.
    pub fn spawn(&self) -> PipelineHandle {
        let telemetry = self.bus.subscribe_to(Topic::Telemetry);
        let frames = self.bus.subscribe_to(Topic::Frames);

        let tasks = vec![
            tokio::spawn(telemetry_loop(self.clone(), telemetry)),
            tokio::spawn(frame_loop(self.clone(), frames)),
            tokio::spawn(map_push_loop(self.clone())),
        ];
        info!(
            map_push_ms = self.config.map_push_interval.as_millis() as u64,
            "pipeline started"
        );
        PipelineHandle { tasks }
    }

    // -----------------------------------------------------------------------
    // Pipeline steps
    // -----------------------------------------------------------------------

    /// Fuse one raw sample, fold it into the map and publish the observation.
    pub async fn handle_sample(&self, sample: &RawSensorSample) -> FusedObservation {
        let observation = self.fusion.lock().await.process_sample(sample);
        self.mapper.lock().await.update_map(&observation);
        self.emit(EventPayload::Observation(observation));
        observation
    }

    pub async fn handle_frame(&self, frame: VideoFrame) {
        self.relay.lock().await.broadcast_frame(frame);
    }

    /// Publish the current snapshot, if a session is active.
    pub async fn push_map_snapshot(&self) -> Option<MapSnapshot> {
        let snapshot = self.mapper.lock().await.current_map_data()?;
        self.emit(EventPayload::MapUpdate(snapshot.clone()));
        Some(snapshot)
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Validate, translate and send a steering command as `move`.
    pub async fn drive(&self, command: ControlCommand) -> Result<SendOutcome, MapError> {
        self.validator.verify(&OperatorRequest::Control(command))?;
        let motor = to_motor_command(&command);
        debug!(?command, ?motor, "drive command translated");
        self.link
            .send_command("move", serde_json::to_value(motor)?)
            .await
    }

    pub async fn emergency_stop(&self) -> Result<SendOutcome, MapError> {
        warn!("emergency stop requested");
        self.link.send_command("emergency_stop", json!({})).await
    }

    /// Ask the robot to calibrate. With distances, the local range offset is
    /// updated first.
    pub async fn calibrate(
        &self,
        distances: Option<(f64, f64)>,
    ) -> Result<SendOutcome, MapError> {
        let payload = match distances {
            Some((reference_distance, measured_distance)) => {
                self.validator.verify(&OperatorRequest::Calibrate {
                    reference_distance,
                    measured_distance,
                })?;
                self.fusion
                    .lock()
                    .await
                    .calibrate(reference_distance, measured_distance);
                json!({
                    "referenceDistance": reference_distance,
                    "measuredDistance": measured_distance,
                })
            }
            None => json!({}),
        };
        self.link.send_command("calibrate", payload).await
    }

    /// Overwrite the pose. `theta_deg` is in degrees.
    pub async fn reset_position(&self, x: f64, y: f64, theta_deg: f64) -> Result<(), MapError> {
        self.validator
            .verify(&OperatorRequest::SetPosition { x, y, theta_deg })?;
        self.fusion
            .lock()
            .await
            .set_position(x, y, deg_to_rad(theta_deg));
        info!(x, y, theta_deg, "pose reset");
        Ok(())
    }

    pub async fn start_mapping(&self, initiator: &str) -> String {
        let session_id = self.mapper.lock().await.start_new_session(initiator);
        self.emit(EventPayload::MappingStarted {
            session_id: session_id.clone(),
        });
        session_id
    }

    /// End the active session. `Ok(None)` when nothing was being mapped.
    ///
    /// The grid is snapshotted under the mapper lock; the store write runs
    /// after the lock is released.
    pub async fn stop_mapping(&self) -> Result<Option<MapRecord>, MapError> {
        let (record, store) = {
            let mapper = self.mapper.lock().await;
            (mapper.session_record(), mapper.store())
        };
        let Some(record) = record else {
            return Ok(None);
        };

        store.save(&record).await?;
        if !self.mapper.lock().await.finish_session(&record) {
            debug!(session_id = %record.session_id, "session replaced while its map was saved");
        }
        self.emit(EventPayload::MappingStopped {
            session_id: record.session_id.clone(),
            map_id: record.id,
        });
        Ok(Some(record))
    }

    pub async fn status(&self) -> SystemStatus {
        let robot = self.link.status().await;
        let pose = self.fusion.lock().await.position();
        let stream = self.relay.lock().await.stats();
        let mapping_session = self
            .mapper
            .lock()
            .await
            .session()
            .map(|s| s.id.clone());
        SystemStatus {
            robot,
            position: PoseReport {
                x: pose.x,
                y: pose.y,
                theta: rad_to_deg(pose.theta),
            },
            stream,
            mapping_session,
        }
    }

    fn emit(&self, payload: EventPayload) {
        // No subscribers is a normal condition.
        let _ = self.bus.publish(Event::new(SOURCE, payload));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the pipeline tasks; dropping it stops them.
pub struct PipelineHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn telemetry_loop(ctx: AppContext, mut rx: TopicReceiver) {
    loop {
        match rx.recv().await {
            Ok(Event {
                payload: EventPayload::SensorData(sample),
                ..
            }) => {
                ctx.handle_sample(&sample).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "telemetry pipeline lagging, samples dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn frame_loop(ctx: AppContext, mut rx: TopicReceiver) {
    loop {
        match rx.recv().await {
            Ok(Event {
                payload: EventPayload::Frame(frame),
                ..
            }) => ctx.handle_frame(frame).await,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "frame pipeline lagging, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn map_push_loop(ctx: AppContext) {
    let mut ticker = tokio::time::interval(ctx.config.map_push_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        ctx.push_map_snapshot().await;
    }
}
