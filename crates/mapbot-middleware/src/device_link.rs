//! Device link manager.
//!
//! Owns the single connection to the robot and keeps it alive across drops:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                          |                    |
//!      +------ timeout/error -----+---- close/error ---+  (reconnect scheduled)
//! ```
//!
//! - Commands sent while the link is down are queued and drained in FIFO
//!   order as soon as it comes back.
//! - A heartbeat task pings the robot every interval and tears the link down
//!   when nothing has been heard for three intervals.
//! - Inbound envelopes are classified by kind and published on the
//!   [`EventBus`]. Malformed input is logged and dropped.
//! - Socket writes never run under the state lock and give up after one
//!   heartbeat interval, so a robot that stops reading cannot wedge the
//!   watchdog, `status()` or `disconnect()`.
//!
//! The link is a cheap-to-clone handle; every clone drives the same
//! connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use mapbot_types::{
    ConnectionState, DeviceCommand, DeviceEnvelope, Event, EventPayload, LinkStatus, MapError,
};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::transport::{DeviceConnection, DeviceTransport, FrameSink, FrameStream};

const SOURCE: &str = "mapbot-middleware::device_link";

/// Timings for the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLinkConfig {
    /// Delay before retrying after a failed or dropped connection.
    pub reconnect_interval: Duration,
    /// Heartbeat period; the link is declared dead after three silent periods.
    /// Also bounds every single socket write.
    pub heartbeat_interval: Duration,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
}

impl Default for DeviceLinkConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(3000),
            connect_timeout: Duration::from_millis(5000),
        }
    }
}

/// Result of [`DeviceLink::send_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the socket.
    Sent,
    /// The link is down, or still flushing older commands; this one waits in
    /// the queue behind them.
    Queued,
}

/// Which background task is tearing the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskRole {
    Reader,
    Heartbeat,
}

struct LinkState {
    status: ConnectionState,
    queue: VecDeque<DeviceCommand>,
    /// Set while the queue is being flushed onto a fresh connection; new
    /// commands join the queue instead of overtaking it.
    draining: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    /// Bumped on every open and on `disconnect()`. Background tasks and
    /// connection attempts from an older epoch exit without touching the
    /// state.
    epoch: u64,
    shutdown: bool,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            status: ConnectionState::Disconnected,
            queue: VecDeque::new(),
            draining: false,
            last_heartbeat: None,
            epoch: 0,
            shutdown: false,
            reader: None,
            heartbeat: None,
            reconnect: None,
        }
    }
}

/// Outbound half of the open connection, tagged with its epoch.
struct Writer {
    epoch: u64,
    sink: FrameSink,
}

struct LinkInner {
    config: DeviceLinkConfig,
    transport: Arc<dyn DeviceTransport>,
    bus: Arc<EventBus>,
    state: Mutex<LinkState>,
    /// Only ever locked without `state` held.
    writer: Mutex<Option<Writer>>,
}

#[derive(Clone)]
pub struct DeviceLink {
    inner: Arc<LinkInner>,
}

impl DeviceLink {
    pub fn new(
        config: DeviceLinkConfig,
        transport: Arc<dyn DeviceTransport>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                config,
                transport,
                bus,
                state: Mutex::new(LinkState::new()),
                writer: Mutex::new(None),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Make one connection attempt.
    ///
    /// Never fails: on error or timeout a reconnect is scheduled and the call
    /// returns. Does nothing if the link is already connecting or connected.
    pub async fn connect(&self) {
        self.attempt(false).await;
    }

    async fn attempt(&self, from_reconnect: bool) {
        let started = {
            let mut st = self.inner.state.lock().await;
            if from_reconnect {
                // Detach our own handle so a failure can schedule the next try.
                st.reconnect.take();
                if st.shutdown {
                    return;
                }
            } else {
                st.shutdown = false;
                if let Some(pending) = st.reconnect.take() {
                    pending.abort();
                }
            }
            if st.status != ConnectionState::Disconnected {
                return;
            }
            st.status = ConnectionState::Connecting;
            st.epoch
        };

        let target = self.inner.transport.describe();
        info!(device = %target, "connecting to device");

        let timeout = self.inner.config.connect_timeout;
        match tokio::time::timeout(timeout, self.inner.transport.connect()).await {
            Ok(Ok(conn)) => self.on_open(conn, started).await,
            Ok(Err(e)) => {
                error!(device = %target, error = %e, "device connection failed");
                self.on_attempt_failed(started).await;
            }
            Err(_) => {
                warn!(device = %target, timeout_ms = timeout.as_millis() as u64, "device connection timed out");
                self.on_attempt_failed(started).await;
            }
        }
    }

    async fn on_open(&self, conn: DeviceConnection, started: u64) {
        let DeviceConnection { sink, stream } = conn;
        let grace = self.inner.config.heartbeat_interval;

        let (epoch, pending, leftovers) = {
            let mut st = self.inner.state.lock().await;
            if st.shutdown || st.epoch != started || st.status != ConnectionState::Connecting {
                drop(st);
                debug!(device = %self.inner.transport.describe(), "superseded connection discarded");
                close_quietly(sink, grace);
                return;
            }
            let leftovers = [st.reader.take(), st.heartbeat.take()];
            st.epoch += 1;
            st.status = ConnectionState::Connected;
            st.draining = true;
            st.last_heartbeat = Some(Utc::now());
            info!(device = %self.inner.transport.describe(), "device connected");
            self.emit(EventPayload::DeviceConnected);
            (st.epoch, st.queue.len(), leftovers)
        };
        for handle in leftovers.into_iter().flatten() {
            handle.abort();
        }

        let previous = self
            .inner
            .writer
            .lock()
            .await
            .replace(Writer { epoch, sink });
        if let Some(previous) = previous {
            close_quietly(previous.sink, grace);
        }

        {
            let mut st = self.inner.state.lock().await;
            if st.epoch != epoch {
                // disconnect() ran while the writer was being installed.
                drop(st);
                self.retire_writer(epoch).await;
                return;
            }
            st.reader = Some(tokio::spawn(read_loop(self.clone(), stream, epoch)));
            st.heartbeat = Some(tokio::spawn(heartbeat_loop(self.clone(), epoch)));
        }

        if pending > 0 {
            info!(pending, "draining queued commands");
        }
        self.drain_queue(epoch).await;
    }

    /// Flush the queue in FIFO order onto the connection opened at `epoch`.
    async fn drain_queue(&self, epoch: u64) {
        loop {
            let cmd = {
                let mut st = self.inner.state.lock().await;
                if st.epoch != epoch {
                    return;
                }
                match st.queue.pop_front() {
                    Some(cmd) => cmd,
                    None => {
                        st.draining = false;
                        return;
                    }
                }
            };

            if let Err(e) = self.write(epoch, &cmd).await {
                warn!(cmd = %cmd.cmd, error = %e, "queue drain interrupted");
                let mut st = self.inner.state.lock().await;
                st.queue.push_front(cmd);
                if st.epoch == epoch {
                    st.draining = false;
                }
                return;
            }
            debug!(cmd = %cmd.cmd, "queued command sent");
        }
    }

    async fn on_attempt_failed(&self, started: u64) {
        let mut st = self.inner.state.lock().await;
        if st.epoch != started {
            // disconnect() superseded this attempt; a newer one may own the state.
            return;
        }
        if st.status == ConnectionState::Connecting {
            st.status = ConnectionState::Disconnected;
        }
        if !st.shutdown {
            self.schedule_reconnect(&mut st);
        }
    }

    fn schedule_reconnect(&self, st: &mut LinkState) {
        if st.reconnect.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let delay = self.inner.config.reconnect_interval;
        let link = self.clone();
        debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        st.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            link.attempt(true).await;
        }));
    }

    /// Tear down the current connection on behalf of a background task.
    async fn drop_connection(&self, epoch: u64, role: TaskRole) {
        let mut st = self.inner.state.lock().await;
        if st.epoch != epoch || st.status != ConnectionState::Connected {
            return;
        }
        st.status = ConnectionState::Disconnected;
        st.draining = false;

        // The calling task exits on its own once this returns.
        let reader = st.reader.take();
        let heartbeat = st.heartbeat.take();
        if role != TaskRole::Reader
            && let Some(h) = reader
        {
            h.abort();
        }
        if role != TaskRole::Heartbeat
            && let Some(h) = heartbeat
        {
            h.abort();
        }

        warn!(device = %self.inner.transport.describe(), "device disconnected");
        self.emit(EventPayload::DeviceDisconnected);

        if !st.shutdown {
            self.schedule_reconnect(&mut st);
        }
        drop(st);

        // The writer may still be held by a send that has not timed out yet.
        let link = self.clone();
        tokio::spawn(async move { link.retire_writer(epoch).await });
    }

    /// Close and remove the writer if it belongs to `upto` or an older epoch.
    async fn retire_writer(&self, upto: u64) {
        let retired = self
            .inner
            .writer
            .lock()
            .await
            .take_if(|w| w.epoch <= upto);
        if let Some(mut w) = retired {
            let _ = tokio::time::timeout(self.inner.config.heartbeat_interval, w.sink.close()).await;
        }
    }

    /// Stop every timer, close the socket and stay down. Idempotent.
    ///
    /// Returns within about one heartbeat interval even if the socket is
    /// stuck.
    pub async fn disconnect(&self) {
        let (was_connected, upto) = {
            let mut st = self.inner.state.lock().await;
            st.shutdown = true;
            st.epoch += 1;
            st.draining = false;
            for handle in [st.reconnect.take(), st.heartbeat.take(), st.reader.take()]
                .into_iter()
                .flatten()
            {
                handle.abort();
            }
            let was_connected = st.status == ConnectionState::Connected;
            st.status = ConnectionState::Disconnected;
            (was_connected, st.epoch)
        };

        if was_connected {
            info!("device link closed");
            self.emit(EventPayload::DeviceDisconnected);
        }

        let grace = self.inner.config.heartbeat_interval;
        if tokio::time::timeout(grace, self.retire_writer(upto)).await.is_err() {
            debug!("socket close still pending, finishing in background");
            let link = self.clone();
            tokio::spawn(async move { link.retire_writer(upto).await });
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Send `name` with `payload` now, or queue it while the link is down.
    ///
    /// A transmit failure or timeout re-queues the command and returns the
    /// error to this caller only.
    pub async fn send_command(
        &self,
        name: impl Into<String>,
        payload: Value,
    ) -> Result<SendOutcome, MapError> {
        let cmd = DeviceCommand::new(name, payload);
        let epoch = {
            let mut st = self.inner.state.lock().await;
            if st.status != ConnectionState::Connected || st.draining {
                debug!(cmd = %cmd.cmd, queue_size = st.queue.len() + 1, "device not ready, command queued");
                st.queue.push_back(cmd);
                return Ok(SendOutcome::Queued);
            }
            st.epoch
        };

        match self.write(epoch, &cmd).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) => {
                error!(cmd = %cmd.cmd, error = %e, "command transmit failed, re-queued");
                self.inner.state.lock().await.queue.push_back(cmd);
                Err(e)
            }
        }
    }

    /// Write `cmd` on the connection opened at `epoch`, giving up after one
    /// heartbeat interval.
    async fn write(&self, epoch: u64, cmd: &DeviceCommand) -> Result<(), MapError> {
        let limit = self.inner.config.heartbeat_interval;
        let attempt = async {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(w) if w.epoch == epoch => transmit(&mut w.sink, cmd).await,
                _ => Err(MapError::Transport("connection closed".into())),
            }
        };
        tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
            Err(MapError::Transport(format!(
                "send timed out after {} ms",
                limit.as_millis()
            )))
        })
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn handle_inbound(&self, text: &str) {
        let envelope = match parse_envelope(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping malformed device message");
                return;
            }
        };

        self.inner.state.lock().await.last_heartbeat = Some(Utc::now());

        match classify(envelope) {
            Ok(Some(payload)) => self.emit(payload),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dropping device message with bad payload"),
        }
    }

    fn emit(&self, payload: EventPayload) {
        // No subscribers is a normal condition.
        let _ = self.inner.bus.publish(Event::new(SOURCE, payload));
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> LinkStatus {
        let st = self.inner.state.lock().await;
        LinkStatus {
            connected: st.status == ConnectionState::Connected,
            queue_size: st.queue.len(),
            last_heartbeat: st.last_heartbeat,
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().await.status
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Background tasks
// ────────────────────────────────────────────────────────────────────────────

async fn read_loop(link: DeviceLink, mut stream: FrameStream, epoch: u64) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(text) => link.handle_inbound(&text).await,
            Err(e) => {
                error!(error = %e, "device socket error");
                break;
            }
        }
    }
    link.drop_connection(epoch, TaskRole::Reader).await;
}

async fn heartbeat_loop(link: DeviceLink, epoch: u64) {
    let period = link.inner.config.heartbeat_interval;
    let limit = chrono::TimeDelta::from_std(period * 3).unwrap_or(chrono::TimeDelta::MAX);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let stale = {
            let st = link.inner.state.lock().await;
            if st.epoch != epoch || st.status != ConnectionState::Connected {
                return;
            }
            st.last_heartbeat
                .map(|t| Utc::now() - t)
                .is_some_and(|d| d > limit)
        };

        if stale {
            warn!(timeout_ms = (period * 3).as_millis() as u64, "device heartbeat timed out");
            link.drop_connection(epoch, TaskRole::Heartbeat).await;
            return;
        }

        let ping = DeviceCommand::new("heartbeat", json!({}));
        if let Err(e) = link.write(epoch, &ping).await {
            debug!(error = %e, "heartbeat send failed");
        }
    }
}

async fn transmit(sink: &mut FrameSink, cmd: &DeviceCommand) -> Result<(), MapError> {
    let text = serde_json::to_string(cmd)?;
    sink.send(text).await
}

fn close_quietly(mut sink: FrameSink, grace: Duration) {
    tokio::spawn(async move {
        let _ = tokio::time::timeout(grace, sink.close()).await;
    });
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound classification
// ────────────────────────────────────────────────────────────────────────────

/// Parse one inbound text into a `{type, data}` envelope.
pub fn parse_envelope(text: &str) -> Result<DeviceEnvelope, MapError> {
    Ok(serde_json::from_str(text)?)
}

/// Map an envelope onto the bus payload it should produce.
///
/// `Ok(None)` means "consumed, nothing to publish" (acks, heartbeats and
/// unknown kinds).
pub fn classify(envelope: DeviceEnvelope) -> Result<Option<EventPayload>, MapError> {
    let DeviceEnvelope { kind, data } = envelope;
    let payload = match kind.as_str() {
        "sensor" => EventPayload::SensorData(serde_json::from_value(data)?),
        "frame" => EventPayload::Frame(serde_json::from_value(data)?),
        "status" => EventPayload::DeviceStatus(serde_json::from_value(data)?),
        "error" => EventPayload::DeviceError(data),
        "calibration" => EventPayload::CalibrationComplete(data),
        "ack" | "heartbeat" => {
            debug!(kind = %kind, "device acknowledged");
            return Ok(None);
        }
        other => {
            warn!(kind = %other, "unknown device message kind");
            return Ok(None);
        }
    };
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::transport::{ChannelTransport, ConnectMode, DevicePeer};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_config() -> DeviceLinkConfig {
        DeviceLinkConfig {
            reconnect_interval: Duration::from_millis(30),
            heartbeat_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(50),
        }
    }

    fn slow_heartbeat() -> DeviceLinkConfig {
        DeviceLinkConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..fast_config()
        }
    }

    fn link_with(
        config: DeviceLinkConfig,
    ) -> (DeviceLink, Arc<ChannelTransport>, UnboundedReceiver<DevicePeer>, Arc<EventBus>) {
        let (transport, accepted) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let bus = Arc::new(EventBus::default());
        let link = DeviceLink::new(config, transport.clone(), bus.clone());
        (link, transport, accepted, bus)
    }

    async fn next_peer(accepted: &mut UnboundedReceiver<DevicePeer>) -> DevicePeer {
        timeout(WAIT, accepted.recv())
            .await
            .expect("no connection within deadline")
            .expect("transport dropped")
    }

    // ------------------------------------------------------------------ classification

    #[test]
    fn classify_routes_known_kinds() {
        let env = parse_envelope(r#"{"type":"sensor","data":{"ultrasonic":12.5,"servo_angle":90,"timestamp":3}}"#)
            .unwrap();
        assert!(matches!(classify(env), Ok(Some(EventPayload::SensorData(s))) if s.ultrasonic == 12.5));

        let env = parse_envelope(r#"{"type":"frame","data":{"data":"AAAA","frame_id":9}}"#).unwrap();
        assert!(matches!(classify(env), Ok(Some(EventPayload::Frame(f))) if f.frame_id == 9));

        let env = parse_envelope(r#"{"type":"status","data":{"battery":77}}"#).unwrap();
        assert!(matches!(classify(env), Ok(Some(EventPayload::DeviceStatus(_)))));

        let env = parse_envelope(r#"{"type":"error","data":{"code":4}}"#).unwrap();
        assert!(matches!(classify(env), Ok(Some(EventPayload::DeviceError(_)))));

        let env = parse_envelope(r#"{"type":"calibration","data":{"ok":true}}"#).unwrap();
        assert!(matches!(classify(env), Ok(Some(EventPayload::CalibrationComplete(_)))));
    }

    #[test]
    fn classify_consumes_acks_and_unknown_kinds() {
        for kind in ["ack", "heartbeat", "telepathy"] {
            let env = parse_envelope(&format!(r#"{{"type":"{kind}"}}"#)).unwrap();
            assert!(matches!(classify(env), Ok(None)));
        }
    }

    #[test]
    fn malformed_input_is_an_error_not_a_panic() {
        assert!(parse_envelope("not json").is_err());
        let env = parse_envelope(r#"{"type":"sensor","data":{"ultrasonic":"far"}}"#).unwrap();
        assert!(classify(env).is_err());
    }

    // ------------------------------------------------------------------ queueing

    #[tokio::test]
    async fn queued_commands_drain_fifo_on_connect() {
        let (link, _transport, mut accepted, _bus) = link_with(slow_heartbeat());

        for name in ["a", "b", "c"] {
            let outcome = link.send_command(name, json!({})).await.unwrap();
            assert_eq!(outcome, SendOutcome::Queued);
        }
        assert_eq!(link.status().await.queue_size, 3);

        link.connect().await;
        let mut peer = next_peer(&mut accepted).await;

        for expected in ["a", "b", "c"] {
            let cmd = timeout(WAIT, peer.next_command()).await.unwrap().unwrap();
            assert_eq!(cmd.cmd, expected);
        }
        let status = link.status().await;
        assert!(status.connected);
        assert_eq!(status.queue_size, 0);
        assert!(status.last_heartbeat.is_some());

        link.disconnect().await;
    }

    #[tokio::test]
    async fn connected_send_is_immediate() {
        let (link, _transport, mut accepted, _bus) = link_with(slow_heartbeat());
        link.connect().await;
        let mut peer = next_peer(&mut accepted).await;

        let outcome = link
            .send_command("move", json!({"motor_left": 10, "motor_right": 10, "servo_angle": 90}))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);

        let cmd = timeout(WAIT, peer.next_command()).await.unwrap().unwrap();
        assert_eq!(cmd.cmd, "move");
        assert_eq!(cmd.data["servo_angle"], 90);

        link.disconnect().await;
    }

    #[tokio::test]
    async fn failed_transmit_requeues_and_reports() {
        let (link, _transport, mut accepted, _bus) = link_with(slow_heartbeat());
        link.connect().await;
        let peer = next_peer(&mut accepted).await;

        // Robot stops reading but the inbound stream stays open.
        let DevicePeer { received, outbound } = peer;
        drop(received);

        let result = link.send_command("move", json!({})).await;
        assert!(matches!(result, Err(MapError::Transport(_))));
        assert_eq!(link.status().await.queue_size, 1);

        drop(outbound);
        link.disconnect().await;
    }

    // ------------------------------------------------------------------ reconnect

    #[tokio::test]
    async fn refused_connect_retries_until_accepted() {
        let (link, transport, mut accepted, _bus) = link_with(slow_heartbeat());
        transport.set_mode(ConnectMode::Refuse);

        link.connect().await;
        assert_eq!(link.connection_state().await, ConnectionState::Disconnected);

        transport.set_mode(ConnectMode::Accept);
        let _peer = next_peer(&mut accepted).await;
        assert!(transport.attempts() >= 2);

        // Allow on_open to finish after the peer was handed out.
        timeout(WAIT, async {
            while !link.status().await.connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        link.disconnect().await;
    }

    #[tokio::test]
    async fn stalled_connect_times_out_and_retries() {
        let (link, transport, _accepted, _bus) = link_with(slow_heartbeat());
        transport.set_mode(ConnectMode::Stall);

        timeout(WAIT, link.connect()).await.expect("connect must give up on its own");
        assert_eq!(link.connection_state().await, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(transport.attempts() >= 2);

        link.disconnect().await;
    }

    #[tokio::test]
    async fn peer_hangup_publishes_disconnect_and_reconnects() {
        let (link, _transport, mut accepted, bus) = link_with(slow_heartbeat());
        let mut status_rx = bus.subscribe_to(Topic::DeviceStatus);

        link.connect().await;
        let first = next_peer(&mut accepted).await;
        let ev = timeout(WAIT, status_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(ev.payload, EventPayload::DeviceConnected));

        drop(first);
        let ev = timeout(WAIT, status_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(ev.payload, EventPayload::DeviceDisconnected));

        let _second = next_peer(&mut accepted).await;
        link.disconnect().await;
    }

    // ------------------------------------------------------------------ heartbeat

    #[tokio::test]
    async fn heartbeat_is_sent_periodically() {
        let (link, _transport, mut accepted, _bus) = link_with(fast_config());
        link.connect().await;
        let mut peer = next_peer(&mut accepted).await;

        let cmd = timeout(WAIT, peer.next_command()).await.unwrap().unwrap();
        assert_eq!(cmd.cmd, "heartbeat");

        link.disconnect().await;
    }

    #[tokio::test]
    async fn silent_device_is_dropped_after_three_intervals() {
        let (link, _transport, mut accepted, bus) = link_with(fast_config());
        let mut status_rx = bus.subscribe_to(Topic::DeviceStatus);

        link.connect().await;
        let _silent = next_peer(&mut accepted).await;

        let mut saw_drop = false;
        let _ = timeout(WAIT, async {
            while let Ok(ev) = status_rx.recv().await {
                if matches!(ev.payload, EventPayload::DeviceDisconnected) {
                    saw_drop = true;
                    break;
                }
            }
        })
        .await;
        assert!(saw_drop, "stale link must be torn down");

        // And the reconnect loop brings up a fresh connection.
        let _fresh = next_peer(&mut accepted).await;
        link.disconnect().await;
    }

    #[tokio::test]
    async fn inbound_messages_keep_link_alive_and_reach_bus() {
        let (link, _transport, mut accepted, bus) = link_with(fast_config());
        let mut telemetry = bus.subscribe_to(Topic::Telemetry);

        link.connect().await;
        let peer = next_peer(&mut accepted).await;

        // Keep talking for well over three heartbeat intervals.
        for i in 0..10 {
            peer.send_raw("garbage").unwrap();
            peer.send_json(&json!({"type": "ack"})).unwrap();
            peer.send_json(&json!({
                "type": "sensor",
                "data": {"ultrasonic": 50.0 + i as f64, "servo_angle": 90, "timestamp": i}
            }))
            .unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }

        assert!(link.status().await.connected);
        let ev = timeout(WAIT, telemetry.recv()).await.unwrap().unwrap();
        assert!(matches!(ev.payload, EventPayload::SensorData(s) if s.ultrasonic == 50.0));

        link.disconnect().await;
    }

    // ------------------------------------------------------------------ disconnect

    #[tokio::test]
    async fn disconnect_is_idempotent_and_stops_reconnecting() {
        let (link, transport, mut accepted, _bus) = link_with(slow_heartbeat());
        link.disconnect().await;

        link.connect().await;
        let _peer = next_peer(&mut accepted).await;

        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(link.connection_state().await, ConnectionState::Disconnected);

        let attempts = transport.attempts();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.attempts(), attempts);
        assert!(accepted.try_recv().is_err());

        // Commands queue up again while down.
        assert_eq!(
            link.send_command("stop", json!({})).await.unwrap(),
            SendOutcome::Queued
        );
    }

    #[tokio::test]
    async fn stalled_socket_write_does_not_wedge_the_link() {
        let (link, transport, mut accepted, bus) = link_with(fast_config());
        transport.set_mode(ConnectMode::Unresponsive);
        let mut status_rx = bus.subscribe_to(Topic::DeviceStatus);

        link.connect().await;
        let _deaf = next_peer(&mut accepted).await;

        let sender = link.clone();
        let send = tokio::spawn(async move { sender.send_command("move", json!({})).await });

        timeout(WAIT, link.status())
            .await
            .expect("status must not wait on the socket");

        // The robot never answers either, so the watchdog must still fire.
        let saw_drop = timeout(WAIT, async {
            loop {
                match status_rx.recv().await {
                    Ok(ev) if matches!(ev.payload, EventPayload::DeviceDisconnected) => break true,
                    Ok(_) => {}
                    Err(_) => break false,
                }
            }
        })
        .await;
        assert!(matches!(saw_drop, Ok(true)));

        let result = timeout(WAIT, send).await.expect("send must give up").unwrap();
        assert!(matches!(result, Err(MapError::Transport(_))));

        timeout(WAIT, link.disconnect())
            .await
            .expect("disconnect must not hang");
        assert_eq!(link.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn attempt_superseded_by_disconnect_is_discarded() {
        let config = DeviceLinkConfig {
            connect_timeout: Duration::from_secs(1),
            ..slow_heartbeat()
        };
        let (link, transport, mut accepted, bus) = link_with(config);
        let mut telemetry = bus.subscribe_to(Topic::Telemetry);
        transport.set_connect_delay(Duration::from_millis(100));

        let first = tokio::spawn({
            let link = link.clone();
            async move { link.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.disconnect().await;
        let second = tokio::spawn({
            let link = link.clone();
            async move { link.connect().await }
        });

        let stale = next_peer(&mut accepted).await;
        let live = next_peer(&mut accepted).await;
        timeout(WAIT, first).await.unwrap().unwrap();
        timeout(WAIT, second).await.unwrap().unwrap();
        assert!(link.status().await.connected);
        assert_eq!(transport.attempts(), 2);

        let reading = |ultrasonic: f64| {
            json!({
                "type": "sensor",
                "data": {"ultrasonic": ultrasonic, "servo_angle": 90, "timestamp": 1}
            })
        };
        // The discarded connection's stream was dropped with it.
        let _ = stale.send_json(&reading(11.0));
        live.send_json(&reading(22.0)).unwrap();

        let ev = timeout(WAIT, telemetry.recv()).await.unwrap().unwrap();
        assert!(matches!(ev.payload, EventPayload::SensorData(s) if s.ultrasonic == 22.0));
        assert!(
            timeout(Duration::from_millis(100), telemetry.recv())
                .await
                .is_err(),
            "only one connection may feed the bus"
        );

        link.disconnect().await;
    }

    #[tokio::test]
    async fn fifo_order_holds_while_connection_opens() {
        let (link, _transport, mut accepted, _bus) = link_with(slow_heartbeat());
        for name in ["a", "b"] {
            link.send_command(name, json!({})).await.unwrap();
        }

        let opener = link.clone();
        let opening = tokio::spawn(async move { opener.connect().await });
        link.send_command("c", json!({})).await.unwrap();
        let mut peer = next_peer(&mut accepted).await;
        timeout(WAIT, opening).await.unwrap().unwrap();

        for expected in ["a", "b", "c"] {
            let cmd = timeout(WAIT, peer.next_command()).await.unwrap().unwrap();
            assert_eq!(cmd.cmd, expected);
        }
        link.disconnect().await;
    }
}
