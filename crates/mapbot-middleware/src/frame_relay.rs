//! Live frame fan-out.
//!
//! [`FrameRelay`] keeps a short FIFO of recent frames and a set of viewers.
//! Every broadcast frame is stamped, appended to the history (evicting the
//! oldest beyond capacity) and handed to each viewer's [`ViewerChannel`]. A
//! viewer whose channel reports failure is dropped on the spot. New viewers
//! immediately get the most recent frame so their screen is never blank.
//!
//! The relay itself is not synchronized; the owner wraps it in a mutex.
//!
//! # Example
//!
//! ```rust
//! use mapbot_middleware::frame_relay::FrameRelay;
//! use mapbot_types::VideoFrame;
//! use tokio::sync::mpsc;
//!
//! let mut relay = FrameRelay::new(10);
//! let (tx, mut rx) = mpsc::channel(4);
//! relay.add_viewer("browser-1", Box::new(tx));
//!
//! relay.broadcast_frame(VideoFrame { data: "AAAA".into(), frame_id: 1 });
//! assert_eq!(rx.try_recv().unwrap().frame_id, 1);
//! assert_eq!(relay.stats().viewer_count, 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use mapbot_types::{MapError, RelayedFrame, VideoFrame};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

/// Default history depth.
pub const DEFAULT_BUFFER_SIZE: usize = 10;

const FPS_WINDOW: Duration = Duration::from_secs(1);

// ────────────────────────────────────────────────────────────────────────────
// Viewer channels
// ────────────────────────────────────────────────────────────────────────────

/// Delivery endpoint for one viewer.
///
/// Returning `Err` removes the viewer from the relay.
pub trait ViewerChannel: Send + Sync {
    fn deliver(&self, frame: &RelayedFrame) -> Result<(), MapError>;
}

/// Bounded channel: a full buffer skips this frame for this viewer only; a
/// closed channel removes the viewer.
impl ViewerChannel for mpsc::Sender<RelayedFrame> {
    fn deliver(&self, frame: &RelayedFrame) -> Result<(), MapError> {
        match self.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(frame_id = frame.frame_id, "viewer lagging, frame skipped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(MapError::Channel("viewer channel closed".into())),
        }
    }
}

impl ViewerChannel for mpsc::UnboundedSender<RelayedFrame> {
    fn deliver(&self, frame: &RelayedFrame) -> Result<(), MapError> {
        self.send(frame.clone())
            .map_err(|_| MapError::Channel("viewer channel closed".into()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FrameRelay
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub viewer_count: usize,
    /// Frames relayed during the last completed one-second window.
    pub fps: u32,
    pub buffer_size: usize,
}

pub struct FrameRelay {
    capacity: usize,
    history: VecDeque<RelayedFrame>,
    viewers: HashMap<String, Box<dyn ViewerChannel>>,
    frames_in_window: u32,
    window_start: Option<Instant>,
    fps: u32,
}

impl FrameRelay {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            history: VecDeque::with_capacity(capacity),
            viewers: HashMap::new(),
            frames_in_window: 0,
            window_start: None,
            fps: 0,
        }
    }

    /// Register a viewer, replacing any previous channel under the same id,
    /// and send it the latest frame if there is one.
    pub fn add_viewer(&mut self, id: impl Into<String>, channel: Box<dyn ViewerChannel>) {
        let id = id.into();
        if let Some(latest) = self.history.back()
            && let Err(e) = channel.deliver(latest)
        {
            debug!(viewer = %id, error = %e, "catch-up delivery failed, viewer not added");
            return;
        }
        info!(viewer = %id, viewers = self.viewers.len() + 1, "viewer joined stream");
        self.viewers.insert(id, channel);
    }

    /// Remove a viewer. Unknown ids are ignored.
    pub fn remove_viewer(&mut self, id: &str) {
        if self.viewers.remove(id).is_some() {
            info!(viewer = %id, viewers = self.viewers.len(), "viewer left stream");
        }
    }

    pub fn broadcast_frame(&mut self, frame: VideoFrame) {
        self.broadcast_frame_at(frame, Instant::now());
    }

    fn broadcast_frame_at(&mut self, frame: VideoFrame, now: Instant) {
        let relayed = RelayedFrame {
            data: frame.data,
            frame_id: frame.frame_id,
            timestamp: Utc::now().timestamp_millis(),
        };

        self.history.push_back(relayed);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }

        self.frames_in_window += 1;
        let window_elapsed = self
            .window_start
            .is_none_or(|start| now.duration_since(start) >= FPS_WINDOW);
        if window_elapsed {
            self.fps = self.frames_in_window;
            self.frames_in_window = 0;
            self.window_start = Some(now);
        }

        let Some(latest) = self.history.back() else {
            return;
        };
        let mut failed = Vec::new();
        for (id, channel) in &self.viewers {
            if let Err(e) = channel.deliver(latest) {
                debug!(viewer = %id, error = %e, "frame delivery failed");
                failed.push(id.clone());
            }
        }
        for id in failed {
            self.remove_viewer(&id);
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            viewer_count: self.viewers.len(),
            fps: self.fps,
            buffer_size: self.history.len(),
        }
    }

    pub fn latest(&self) -> Option<&RelayedFrame> {
        self.history.back()
    }

    /// Frame ids currently held, oldest first.
    pub fn history_ids(&self) -> Vec<u64> {
        self.history.iter().map(|f| f.frame_id).collect()
    }

    pub fn has_viewer(&self, id: &str) -> bool {
        self.viewers.contains_key(id)
    }
}

impl Default for FrameRelay {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn frame(id: u64) -> VideoFrame {
        VideoFrame {
            data: format!("frame-{id}"),
            frame_id: id,
        }
    }

    /// Records deliveries; optionally fails every call.
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<u64>>>,
        broken: bool,
    }

    impl ViewerChannel for Recorder {
        fn deliver(&self, frame: &RelayedFrame) -> Result<(), MapError> {
            if self.broken {
                return Err(MapError::Channel("socket closed".into()));
            }
            self.seen.lock().unwrap().push(frame.frame_id);
            Ok(())
        }
    }

    #[test]
    fn history_evicts_oldest_beyond_capacity() {
        let mut relay = FrameRelay::new(3);
        for id in 1..=5 {
            relay.broadcast_frame(frame(id));
        }
        assert_eq!(relay.history_ids(), vec![3, 4, 5]);
        assert_eq!(relay.stats().buffer_size, 3);
    }

    #[test]
    fn new_viewer_gets_latest_frame_immediately() {
        let mut relay = FrameRelay::default();
        relay.broadcast_frame(frame(1));
        relay.broadcast_frame(frame(2));

        let viewer = Recorder::default();
        relay.add_viewer("late", Box::new(viewer.clone()));
        assert_eq!(*viewer.seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn no_catch_up_when_history_empty() {
        let mut relay = FrameRelay::default();
        let viewer = Recorder::default();
        relay.add_viewer("early", Box::new(viewer.clone()));
        assert!(viewer.seen.lock().unwrap().is_empty());
        assert!(relay.has_viewer("early"));

        // The next broadcast is delivered exactly once.
        relay.broadcast_frame(frame(1));
        assert_eq!(*viewer.seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn failing_viewer_is_removed_others_keep_receiving() {
        let mut relay = FrameRelay::default();
        let good = Recorder::default();
        let bad = Recorder {
            broken: true,
            ..Recorder::default()
        };
        relay.add_viewer("good", Box::new(good.clone()));
        relay.add_viewer("bad", Box::new(bad));
        assert_eq!(relay.stats().viewer_count, 2);

        relay.broadcast_frame(frame(7));
        assert_eq!(relay.stats().viewer_count, 1);
        assert!(!relay.has_viewer("bad"));
        assert_eq!(*good.seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn remove_unknown_viewer_is_noop() {
        let mut relay = FrameRelay::default();
        relay.remove_viewer("ghost");
        assert_eq!(relay.stats().viewer_count, 0);
    }

    #[test]
    fn closed_mpsc_viewer_is_removed_full_one_is_kept() {
        let mut relay = FrameRelay::default();

        let (closed_tx, closed_rx) = mpsc::channel::<RelayedFrame>(1);
        drop(closed_rx);
        let (full_tx, mut full_rx) = mpsc::channel::<RelayedFrame>(1);

        relay.add_viewer("closed", Box::new(closed_tx));
        relay.add_viewer("full", Box::new(full_tx));

        relay.broadcast_frame(frame(1));
        relay.broadcast_frame(frame(2));

        assert!(!relay.has_viewer("closed"));
        assert!(relay.has_viewer("full"));
        assert_eq!(full_rx.try_recv().unwrap().frame_id, 1);
    }

    #[test]
    fn relayed_frame_carries_id_and_timestamp() {
        let mut relay = FrameRelay::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.add_viewer("v", Box::new(tx));
        relay.broadcast_frame(frame(42));

        let got = rx.try_recv().unwrap();
        assert_eq!(got.frame_id, 42);
        assert_eq!(got.data, "frame-42");
        assert!(got.timestamp > 0);
    }

    #[test]
    fn fps_counts_frames_per_window() {
        let mut relay = FrameRelay::default();
        let t0 = Instant::now();

        // First frame closes the initial (empty) window.
        relay.broadcast_frame_at(frame(0), t0);
        assert_eq!(relay.stats().fps, 1);

        for i in 1..=14 {
            relay.broadcast_frame_at(frame(i), t0 + Duration::from_millis(i * 60));
        }
        // 14 × 60 ms = 840 ms: window still open.
        assert_eq!(relay.stats().fps, 1);

        relay.broadcast_frame_at(frame(15), t0 + Duration::from_millis(1000));
        assert_eq!(relay.stats().fps, 15);
    }
}
