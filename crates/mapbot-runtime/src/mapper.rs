//! [`OccupancyMapper`] – mapping-session service.
//!
//! Owns the occupancy grid and the session lifecycle:
//!
//! ```text
//! Idle --start_new_session--> Mapping --end_session | reset--> Idle
//! ```
//!
//! Starting a session while one is active silently discards the grid built
//! so far. Ending a session snapshots the grid, persists it as a
//! [`MapRecord`] through the configured [`MapStore`], and returns the record.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mapbot_memory::InMemoryMapStore;
//! use mapbot_runtime::mapper::{MapperConfig, OccupancyMapper};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut mapper = OccupancyMapper::new(MapperConfig::default(), Arc::new(InMemoryMapStore::new()));
//! assert!(mapper.current_map_data().is_none());
//!
//! mapper.start_new_session("operator");
//! let snapshot = mapper.current_map_data().unwrap();
//! assert!(snapshot.grid.iter().flatten().all(|&c| c == -1));
//!
//! let record = mapper.end_session().await.unwrap().unwrap();
//! assert!(record.name.starts_with("Map_"));
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use mapbot_memory::MapStore;
use mapbot_memory::raster::render_png;
use mapbot_perception::occupancy::{DEFAULT_OCCUPIED_THRESHOLD, OccupancyGrid};
use mapbot_types::{FusedObservation, MapError, MapMetadata, MapRecord, MapSnapshot};
use tracing::{info, warn};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapperConfig {
    /// Cells per side of the square grid.
    pub grid_size: usize,
    /// Cell edge in world units.
    pub cell_size: f64,
    /// Readings at or beyond this distance only mark the robot cell.
    pub max_distance: f64,
    /// `occupied_count` a cell must exceed to be reported occupied.
    pub occupied_threshold: u32,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            grid_size: 100,
            cell_size: 10.0,
            max_distance: 400.0,
            occupied_threshold: DEFAULT_OCCUPIED_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSession {
    /// `session_<start ms>_<initiator>`.
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub update_count: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// OccupancyMapper
// ─────────────────────────────────────────────────────────────────────────────

pub struct OccupancyMapper {
    config: MapperConfig,
    grid: OccupancyGrid,
    session: Option<MappingSession>,
    store: Arc<dyn MapStore>,
}

impl OccupancyMapper {
    pub fn new(config: MapperConfig, store: Arc<dyn MapStore>) -> Self {
        Self {
            config,
            grid: OccupancyGrid::new(config.grid_size, config.cell_size),
            session: None,
            store,
        }
    }

    /// Begin a fresh session on a zeroed grid and return its id.
    pub fn start_new_session(&mut self, initiator: &str) -> String {
        if let Some(previous) = &self.session {
            warn!(session_id = %previous.id, updates = previous.update_count, "discarding in-progress mapping session");
        }

        let now = Utc::now();
        let id = format!("session_{}_{}", now.timestamp_millis(), initiator);
        self.grid = OccupancyGrid::new(self.config.grid_size, self.config.cell_size);
        self.session = Some(MappingSession {
            id: id.clone(),
            start_time: now,
            update_count: 0,
        });
        info!(session_id = %id, "mapping session started");
        id
    }

    /// Fold one observation into the grid. Ignored while idle.
    pub fn update_map(&mut self, observation: &FusedObservation) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        self.grid.integrate(observation, self.config.max_distance);
        session.update_count += 1;
    }

    /// Ternary snapshot of the grid, or `None` while idle.
    pub fn current_map_data(&self) -> Option<MapSnapshot> {
        self.session
            .as_ref()
            .map(|_| self.grid.snapshot(self.config.occupied_threshold))
    }

    /// Persist the current session and return the saved record, or `None`
    /// while idle.
    ///
    /// The session stays active if the store rejects the record.
    pub async fn end_session(&mut self) -> Result<Option<MapRecord>, MapError> {
        let Some(record) = self.session_record() else {
            return Ok(None);
        };
        self.store.save(&record).await?;
        self.finish_session(&record);
        Ok(Some(record))
    }

    /// The record [`end_session`](Self::end_session) would save, built from
    /// the grid as it is now. The session is left running.
    pub fn session_record(&self) -> Option<MapRecord> {
        let session = self.session.as_ref()?;
        let now = Utc::now();
        let snapshot = self.grid.snapshot(self.config.occupied_threshold);
        Some(MapRecord {
            id: Uuid::new_v4(),
            session_id: session.id.clone(),
            name: format!("Map_{}", now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            grid: snapshot.grid,
            width: snapshot.width,
            height: snapshot.height,
            resolution: snapshot.resolution,
            origin: snapshot.origin,
            metadata: MapMetadata {
                duration: (now - session.start_time).num_milliseconds(),
                update_count: session.update_count,
                coverage: self.grid.coverage(),
            },
            created_at: now,
        })
    }

    /// Close the session `record` was built from, once it has been saved.
    ///
    /// Returns `false` and leaves the mapper alone if another session has
    /// started since.
    pub fn finish_session(&mut self, record: &MapRecord) -> bool {
        if self
            .session
            .as_ref()
            .is_none_or(|s| s.id != record.session_id)
        {
            return false;
        }
        self.session = None;
        info!(
            session_id = %record.session_id,
            map_id = %record.id,
            coverage = record.metadata.coverage,
            updates = record.metadata.update_count,
            "mapping session saved"
        );
        true
    }

    /// Render a stored map as PNG.
    pub async fn export_as_image(&self, map_id: &str) -> Result<Vec<u8>, MapError> {
        export_map_image(self.store.as_ref(), map_id).await
    }

    /// Drop the grid and any active session.
    pub fn reset(&mut self) {
        self.grid = OccupancyGrid::new(self.config.grid_size, self.config.cell_size);
        if let Some(session) = self.session.take() {
            info!(session_id = %session.id, "mapping session reset");
        }
    }

    pub fn session(&self) -> Option<&MappingSession> {
        self.session.as_ref()
    }

    pub fn is_mapping(&self) -> bool {
        self.session.is_some()
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Shared handle on the backing store, for callers that should not hold
    /// the mapper while they wait on I/O.
    pub fn store(&self) -> Arc<dyn MapStore> {
        Arc::clone(&self.store)
    }
}

/// Fetch `map_id` from `store` and rasterize it.
///
/// Ids that are not UUIDs cannot exist and are reported as not found.
pub async fn export_map_image(store: &dyn MapStore, map_id: &str) -> Result<Vec<u8>, MapError> {
    let id = Uuid::parse_str(map_id).map_err(|_| MapError::NotFound(format!("map {map_id}")))?;
    let record = store.find_by_id(id).await?;
    render_png(&record.grid, record.width, record.height)
}
