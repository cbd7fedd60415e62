//! Map persistence.
//!
//! [`MapStore`] is the narrow interface the mapping service talks to. Two
//! implementations are provided:
//!
//! - [`SqliteMapStore`] – durable store backed by a local SQLite file.
//! - [`InMemoryMapStore`] – process-local store for tests and ephemeral runs.
//!
//! # Storage layout
//!
//! A single table `maps` is created (if it does not already exist):
//!
//! | column       | type    | description                                 |
//! |--------------|---------|---------------------------------------------|
//! | id           | TEXT    | UUID v4 primary key                         |
//! | session_id   | TEXT    | Mapping session id, unique                  |
//! | name         | TEXT    | Display name                                |
//! | grid         | TEXT    | JSON-encoded ternary matrix `grid[x][y]`    |
//! | width        | INTEGER | Cells along X                               |
//! | height       | INTEGER | Cells along Y                               |
//! | resolution   | REAL    | Cell edge in world units                    |
//! | origin_x     | REAL    | World X of cell (0, 0)                      |
//! | origin_y     | REAL    | World Y of cell (0, 0)                      |
//! | duration_ms  | INTEGER | Session length                              |
//! | update_count | INTEGER | Observations folded into the grid           |
//! | coverage     | REAL    | Percentage of touched cells                 |
//! | created_at   | TEXT    | RFC-3339 creation time (UTC, microseconds)  |
//!
//! # Example
//!
//! ```rust
//! use mapbot_memory::map_store::{MapFilter, MapStore, SqliteMapStore};
//! # use mapbot_types::{MapMetadata, MapRecord, Point2};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = SqliteMapStore::open_in_memory().unwrap();
//! # let record = MapRecord {
//! #     id: uuid::Uuid::new_v4(),
//! #     session_id: "session_1_op".into(),
//! #     name: "Map_demo".into(),
//! #     grid: vec![vec![-1; 2]; 2],
//! #     width: 2,
//! #     height: 2,
//! #     resolution: 10.0,
//! #     origin: Point2::new(-10.0, -10.0),
//! #     metadata: MapMetadata { duration: 5, update_count: 0, coverage: 0.0 },
//! #     created_at: chrono::Utc::now(),
//! # };
//! let id = store.save(&record).await.unwrap();
//! let loaded = store.find_by_id(id).await.unwrap();
//! assert_eq!(loaded.session_id, "session_1_op");
//!
//! let page = store.find_many(&MapFilter::default(), 1, 10).await.unwrap();
//! assert_eq!(page.len(), 1);
//! # }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mapbot_types::{MapError, MapMetadata, MapRecord, Point2};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised inside a store before they are surfaced as
/// [`MapError::Persistence`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("grid encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("session {0} already has a saved map")]
    DuplicateSession(String),
}

impl From<StoreError> for MapError {
    fn from(e: StoreError) -> Self {
        MapError::Persistence(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MapStore trait
// ─────────────────────────────────────────────────────────────────────────────

/// Filter applied by [`MapStore::find_many`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapFilter {
    /// Case-sensitive substring the map name must contain.
    pub name_contains: Option<String>,
}

#[async_trait]
pub trait MapStore: Send + Sync {
    /// Persist a finished map. Fails if the session already has one.
    async fn save(&self, record: &MapRecord) -> Result<Uuid, MapError>;

    /// Fetch one map, or [`MapError::NotFound`].
    async fn find_by_id(&self, id: Uuid) -> Result<MapRecord, MapError>;

    /// List maps newest first. `page` is 1-based; `0` is treated as `1`.
    async fn find_many(
        &self,
        filter: &MapFilter,
        page: usize,
        limit: usize,
    ) -> Result<Vec<MapRecord>, MapError>;

    /// Remove a map. Returns `false` if it did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool, MapError>;
}

fn page_offset(page: usize, limit: usize) -> usize {
    page.max(1).saturating_sub(1).saturating_mul(limit)
}

fn not_found(id: Uuid) -> MapError {
    MapError::NotFound(format!("map {id}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteMapStore
// ─────────────────────────────────────────────────────────────────────────────

pub struct SqliteMapStore {
    conn: Mutex<Connection>,
}

impl SqliteMapStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path = %path.as_ref().display(), "map store opened");
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS maps (
                id           TEXT NOT NULL PRIMARY KEY,
                session_id   TEXT NOT NULL UNIQUE,
                name         TEXT NOT NULL,
                grid         TEXT NOT NULL,
                width        INTEGER NOT NULL,
                height       INTEGER NOT NULL,
                resolution   REAL NOT NULL,
                origin_x     REAL NOT NULL,
                origin_y     REAL NOT NULL,
                duration_ms  INTEGER NOT NULL,
                update_count INTEGER NOT NULL,
                coverage     REAL NOT NULL,
                created_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS maps_created_at ON maps (created_at);",
        )?;
        Ok(())
    }

    fn insert(&self, record: &MapRecord) -> Result<(), StoreError> {
        let grid = serde_json::to_string(&record.grid)?;
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;

        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM maps WHERE session_id = ?1",
                params![record.session_id],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(StoreError::DuplicateSession(record.session_id.clone()));
        }

        conn.execute(
            "INSERT INTO maps
                 (id, session_id, name, grid, width, height, resolution,
                  origin_x, origin_y, duration_ms, update_count, coverage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.id.to_string(),
                record.session_id,
                record.name,
                grid,
                record.width as i64,
                record.height as i64,
                record.resolution,
                record.origin.x,
                record.origin.y,
                record.metadata.duration,
                record.metadata.update_count as i64,
                record.metadata.coverage,
                record
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
        Ok(())
    }

    fn select_one(&self, id: Uuid) -> Result<Option<MapRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM maps WHERE id = ?1"),
                params![id.to_string()],
                RawRow::read,
            )
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn select_page(
        &self,
        filter: &MapFilter,
        page: usize,
        limit: usize,
    ) -> Result<Vec<MapRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM maps
             WHERE instr(name, ?1) > 0 OR ?1 = ''
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let needle = filter.name_contains.clone().unwrap_or_default();
        debug!(filter = ?filter.name_contains, page, limit, "listing maps");
        let rows = stmt.query_map(
            params![needle, limit as i64, page_offset(page, limit) as i64],
            RawRow::read,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let n = conn.execute("DELETE FROM maps WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }
}

#[async_trait]
impl MapStore for SqliteMapStore {
    async fn save(&self, record: &MapRecord) -> Result<Uuid, MapError> {
        self.insert(record)?;
        info!(map_id = %record.id, session_id = %record.session_id, "map saved");
        Ok(record.id)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<MapRecord, MapError> {
        self.select_one(id)?.ok_or_else(|| not_found(id))
    }

    async fn find_many(
        &self,
        filter: &MapFilter,
        page: usize,
        limit: usize,
    ) -> Result<Vec<MapRecord>, MapError> {
        Ok(self.select_page(filter, page, limit)?)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, MapError> {
        let removed = self.remove(id)?;
        if removed {
            info!(map_id = %id, "map deleted");
        }
        Ok(removed)
    }
}

const COLUMNS: &str = "id, session_id, name, grid, width, height, resolution, \
                       origin_x, origin_y, duration_ms, update_count, coverage, created_at";

/// Column values exactly as SQLite returns them.
struct RawRow {
    id: String,
    session_id: String,
    name: String,
    grid: String,
    width: i64,
    height: i64,
    resolution: f64,
    origin_x: f64,
    origin_y: f64,
    duration_ms: i64,
    update_count: i64,
    coverage: f64,
    created_at: String,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            name: row.get(2)?,
            grid: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
            resolution: row.get(6)?,
            origin_x: row.get(7)?,
            origin_y: row.get(8)?,
            duration_ms: row.get(9)?,
            update_count: row.get(10)?,
            coverage: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<MapRecord, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("id {}: {e}", self.id)))?;
        let created_at = self
            .created_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| StoreError::Corrupt(format!("created_at {}: {e}", self.created_at)))?;
        Ok(MapRecord {
            id,
            session_id: self.session_id,
            name: self.name,
            grid: serde_json::from_str(&self.grid)?,
            width: self.width.max(0) as usize,
            height: self.height.max(0) as usize,
            resolution: self.resolution,
            origin: Point2::new(self.origin_x, self.origin_y),
            metadata: MapMetadata {
                duration: self.duration_ms,
                update_count: self.update_count.max(0) as u64,
                coverage: self.coverage,
            },
            created_at,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryMapStore
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryMapStore {
    maps: Mutex<HashMap<Uuid, MapRecord>>,
}

impl InMemoryMapStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MapStore for InMemoryMapStore {
    async fn save(&self, record: &MapRecord) -> Result<Uuid, MapError> {
        let mut maps = self.maps.lock().map_err(|_| StoreError::Poisoned)?;
        if maps.values().any(|m| m.session_id == record.session_id) {
            return Err(StoreError::DuplicateSession(record.session_id.clone()).into());
        }
        maps.insert(record.id, record.clone());
        Ok(record.id)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<MapRecord, MapError> {
        let maps = self.maps.lock().map_err(|_| StoreError::Poisoned)?;
        maps.get(&id).cloned().ok_or_else(|| not_found(id))
    }

    async fn find_many(
        &self,
        filter: &MapFilter,
        page: usize,
        limit: usize,
    ) -> Result<Vec<MapRecord>, MapError> {
        let maps = self.maps.lock().map_err(|_| StoreError::Poisoned)?;
        let mut matching: Vec<&MapRecord> = maps
            .values()
            .filter(|m| match &filter.name_contains {
                Some(needle) => m.name.contains(needle.as_str()),
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(page_offset(page, limit))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, MapError> {
        let mut maps = self.maps.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(maps.remove(&id).is_some())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
