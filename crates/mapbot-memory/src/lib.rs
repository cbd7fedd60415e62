//! `mapbot-memory` – Map persistence.
//!
//! Keeps finished maps around after their mapping session ends, utilizing a
//! local SQLite substrate.
//!
//! # Modules
//!
//! - [`map_store`] – [`MapStore`][map_store::MapStore]: save / find / list /
//!   delete interface, with [`SqliteMapStore`][map_store::SqliteMapStore] and
//!   [`InMemoryMapStore`][map_store::InMemoryMapStore] implementations.
//! - [`raster`] – [`render_png`][raster::render_png]: one-pixel-per-cell
//!   grayscale PNG export of a ternary grid.

pub mod map_store;
pub mod raster;

pub use map_store::{InMemoryMapStore, MapFilter, MapStore, SqliteMapStore};
