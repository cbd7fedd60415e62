//! `mapbot-perception` – Spatial reasoning layer.
//!
//! Turns noisy range readings into a picture of the world the operator can
//! read at a glance.
//!
//! # Modules
//!
//! - [`geometry`] – stateless planar math: polar/cartesian conversion, rigid
//!   transforms, angle wrapping and the world ↔ grid cell mapping.
//! - [`fusion`] – [`SensorFusion`][fusion::SensorFusion]: median filter,
//!   calibration offset and pose, producing world-frame
//!   [`FusedObservation`][mapbot_types::FusedObservation]s.
//! - [`occupancy`] – [`OccupancyGrid`][occupancy::OccupancyGrid]: counting
//!   grid with Bresenham free-space carving and a ternary snapshot.

pub mod fusion;
pub mod geometry;
pub mod occupancy;
