//! Planar coordinate math.
//!
//! Stateless helpers shared by the fusion unit and the occupancy grid:
//! polar/cartesian conversion, rigid 2-D transforms, angle wrapping and the
//! mapping between world coordinates and grid cells.
//!
//! Grid cells are addressed with signed indices so that callers can detect
//! (and clip) points that fall outside the grid.
//!
//! # Example
//!
//! ```rust
//! use mapbot_perception::geometry::{polar_to_cartesian, world_to_grid};
//!
//! let p = polar_to_cartesian(100.0, 0.0);
//! assert!((p.x - 100.0).abs() < 1e-9);
//!
//! // 100×100 grid with 10-unit cells: the origin lands on cell (50, 50).
//! assert_eq!(world_to_grid(0.0, 0.0, 10.0, 100), (50, 50));
//! assert_eq!(world_to_grid(-1.0, 19.0, 10.0, 100), (49, 51));
//! ```

use std::f64::consts::PI;

use mapbot_types::Point2;

// ────────────────────────────────────────────────────────────────────────────
// Polar / cartesian
// ────────────────────────────────────────────────────────────────────────────

/// Convert a range and bearing (radians, counter-clockwise from +X) into a
/// cartesian point.
pub fn polar_to_cartesian(distance: f64, angle_rad: f64) -> Point2 {
    Point2::new(distance * angle_rad.cos(), distance * angle_rad.sin())
}

/// Inverse of [`polar_to_cartesian`]: returns `(distance, angle_rad)`.
pub fn cartesian_to_polar(p: Point2) -> (f64, f64) {
    (p.x.hypot(p.y), p.y.atan2(p.x))
}

// ────────────────────────────────────────────────────────────────────────────
// Rigid transforms
// ────────────────────────────────────────────────────────────────────────────

/// Rotate `p` about the origin by `angle_rad`.
pub fn rotate(p: Point2, angle_rad: f64) -> Point2 {
    let (sin, cos) = angle_rad.sin_cos();
    Point2::new(p.x * cos - p.y * sin, p.x * sin + p.y * cos)
}

/// Translate `p` by `offset`.
pub fn translate(p: Point2, offset: Point2) -> Point2 {
    Point2::new(p.x + offset.x, p.y + offset.y)
}

/// Euclidean distance between two points.
pub fn distance(a: Point2, b: Point2) -> f64 {
    (b.x - a.x).hypot(b.y - a.y)
}

// ────────────────────────────────────────────────────────────────────────────
// Angles
// ────────────────────────────────────────────────────────────────────────────

pub fn deg_to_rad(degrees: f64) -> f64 {
    degrees * PI / 180.0
}

pub fn rad_to_deg(radians: f64) -> f64 {
    radians * 180.0 / PI
}

/// Wrap an angle into `(-π, π]` by repeated ±2π steps.
///
/// Stepping (rather than `rem_euclid`) keeps `π` at `π` and maps `-π` onto
/// `π`, so the interval stays half-open on the negative side.
pub fn normalize_angle(mut angle_rad: f64) -> f64 {
    if !angle_rad.is_finite() {
        return angle_rad;
    }
    while angle_rad > PI {
        angle_rad -= 2.0 * PI;
    }
    while angle_rad <= -PI {
        angle_rad += 2.0 * PI;
    }
    angle_rad
}

/// Wrap an angle in degrees into `[-180, 180]`.
pub fn normalize_degrees(angle_deg: f64) -> f64 {
    let mut normalized = angle_deg % 360.0;
    if normalized > 180.0 {
        normalized -= 360.0;
    }
    if normalized < -180.0 {
        normalized += 360.0;
    }
    normalized
}

// ────────────────────────────────────────────────────────────────────────────
// Scalar helpers
// ────────────────────────────────────────────────────────────────────────────

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Round to the nearest integer with ties going towards `+∞`
/// (`-2.5 → -2`, `2.5 → 3`).
pub fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

// ────────────────────────────────────────────────────────────────────────────
// Grid ↔ world
// ────────────────────────────────────────────────────────────────────────────

/// Map a world coordinate onto a cell of a `grid_size × grid_size` grid whose
/// centre cell sits on the world origin.
///
/// The result may lie outside `[0, grid_size)`; bounds are the caller's
/// concern.
pub fn world_to_grid(x: f64, y: f64, cell_size: f64, grid_size: usize) -> (i64, i64) {
    let centre = (grid_size / 2) as i64;
    (
        (x / cell_size).floor() as i64 + centre,
        (y / cell_size).floor() as i64 + centre,
    )
}

/// World coordinate of the lower-left corner of cell `(gx, gy)`.
pub fn grid_to_world(gx: i64, gy: i64, cell_size: f64, grid_size: usize) -> Point2 {
    let centre = (grid_size / 2) as i64;
    Point2::new(
        (gx - centre) as f64 * cell_size,
        (gy - centre) as f64 * cell_size,
    )
}
