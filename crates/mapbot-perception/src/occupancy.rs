//! Counting occupancy grid with Bresenham free-space carving.
//!
//! Each cell keeps two monotonically increasing counters: how many times a
//! range return landed in it (`occupied_count`) and how many times the robot
//! stood in it or a ray passed through it (`visited_count`). The ternary
//! snapshot is derived from those counters on demand.
//!
//! The grid is square, `size × size`, with cell `(size/2, size/2)` on the
//! world origin. Cells outside the grid are silently clipped.
//!
//! # Example
//!
//! ```rust
//! use mapbot_perception::occupancy::OccupancyGrid;
//! use mapbot_types::{FusedObservation, WorldPoint};
//!
//! let mut grid = OccupancyGrid::new(100, 10.0);
//! let obs = FusedObservation {
//!     distance: 100.0,
//!     angle: 90.0,
//!     robot_position: WorldPoint::new(0, 0),
//!     world_obstacle_point: WorldPoint::new(100, 0),
//!     battery: 0.0,
//!     timestamp: 0,
//! };
//! for _ in 0..4 {
//!     grid.integrate(&obs, 400.0);
//! }
//! let snap = grid.snapshot(3);
//! assert_eq!(snap.grid[60][50], 1);  // obstacle
//! assert_eq!(snap.grid[55][50], 0);  // carved free space
//! assert_eq!(snap.grid[0][0], -1);   // never observed
//! ```

use chrono::{DateTime, Utc};
use mapbot_types::{CellState, FusedObservation, MapSnapshot, Point2};

use crate::geometry::{grid_to_world, world_to_grid};

/// Default `occupied_count` a cell must exceed to be reported occupied.
pub const DEFAULT_OCCUPIED_THRESHOLD: u32 = 3;

/// Evidence accumulated for one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridCell {
    pub occupied_count: u32,
    pub visited_count: u32,
    pub last_update: Option<DateTime<Utc>>,
}

impl GridCell {
    /// Classify the cell: occupied wins over free, free over unknown.
    pub fn state(&self, occupied_threshold: u32) -> CellState {
        if self.occupied_count > occupied_threshold {
            CellState::Occupied
        } else if self.visited_count > 0 {
            CellState::Free
        } else {
            CellState::Unknown
        }
    }

    fn touched(&self) -> bool {
        self.visited_count > 0 || self.occupied_count > 0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OccupancyGrid
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    size: usize,
    cell_size: f64,
    cells: Vec<GridCell>,
}

impl OccupancyGrid {
    /// Allocate a zeroed `size × size` grid of `cell_size`-unit cells.
    pub fn new(size: usize, cell_size: f64) -> Self {
        Self {
            size,
            cell_size,
            cells: vec![GridCell::default(); size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// World coordinate of cell `(0, 0)`.
    pub fn origin(&self) -> Point2 {
        grid_to_world(0, 0, self.cell_size, self.size)
    }

    pub fn in_bounds(&self, gx: i64, gy: i64) -> bool {
        let n = self.size as i64;
        (0..n).contains(&gx) && (0..n).contains(&gy)
    }

    fn index(&self, gx: i64, gy: i64) -> Option<usize> {
        self.in_bounds(gx, gy)
            .then(|| gx as usize * self.size + gy as usize)
    }

    pub fn cell(&self, gx: i64, gy: i64) -> Option<&GridCell> {
        self.index(gx, gy).map(|i| &self.cells[i])
    }

    /// Cell containing the world point `(x, y)`, possibly out of bounds.
    pub fn cell_of(&self, x: f64, y: f64) -> (i64, i64) {
        world_to_grid(x, y, self.cell_size, self.size)
    }

    pub fn mark_visited(&mut self, gx: i64, gy: i64) {
        if let Some(i) = self.index(gx, gy) {
            self.cells[i].visited_count += 1;
        }
    }

    pub fn mark_occupied(&mut self, gx: i64, gy: i64, at: DateTime<Utc>) {
        if let Some(i) = self.index(gx, gy) {
            let cell = &mut self.cells[i];
            cell.occupied_count += 1;
            cell.last_update = Some(at);
        }
    }

    /// Walk a Bresenham line from `from` towards `to`, incrementing
    /// `visited_count` on every cell before the target. The target cell
    /// itself is never marked.
    ///
    /// The walk stops as soon as the rest of the line cannot touch the grid,
    /// so wild off-grid endpoints cost nothing.
    pub fn trace_ray(&mut self, from: (i64, i64), to: (i64, i64)) {
        let (mut x, mut y) = from;
        let (x1, y1) = to;
        let dx = (x1 - x).abs();
        let dy = (y1 - y).abs();
        let sx = if x < x1 { 1 } else { -1 };
        let sy = if y < y1 { 1 } else { -1 };
        let mut err = dx - dy;
        let mut entered = false;

        // Each axis moves monotonically, so the remaining span on that axis
        // is exactly [min(v, end), max(v, end)].
        let n = self.size as i64;
        let misses = |v: i64, end: i64| v.max(end) < 0 || v.min(end) >= n;

        while (x, y) != (x1, y1) {
            if self.in_bounds(x, y) {
                self.mark_visited(x, y);
                entered = true;
            } else if entered || misses(x, x1) || misses(y, y1) {
                // Left the grid (a line cannot re-enter it) or never will reach it.
                break;
            }

            let e2 = 2 * err;
            if e2 > -dy {
                err -= dy;
                x += sx;
            }
            if e2 < dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// Fold one fused observation into the grid.
    ///
    /// The robot cell always gains a visit. Returns within `max_distance`
    /// also mark the obstacle cell and carve the ray leading to it.
    pub fn integrate(&mut self, obs: &FusedObservation, max_distance: f64) {
        let robot = self.cell_of(obs.robot_position.x as f64, obs.robot_position.y as f64);
        let obstacle = self.cell_of(
            obs.world_obstacle_point.x as f64,
            obs.world_obstacle_point.y as f64,
        );

        self.mark_visited(robot.0, robot.1);

        if obs.distance < max_distance {
            self.mark_occupied(obstacle.0, obstacle.1, Utc::now());
            self.trace_ray(robot, obstacle);
        }
    }

    /// Ternary view of the grid, indexed `grid[gx][gy]`.
    pub fn snapshot(&self, occupied_threshold: u32) -> MapSnapshot {
        let grid = self
            .cells
            .chunks(self.size.max(1))
            .take(self.size)
            .map(|column| {
                column
                    .iter()
                    .map(|c| c.state(occupied_threshold).as_i8())
                    .collect()
            })
            .collect();

        MapSnapshot {
            grid,
            width: self.size,
            height: self.size,
            resolution: self.cell_size,
            origin: self.origin(),
        }
    }

    /// Percentage of cells with any evidence, in `[0, 100]`.
    pub fn coverage(&self) -> f64 {
        if self.cells.is_empty() {
            return 0.0;
        }
        let touched = self.cells.iter().filter(|c| c.touched()).count();
        touched as f64 / self.cells.len() as f64 * 100.0
    }

    /// Zero every counter in place.
    pub fn clear(&mut self) {
        self.cells.fill(GridCell::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapbot_types::WorldPoint;

    fn obs(robot: (i64, i64), obstacle: (i64, i64), distance: f64) -> FusedObservation {
        FusedObservation {
            distance,
            angle: 90.0,
            robot_position: WorldPoint::new(robot.0, robot.1),
            world_obstacle_point: WorldPoint::new(obstacle.0, obstacle.1),
            battery: 0.0,
            timestamp: 0,
        }
    }

    #[test]
    fn fresh_grid_is_entirely_unknown() {
        let grid = OccupancyGrid::new(100, 10.0);
        let snap = grid.snapshot(DEFAULT_OCCUPIED_THRESHOLD);
        assert_eq!(snap.width, 100);
        assert_eq!(snap.grid.len(), 100);
        assert!(snap.grid.iter().all(|col| col.len() == 100 && col.iter().all(|&v| v == -1)));
        assert_eq!(grid.coverage(), 0.0);
    }

    #[test]
    fn origin_is_world_coordinate_of_first_cell() {
        let grid = OccupancyGrid::new(100, 10.0);
        assert_eq!(grid.origin(), Point2::new(-500.0, -500.0));
    }

    #[test]
    fn obstacle_becomes_occupied_after_exceeding_threshold() {
        let mut grid = OccupancyGrid::new(100, 10.0);
        let o = obs((0, 0), (100, 0), 100.0);
        for _ in 0..5 {
            grid.integrate(&o, 400.0);
        }
        assert_eq!(grid.snapshot(3).grid[60][50], 1);
        assert!(grid.cell(60, 50).and_then(|c| c.last_update).is_some());
    }

    #[test]
    fn three_hits_are_not_enough() {
        let mut grid = OccupancyGrid::new(100, 10.0);
        let o = obs((0, 0), (100, 0), 100.0);
        for _ in 0..3 {
            grid.integrate(&o, 400.0);
        }
        assert_ne!(grid.snapshot(3).grid[60][50], 1);
        assert_eq!(grid.cell(60, 50).map(|c| c.occupied_count), Some(3));
    }

    #[test]
    fn ray_marks_start_but_not_target() {
        let mut grid = OccupancyGrid::new(100, 10.0);
        grid.trace_ray((50, 50), (55, 50));
        for gx in 50..55 {
            assert_eq!(grid.cell(gx, 50).map(|c| c.visited_count), Some(1));
        }
        assert_eq!(grid.cell(55, 50).map(|c| c.visited_count), Some(0));
    }

    #[test]
    fn ray_that_never_crosses_the_grid_is_skipped() {
        let mut grid = OccupancyGrid::new(100, 10.0);
        let started = std::time::Instant::now();
        grid.trace_ray((110, 110), (200, 2_000_000_000));
        grid.trace_ray((110, 50), (2_000_000_000, -7));
        grid.trace_ray((-3, -3), (-2_000_000_000, 40));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(grid.coverage(), 0.0);
    }

    #[test]
    fn ray_from_outside_still_carves_the_crossing() {
        let mut grid = OccupancyGrid::new(100, 10.0);
        grid.trace_ray((-5, 50), (2_000_000_000, 50));
        for gx in 0..100 {
            assert_eq!(grid.cell(gx, 50).map(|c| c.visited_count), Some(1));
        }
        assert_eq!(grid.coverage(), 1.0);
    }

    #[test]
    fn diagonal_ray_visits_each_step_once() {
        let mut grid = OccupancyGrid::new(20, 1.0);
        grid.trace_ray((2, 2), (6, 6));
        for i in 2..6 {
            assert_eq!(grid.cell(i, i).map(|c| c.visited_count), Some(1));
        }
        assert_eq!(grid.cell(6, 6).map(|c| c.visited_count), Some(0));
    }

    #[test]
    fn steep_ray_reaches_target_row() {
        let mut grid = OccupancyGrid::new(20, 1.0);
        grid.trace_ray((5, 2), (7, 12));
        let marked: u32 = (0..20)
            .flat_map(|x| (0..20).map(move |y| (x, y)))
            .filter_map(|(x, y)| grid.cell(x, y).map(|c| c.visited_count))
            .sum();
        // One mark per major-axis step.
        assert_eq!(marked, 10);
        assert_eq!(grid.cell(7, 12).map(|c| c.visited_count), Some(0));
    }

    #[test]
    fn out_of_range_reading_only_marks_robot_cell() {
        let mut grid = OccupancyGrid::new(100, 10.0);
        grid.integrate(&obs((0, 0), (450, 0), 450.0), 400.0);
        assert_eq!(grid.cell(50, 50).map(|c| c.visited_count), Some(1));
        assert_eq!(grid.cell(95, 50).map(|c| c.occupied_count), Some(0));
        assert_eq!(grid.cell(51, 50).map(|c| c.visited_count), Some(0));
    }

    #[test]
    fn out_of_bounds_obstacle_is_clipped() {
        let mut grid = OccupancyGrid::new(10, 10.0);
        // Obstacle far off the east edge; only in-grid cells are carved.
        grid.integrate(&obs((0, 0), (300, 0), 300.0), 400.0);
        assert_eq!(grid.cell(9, 5).map(|c| c.visited_count), Some(1));
        assert!(grid.cell(35, 5).is_none());
        let snap = grid.snapshot(3);
        assert!(snap.grid.iter().flatten().all(|&v| v != 1));
    }

    #[test]
    fn coverage_stays_in_percent_range() {
        let mut grid = OccupancyGrid::new(10, 10.0);
        grid.integrate(&obs((0, 0), (40, 0), 40.0), 400.0);
        let c = grid.coverage();
        assert!(c > 0.0 && c <= 100.0);
        // Robot cell, three carved cells, one obstacle cell.
        assert!((c - 5.0).abs() < 1e-9);
    }

    #[test]
    fn clear_zeroes_all_cells() {
        let mut grid = OccupancyGrid::new(10, 10.0);
        grid.integrate(&obs((0, 0), (20, 20), 28.0), 400.0);
        grid.clear();
        assert_eq!(grid.coverage(), 0.0);
    }
}
