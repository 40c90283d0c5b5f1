//! Spatial hash of agent positions
//!
//! A sparse 2D grid over the xz plane. The crowd rebuilds it from the
//! pre-tick agent snapshot every update, so queries during a tick never see
//! positions written in the same tick.

use std::collections::HashMap;

use navcrowd_common::{Vec3, dist_sqr_2d};

/// Cell size used by `ProximityGrid::default`
const DEFAULT_CELL_SIZE: f32 = 4.0;

/// An agent's footprint in the grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridAgent {
    pub id: usize,
    /// Only x and z are hashed
    pub pos: Vec3,
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GridCoord {
    x: i32,
    z: i32,
}

impl GridCoord {
    fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    fn from_world(x: f32, z: f32, inv_cell_size: f32) -> Self {
        Self {
            x: (x * inv_cell_size).floor() as i32,
            z: (z * inv_cell_size).floor() as i32,
        }
    }
}

/// Sparse grid of agents bucketed by xz cell
#[derive(Debug, Clone)]
pub struct ProximityGrid {
    /// Agents per occupied cell, in insertion order
    cells: HashMap<GridCoord, Vec<GridAgent>>,
    cell_size: f32,
    inv_cell_size: f32,
    agent_count: usize,
}

impl Default for ProximityGrid {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE)
    }
}

impl ProximityGrid {
    /// Creates an empty grid. Cell sizes below 0.1 are raised to 0.1.
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() { cell_size.max(0.1) } else { DEFAULT_CELL_SIZE };
        Self {
            cells: HashMap::new(),
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            agent_count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.agent_count = 0;
    }

    pub fn add_agent(&mut self, agent: GridAgent) {
        let coord = GridCoord::from_world(agent.pos.x, agent.pos.z, self.inv_cell_size);
        self.cells.entry(coord).or_default().push(agent);
        self.agent_count += 1;
    }

    /// Agents whose cells overlap the rectangle `[min_x, max_x] × [min_z, max_z]`.
    ///
    /// Cells are visited row by row so the order is stable between runs.
    /// The work is bounded by the number of occupied cells, however large
    /// the rectangle.
    pub fn query_items(&self, min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> Vec<GridAgent> {
        let lo = GridCoord::from_world(min_x, min_z, self.inv_cell_size);
        let hi = GridCoord::from_world(max_x, max_z, self.inv_cell_size);
        let mut result = Vec::new();

        let span_x = (i64::from(hi.x) - i64::from(lo.x) + 1).max(0);
        let span_z = (i64::from(hi.z) - i64::from(lo.z) + 1).max(0);
        if span_x.saturating_mul(span_z) > self.cells.len() as i64 {
            let mut coords: Vec<GridCoord> = self
                .cells
                .keys()
                .filter(|c| (lo.x..=hi.x).contains(&c.x) && (lo.z..=hi.z).contains(&c.z))
                .copied()
                .collect();
            coords.sort_unstable_by_key(|c| (c.z, c.x));
            for coord in coords {
                if let Some(cell) = self.cells.get(&coord) {
                    result.extend_from_slice(cell);
                }
            }
            return result;
        }

        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                if let Some(cell) = self.cells.get(&GridCoord::new(x, z)) {
                    result.extend_from_slice(cell);
                }
            }
        }
        result
    }

    /// Agents whose centre lies within `range` of `pos` on the xz plane
    pub fn query_agents(&self, pos: Vec3, range: f32) -> Vec<GridAgent> {
        let range_sqr = range * range;
        self.query_items(pos.x - range, pos.z - range, pos.x + range, pos.z + range)
            .into_iter()
            .filter(|a| dist_sqr_2d(&pos, &a.pos) <= range_sqr)
            .collect()
    }

    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    /// Occupied cells
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Occupancy summary
    pub fn stats(&self) -> ProximityGridStats {
        let max_agents_per_cell = self.cells.values().map(Vec::len).max().unwrap_or(0);
        ProximityGridStats {
            total_agents: self.agent_count,
            active_cells: self.cells.len(),
            max_agents_per_cell,
            avg_agents_per_cell: if self.cells.is_empty() {
                0.0
            } else {
                self.agent_count as f32 / self.cells.len() as f32
            },
            cell_size: self.cell_size,
        }
    }
}

/// Grid occupancy, for tuning the cell size
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityGridStats {
    pub total_agents: usize,
    pub active_cells: usize,
    pub max_agents_per_cell: usize,
    /// Mean over occupied cells
    pub avg_agents_per_cell: f32,
    pub cell_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: usize, x: f32, z: f32) -> GridAgent {
        GridAgent {
            id,
            pos: Vec3::new(x, 0.0, z),
            radius: 0.5,
        }
    }

    #[test]
    fn test_grid_coord_from_world() {
        let coord = GridCoord::from_world(4.5, 7.2, 0.5);
        assert_eq!(coord, GridCoord::new(2, 3));

        let coord = GridCoord::from_world(-1.5, -3.7, 0.5);
        assert_eq!(coord, GridCoord::new(-1, -2));
    }

    #[test]
    fn test_proximity_grid_basic() {
        let mut grid = ProximityGrid::new(2.0);
        grid.add_agent(agent(1, 1.0, 1.0));
        grid.add_agent(agent(2, 3.0, 3.0));
        grid.add_agent(agent(3, 10.0, 10.0));
        assert_eq!(grid.agent_count(), 3);

        let near: Vec<usize> = grid
            .query_agents(Vec3::new(1.0, 0.0, 1.0), 3.0)
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(near, vec![1, 2]);

        grid.clear();
        assert_eq!(grid.agent_count(), 0);
        assert!(grid.query_agents(Vec3::new(1.0, 0.0, 1.0), 3.0).is_empty());
    }

    #[test]
    fn test_crowded_cell_keeps_every_agent() {
        let mut grid = ProximityGrid::new(4.0);
        for i in 0..100 {
            grid.add_agent(agent(i, 1.0 + i as f32 * 0.01, 1.0));
        }
        let stats = grid.stats();
        assert_eq!(stats.active_cells, 1);
        assert_eq!(stats.max_agents_per_cell, 100);
        assert_eq!(grid.query_agents(Vec3::new(1.5, 0.0, 1.0), 2.0).len(), 100);
    }

    #[test]
    fn test_query_order_is_stable() {
        let mut grid = ProximityGrid::new(1.0);
        for (i, (x, z)) in [(0.5, 0.5), (-0.5, 0.5), (0.5, -0.5), (-0.5, -0.5)]
            .iter()
            .enumerate()
        {
            grid.add_agent(agent(i, *x, *z));
        }
        let ids: Vec<usize> = grid
            .query_items(-1.0, -1.0, 1.0, 1.0)
            .iter()
            .map(|a| a.id)
            .collect();
        // Row by row, lowest z first
        assert_eq!(ids, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_huge_range_scans_occupied_cells() {
        let mut grid = ProximityGrid::new(1.0);
        for (i, (x, z)) in [(0.5, 0.5), (-0.5, 0.5), (0.5, -0.5), (-0.5, -0.5), (900.0, -900.0)]
            .iter()
            .enumerate()
        {
            grid.add_agent(agent(i, *x, *z));
        }

        let ids: Vec<usize> = grid
            .query_agents(Vec3::ZERO, 1.0e6)
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![4, 3, 2, 1, 0]);

        // Same order as a plain scan of a small rectangle
        let small: Vec<usize> = grid
            .query_items(-0.5, -0.5, 0.5, 0.5)
            .iter()
            .map(|a| a.id)
            .collect();
        let large: Vec<usize> = grid
            .query_items(-0.5, -0.5, 1.0e4, 0.5)
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(small, vec![3, 2, 1, 0]);
        assert_eq!(small, large);

        assert_eq!(grid.query_agents(Vec3::ZERO, f32::MAX).len(), 5);
    }
}
