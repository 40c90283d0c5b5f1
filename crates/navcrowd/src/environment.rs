//! Per-agent view of its surroundings for one tick
//!
//! Every agent's environment is gathered from the same pre-tick snapshot,
//! so the order in which agents are visited cannot change the result.

use navcrowd_common::{Vec3, dist_sqr_2d};

use crate::proximity_grid::ProximityGrid;
use crate::{AgentId, CrowdAgentState};

/// The maximum number of neighbours an agent takes into account for
/// steering decisions
pub const MAX_NEIGHBOURS: usize = 6;

/// Read-only copy of an agent's kinematic state taken before a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub pos: Vec3,
    pub vel: Vec3,
    /// Desired velocity from the previous tick
    pub dvel: Vec3,
    pub radius: f32,
    pub height: f32,
    pub state: CrowdAgentState,
}

/// A neighbouring agent and its squared 2D distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    pub agent: AgentId,
    pub dist: f32,
}

/// Neighbours and nearby walls of one agent
#[derive(Debug, Clone, Default)]
pub struct Environment {
    neighbours: Vec<Neighbour>,
    walls: Vec<(Vec3, Vec3)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes the neighbour list of `agent` from `grid`.
    ///
    /// Agents are neighbours when they are within `range` on the xz plane
    /// and their vertical extents overlap. At most [`MAX_NEIGHBOURS`] are
    /// kept, closest first.
    pub fn gather_neighbours(
        &mut self,
        agent: &AgentSnapshot,
        range: f32,
        grid: &ProximityGrid,
        snapshots: &[Option<AgentSnapshot>],
    ) {
        self.neighbours.clear();
        let range_sqr = range * range;

        for item in grid.query_agents(agent.pos, range) {
            if item.id == agent.id {
                continue;
            }
            let Some(other) = snapshots.get(item.id).and_then(Option::as_ref) else {
                continue;
            };

            // Check for overlap
            let dy = (agent.pos.y - other.pos.y).abs();
            if dy >= (agent.height + other.height) / 2.0 {
                continue;
            }
            let dist = dist_sqr_2d(&agent.pos, &other.pos);
            if dist > range_sqr {
                continue;
            }
            add_neighbour(&mut self.neighbours, Neighbour { agent: other.id, dist });
        }
    }

    /// Replaces the wall segments
    pub fn set_walls(&mut self, walls: impl IntoIterator<Item = (Vec3, Vec3)>) {
        self.walls.clear();
        self.walls.extend(walls);
    }

    pub fn clear(&mut self) {
        self.neighbours.clear();
        self.walls.clear();
    }

    /// Neighbours sorted by ascending distance
    pub fn neighbours(&self) -> &[Neighbour] {
        &self.neighbours
    }

    /// Nearby wall segments, closest first
    pub fn walls(&self) -> &[(Vec3, Vec3)] {
        &self.walls
    }
}

/// Sorted insert that drops anything past [`MAX_NEIGHBOURS`].
/// Equal distances keep their arrival order.
fn add_neighbour(neis: &mut Vec<Neighbour>, nei: Neighbour) {
    let at = neis
        .iter()
        .position(|n| nei.dist < n.dist)
        .unwrap_or(neis.len());
    if at >= MAX_NEIGHBOURS {
        return;
    }
    neis.insert(at, nei);
    neis.truncate(MAX_NEIGHBOURS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proximity_grid::GridAgent;

    fn snapshot(id: AgentId, x: f32, y: f32, z: f32) -> AgentSnapshot {
        AgentSnapshot {
            id,
            pos: Vec3::new(x, y, z),
            vel: Vec3::ZERO,
            dvel: Vec3::ZERO,
            radius: 0.5,
            height: 2.0,
            state: CrowdAgentState::Walking,
        }
    }

    fn build(snaps: &[Option<AgentSnapshot>]) -> ProximityGrid {
        let mut grid = ProximityGrid::new(1.5);
        for s in snaps.iter().flatten() {
            grid.add_agent(GridAgent { id: s.id, pos: s.pos, radius: s.radius });
        }
        grid
    }

    #[test]
    fn test_neighbours_sorted_and_capped() {
        let snaps: Vec<Option<AgentSnapshot>> = (0..10)
            .map(|i| Some(snapshot(i, i as f32 * 0.5, 0.0, 0.0)))
            .collect();
        let grid = build(&snaps);

        let mut env = Environment::new();
        let me = snaps[0].expect("agent 0");
        env.gather_neighbours(&me, 10.0, &grid, &snaps);

        let ids: Vec<AgentId> = env.neighbours().iter().map(|n| n.agent).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        assert!(env.neighbours().windows(2).all(|w| w[0].dist <= w[1].dist));
    }

    #[test]
    fn test_neighbours_respect_range_and_height() {
        let snaps = vec![
            Some(snapshot(0, 0.0, 0.0, 0.0)),
            Some(snapshot(1, 1.0, 0.0, 0.0)),
            // Above the agent
            Some(snapshot(2, 0.5, 3.0, 0.0)),
            // Out of range
            Some(snapshot(3, 4.0, 0.0, 0.0)),
            None,
        ];
        let grid = build(&snaps);

        let mut env = Environment::new();
        let me = snaps[0].expect("agent 0");
        env.gather_neighbours(&me, 2.0, &grid, &snaps);
        assert_eq!(env.neighbours().len(), 1);
        assert_eq!(env.neighbours()[0].agent, 1);
        assert!((env.neighbours()[0].dist - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_walls_replaced() {
        let mut env = Environment::new();
        env.set_walls([(Vec3::ZERO, Vec3::X)]);
        env.set_walls([(Vec3::Z, Vec3::ONE), (Vec3::X, Vec3::Z)]);
        assert_eq!(env.walls().len(), 2);
        env.clear();
        assert!(env.walls().is_empty());
    }
}
