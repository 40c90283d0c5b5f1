//! Path corridor for smooth path following
//!
//! A corridor is the window of polygons between an agent's position and
//! its target. The first polygon always contains the agent; it is consumed
//! from the front as the agent advances and only regrows on replanning.

use log::debug;
use navcrowd_common::{Error, Result, Vec3, dist_sqr_2d};
use navcrowd_query::{PolyRef, StraightPathFlags, StraightPathPoint};

use crate::NavQueryContext;

/// Default maximum number of polygons in a path corridor
pub const MAX_PATH_POLYS: usize = 256;

/// Maximum number of polygons a single surface move may visit
const MAX_VISITED: usize = 16;

/// Corners closer than this to the agent are dropped
const MIN_TARGET_DIST: f32 = 0.01;

/// Maximum size of a local topology replan
const MAX_TOPOLOGY_RES: usize = 32;

/// How [`PathCorridor::move_position`] reconciled the agent position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorridorMove {
    /// Moved along the corridor surface
    Moved,
    /// The head polygon was no longer usable and the agent was snapped
    /// onto the nearest polygon
    Snapped,
}

/// Path corridor for smooth path following
#[derive(Debug, Clone)]
pub struct PathCorridor {
    /// Current position in the corridor
    pos: Vec3,
    /// Target position in the corridor
    target: Vec3,
    /// Path polygon references
    path: Vec<PolyRef>,
    /// Capacity of the path buffer
    max_path: usize,
    /// False once the corridor no longer describes a route from `pos`
    valid: bool,
}

impl Default for PathCorridor {
    fn default() -> Self {
        Self::new()
    }
}

impl PathCorridor {
    /// Creates a new path corridor with the default capacity
    pub fn new() -> Self {
        let mut corridor = Self {
            pos: Vec3::ZERO,
            target: Vec3::ZERO,
            path: Vec::new(),
            max_path: MAX_PATH_POLYS,
            valid: true,
        };
        corridor.init(MAX_PATH_POLYS);
        corridor
    }

    /// Allocates the corridor's path buffer
    pub fn init(&mut self, max_path: usize) {
        self.max_path = max_path.max(1);
        self.path = Vec::with_capacity(self.max_path);
    }

    /// Resets the corridor to a single polygon at `pos`
    pub fn reset(&mut self, poly_ref: PolyRef, pos: Vec3) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if poly_ref.is_valid() {
            self.path.push(poly_ref);
        }
        self.valid = true;
    }

    /// Replaces the path after a planning query, truncating it to capacity
    pub fn set_corridor(&mut self, target: Vec3, path: &[PolyRef]) {
        self.target = target;
        self.path.clear();
        self.path
            .extend(path.iter().copied().take(self.max_path));
        self.valid = true;
    }

    /// Finds the next straight path corners, at most `max_corners`.
    ///
    /// Corners closer than a small threshold are skipped and the list
    /// stops at the first off-mesh connection.
    pub fn find_corners(
        &self,
        max_corners: usize,
        nav: &NavQueryContext,
    ) -> Result<Vec<StraightPathPoint>> {
        if self.path.is_empty() || max_corners == 0 {
            return Ok(Vec::new());
        }

        let mut corners =
            nav.query()
                .find_straight_path(self.pos, self.target, &self.path, max_corners)?;

        // Prune points in the beginning of the path which are too close
        let skip = corners
            .iter()
            .take_while(|c| {
                !c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                    && dist_sqr_2d(&c.pos, &self.pos) <= MIN_TARGET_DIST * MIN_TARGET_DIST
            })
            .count();
        corners.drain(..skip);

        // Prune points after an off-mesh connection
        if let Some(i) = corners
            .iter()
            .position(|c| c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
        {
            corners.truncate(i + 1);
        }

        Ok(corners)
    }

    /// Shortcuts the corridor towards `next` if the surface between the
    /// agent and a point up to `range` ahead is unobstructed.
    pub fn optimize_path_visibility(&mut self, next: Vec3, range: f32, nav: &NavQueryContext) {
        let Some(&first) = self.path.first() else {
            return;
        };

        // Clamp the ray to max distance
        let mut dist = dist_sqr_2d(&self.pos, &next).sqrt();

        // If too close to the goal, do not try to optimize
        if dist < 0.01 {
            return;
        }

        // Overshoot a little
        dist = (dist + 0.01).min(range);

        // Adjust ray length
        let delta = next - self.pos;
        let goal = self.pos + delta * (range / dist);

        let Ok(hit) = nav.query().raycast(first, self.pos, goal, nav.filter()) else {
            return;
        };
        if hit.path.len() > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &hit.path);
        }
    }

    /// Replans locally from the head of the corridor and splices the
    /// result in when it shortens the route. Returns true if a replan ran.
    pub fn optimize_path_topology(&mut self, nav: &NavQueryContext) -> bool {
        if self.path.len() < 3 {
            return false;
        }
        let (Some(&first), Some(&last)) = (self.path.first(), self.path.last()) else {
            return false;
        };

        match nav.query().find_path(
            first,
            last,
            self.pos,
            self.target,
            nav.filter(),
            MAX_TOPOLOGY_RES,
        ) {
            Ok(res) if !res.is_empty() => {
                merge_corridor_start_shortcut(&mut self.path, self.max_path, &res);
                true
            }
            _ => false,
        }
    }

    /// Advances the corridor over the off-mesh connection `con_ref`.
    ///
    /// Returns the connection's start and end positions; the corridor
    /// position is moved to the end.
    pub fn move_over_offmesh_connection(
        &mut self,
        con_ref: PolyRef,
        nav: &NavQueryContext,
    ) -> Result<(Vec3, Vec3)> {
        let idx = self
            .path
            .iter()
            .position(|&r| r == con_ref)
            .ok_or_else(|| Error::InvalidParam("off-mesh connection not in corridor".into()))?;
        if idx + 1 >= self.path.len() {
            return Err(Error::InvalidParam(
                "off-mesh connection has no landing polygon".into(),
            ));
        }
        let prev = if idx > 0 { self.path[idx - 1] } else { PolyRef::NULL };
        let (start, end) = nav
            .query()
            .get_off_mesh_connection_end_points(prev, con_ref)?;

        // Prune path
        self.path.drain(..=idx);
        self.pos = end;
        Ok((start, end))
    }

    /// Moves the agent along the corridor to `npos`.
    ///
    /// Passed polygons are dropped from the front of the corridor and the
    /// position is kept on the surface. If the head polygon is no longer
    /// usable the agent is snapped onto the nearest polygon; when none is
    /// found the corridor becomes invalid and `CorridorDesync` is returned.
    pub fn move_position(&mut self, npos: Vec3, nav: &NavQueryContext) -> Result<CorridorMove> {
        let Some(&first) = self.path.first() else {
            return Err(Error::CorridorDesync("empty corridor".into()));
        };

        match nav
            .query()
            .move_along_surface(first, self.pos, npos, nav.filter(), MAX_VISITED)
        {
            Ok((mut result, visited)) => {
                merge_corridor_start_moved(&mut self.path, self.max_path, &visited);

                // Adjust the position to stay on top of the navmesh
                if let Ok(h) = nav.query().get_poly_height(self.path[0], result) {
                    result.y = h;
                }
                self.pos = result;
                Ok(CorridorMove::Moved)
            }
            Err(err) => match nav.find_nearest(npos) {
                Some((safe_ref, safe_pos)) => {
                    debug!("Corridor head lost ({}), snapped to {:?}", err, safe_ref);
                    self.fix_path_start(safe_ref, safe_pos);
                    Ok(CorridorMove::Snapped)
                }
                None => {
                    self.valid = false;
                    Err(Error::CorridorDesync(format!(
                        "no polygon near {:?}",
                        npos
                    )))
                }
            },
        }
    }

    /// Moves the target along the surface, extending the corridor end.
    /// Returns false if the move was not possible.
    pub fn move_target_position(&mut self, npos: Vec3, nav: &NavQueryContext) -> bool {
        let Some(&last) = self.path.last() else {
            return false;
        };
        match nav
            .query()
            .move_along_surface(last, self.target, npos, nav.filter(), MAX_VISITED)
        {
            Ok((result, visited)) => {
                merge_corridor_end_moved(&mut self.path, self.max_path, &visited);
                self.target = result;
                true
            }
            Err(_) => false,
        }
    }

    /// Replaces the head of the corridor with a known good polygon.
    ///
    /// The rest of the path is kept but the corridor is flagged invalid,
    /// since the new head may not connect to it.
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: Vec3) {
        self.pos = safe_pos;
        match self.path.first_mut() {
            Some(first) => *first = safe_ref,
            None => self.path.push(safe_ref),
        }
        self.valid = false;
    }

    /// Keeps the valid prefix of the corridor and clamps the target onto
    /// its last polygon.
    pub fn trim_invalid_path(&mut self, safe_ref: PolyRef, safe_pos: Vec3, nav: &NavQueryContext) {
        let n = self.path.iter().take_while(|&&r| nav.is_valid(r)).count();
        if n == self.path.len() {
            return;
        }
        if n == 0 {
            // The first polyref is bad, use current safe values
            self.pos = safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            self.path.truncate(n);
        }

        if let Some(&last) = self.path.last() {
            if let Ok(t) = nav.query().closest_point_on_poly_boundary(last, self.target) {
                self.target = t;
            }
        }
    }

    /// Checks that the first `max_look_ahead` polygons still pass the filter
    pub fn is_valid(&self, max_look_ahead: usize, nav: &NavQueryContext) -> bool {
        self.valid
            && self
                .path
                .iter()
                .take(max_look_ahead)
                .all(|&r| nav.is_valid(r))
    }

    /// Current position in the corridor
    pub fn pos(&self) -> Vec3 {
        self.pos
    }

    /// Target position of the corridor
    pub fn target(&self) -> Vec3 {
        self.target
    }

    /// The polygon containing the agent
    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or_default()
    }

    /// The polygon containing the target
    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or_default()
    }

    /// The corridor polygons
    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    /// Number of polygons in the corridor
    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    /// Capacity of the corridor
    pub fn max_path(&self) -> usize {
        self.max_path
    }
}

/// Furthest polygon shared by `path` and `visited`, searching the path
/// from its end. Returns indices into both.
fn furthest_common_from_end(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    for (i, p) in path.iter().enumerate().rev() {
        // Earliest visit of this polygon
        if let Some(j) = visited.iter().position(|v| v == p) {
            return Some((i, j));
        }
    }
    None
}

/// Merges the polygons visited while moving the start of the corridor
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((furthest_path, furthest_visited)) = furthest_common_from_end(path, visited) else {
        return;
    };

    // Visited polygons, newest first, followed by the unvisited tail
    let mut merged: Vec<PolyRef> = visited[furthest_visited..].iter().rev().copied().collect();
    merged.truncate(max_path);
    let room = max_path - merged.len();
    merged.extend(path.iter().skip(furthest_path + 1).take(room));
    *path = merged;
}

/// Merges the polygons visited while moving the end of the corridor
pub fn merge_corridor_end_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    // Furthest common polygon, searching from the start of the path
    let found = path
        .iter()
        .enumerate()
        .find_map(|(i, p)| visited.iter().position(|v| v == p).map(|j| (i, j)));
    let Some((furthest_path, furthest_visited)) = found else {
        return;
    };

    let ppos = furthest_path + 1;
    let room = max_path.saturating_sub(ppos);
    path.truncate(ppos);
    path.extend(visited.iter().skip(furthest_visited + 1).take(room));
}

/// Merges a shortcut found from the start of the corridor
pub fn merge_corridor_start_shortcut(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((furthest_path, furthest_visited)) = furthest_common_from_end(path, visited) else {
        return;
    };
    if furthest_visited == 0 {
        return;
    }

    let mut merged: Vec<PolyRef> = visited[..furthest_visited].to_vec();
    merged.truncate(max_path);
    let room = max_path - merged.len();
    merged.extend(path.iter().skip(furthest_path).take(room));
    *path = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use navcrowd_query::test_mesh_helpers::{
        create_corner_mesh, create_islands_with_offmesh, create_square_mesh,
    };
    use navcrowd_query::{PolyFlags, PolyMeshQuery};

    fn refs(ids: &[u32]) -> Vec<PolyRef> {
        ids.iter().map(|&i| PolyRef::new(i)).collect()
    }

    #[test]
    fn test_reset_corridor() {
        let mut corridor = PathCorridor::new();
        let start_pos = Vec3::new(10.0, 5.0, 10.0);
        corridor.reset(PolyRef::new(42), start_pos);

        assert_eq!(corridor.pos(), start_pos);
        assert_eq!(corridor.target(), start_pos);
        assert_eq!(corridor.path(), &[PolyRef::new(42)]);

        corridor.reset(PolyRef::NULL, start_pos);
        assert_eq!(corridor.path_count(), 0);
    }

    #[test]
    fn test_set_corridor_truncates() {
        let mut corridor = PathCorridor::new();
        corridor.init(4);
        corridor.set_corridor(Vec3::ONE, &refs(&[1, 2, 3, 4, 5, 6]));
        assert_eq!(corridor.path(), &refs(&[1, 2, 3, 4])[..]);
        assert_eq!(corridor.target(), Vec3::ONE);
    }

    #[test]
    fn test_merge_start_moved() {
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[1, 2]));
        assert_eq!(path, refs(&[2, 3]));

        // Moving backwards regrows the head
        let mut path = refs(&[2, 3]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[2, 1]));
        assert_eq!(path, refs(&[1, 2, 3]));

        // Nothing in common leaves the path untouched
        let mut path = refs(&[2, 3]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[7, 8]));
        assert_eq!(path, refs(&[2, 3]));
    }

    #[test]
    fn test_merge_end_moved_and_shortcut() {
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_end_moved(&mut path, 256, &refs(&[3, 4, 5]));
        assert_eq!(path, refs(&[1, 2, 3, 4, 5]));

        let mut path = refs(&[1, 4, 5, 6, 3]);
        merge_corridor_start_shortcut(&mut path, 256, &refs(&[1, 2, 3]));
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_find_corners_on_corner_mesh() -> Result<()> {
        let mesh = create_corner_mesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);

        let mut corridor = PathCorridor::new();
        corridor.reset(PolyRef::new(1), Vec3::new(0.5, 0.0, 0.5));
        corridor.set_corridor(Vec3::new(3.0, 0.0, 3.5), &refs(&[1, 2, 3]));

        let corners = corridor.find_corners(4, &nav)?;
        assert_eq!(corners.len(), 2);
        assert!((corners[0].pos - Vec3::new(2.0, 0.0, 2.0)).length() < 1e-4);
        assert!(corners[1].flags.contains(StraightPathFlags::END));
        for c in &corners {
            assert!(corridor.path().contains(&c.poly));
        }

        let limited = corridor.find_corners(1, &nav)?;
        assert!(limited.len() <= 1);
        Ok(())
    }

    #[test]
    fn test_move_position_consumes_corridor() -> Result<()> {
        let mesh = create_corner_mesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);

        let mut corridor = PathCorridor::new();
        corridor.reset(PolyRef::new(1), Vec3::new(1.5, 0.0, 1.0));
        corridor.set_corridor(Vec3::new(3.0, 0.0, 3.5), &refs(&[1, 2, 3]));

        let moved = corridor.move_position(Vec3::new(2.5, 0.0, 1.0), &nav)?;
        assert_eq!(moved, CorridorMove::Moved);
        assert_eq!(corridor.path(), &refs(&[2, 3])[..]);
        assert!((corridor.pos() - Vec3::new(2.5, 0.0, 1.0)).length() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_move_position_is_idempotent() -> Result<()> {
        let mesh = create_corner_mesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);

        let mut corridor = PathCorridor::new();
        corridor.reset(PolyRef::new(1), Vec3::new(0.5, 0.0, 0.5));
        corridor.set_corridor(Vec3::new(3.0, 0.0, 3.5), &refs(&[1, 2, 3]));

        let target = Vec3::new(1.2, 0.0, 0.9);
        corridor.move_position(target, &nav)?;
        let pos = corridor.pos();
        let path = corridor.path().to_vec();
        let corners = corridor.find_corners(4, &nav)?;

        for _ in 0..3 {
            corridor.move_position(target, &nav)?;
            assert_eq!(corridor.pos(), pos);
            assert_eq!(corridor.path(), &path[..]);
            assert_eq!(corridor.find_corners(4, &nav)?, corners);
        }
        Ok(())
    }

    #[test]
    fn test_move_position_snaps_when_head_invalid() -> Result<()> {
        let mut mesh = create_corner_mesh()?;
        mesh.set_poly_flags(PolyRef::new(1), PolyFlags::WALK | PolyFlags::DISABLED)?;
        let query = PolyMeshQuery::new(&mesh);
        let mut nav = NavQueryContext::new(&query, Vec3::new(0.5, 0.5, 0.5));
        nav.filter_mut().exclude_flags = PolyFlags::DISABLED;

        let mut corridor = PathCorridor::new();
        corridor.reset(PolyRef::new(1), Vec3::new(1.9, 0.0, 1.0));
        assert!(!corridor.is_valid(10, &nav));

        let moved = corridor.move_position(Vec3::new(1.95, 0.0, 1.0), &nav)?;
        assert_eq!(moved, CorridorMove::Snapped);
        assert_eq!(corridor.first_poly(), PolyRef::new(2));
        assert!((corridor.pos() - Vec3::new(2.0, 0.0, 1.0)).length() < 1e-5);

        // Too far from any usable polygon
        let mut lost = PathCorridor::new();
        lost.reset(PolyRef::new(1), Vec3::new(0.2, 0.0, 1.0));
        let err = lost.move_position(Vec3::new(0.2, 0.0, 1.0), &nav);
        assert!(matches!(err, Err(Error::CorridorDesync(_))));
        assert!(!lost.is_valid(10, &nav));
        Ok(())
    }

    #[test]
    fn test_optimize_path_visibility_shortcuts() -> Result<()> {
        let mesh = create_square_mesh(3.0, 3)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);

        let mut corridor = PathCorridor::new();
        corridor.reset(PolyRef::new(1), Vec3::new(-2.0, 0.0, -2.0));
        corridor.set_corridor(Vec3::new(2.0, 0.0, -2.0), &refs(&[1, 4, 5, 6, 3]));

        corridor.optimize_path_visibility(Vec3::new(2.0, 0.0, -2.0), 4.0, &nav);
        assert_eq!(corridor.path(), &refs(&[1, 2, 3])[..]);
        Ok(())
    }

    #[test]
    fn test_optimize_path_topology() -> Result<()> {
        let mesh = create_square_mesh(3.0, 3)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);

        let mut corridor = PathCorridor::new();
        corridor.reset(PolyRef::new(1), Vec3::new(-2.0, 0.0, -2.0));
        corridor.set_corridor(Vec3::new(2.0, 0.0, -2.0), &refs(&[1, 4, 5, 6, 3]));

        assert!(corridor.optimize_path_topology(&nav));
        assert_eq!(corridor.path(), &refs(&[1, 2, 3])[..]);
        Ok(())
    }

    #[test]
    fn test_move_over_offmesh_connection() -> Result<()> {
        let mesh = create_islands_with_offmesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);

        let mut corridor = PathCorridor::new();
        corridor.reset(PolyRef::new(2), Vec3::new(-1.6, 0.0, 0.0));
        corridor.set_corridor(Vec3::new(6.0, 0.0, 0.0), &refs(&[2, 5, 3, 4]));

        let corners = corridor.find_corners(4, &nav)?;
        assert_eq!(corners.len(), 1);
        assert!(corners[0].flags.contains(StraightPathFlags::OFFMESH_CONNECTION));

        let (start, end) = corridor.move_over_offmesh_connection(PolyRef::new(5), &nav)?;
        assert!((start - Vec3::new(-1.5, 0.0, 0.0)).length() < 1e-5);
        assert!((end - Vec3::new(2.5, 0.0, 0.0)).length() < 1e-5);
        assert_eq!(corridor.path(), &refs(&[3, 4])[..]);
        assert_eq!(corridor.pos(), end);

        assert!(corridor.move_over_offmesh_connection(PolyRef::new(5), &nav).is_err());
        Ok(())
    }

    #[test]
    fn test_trim_invalid_path_and_target_move() -> Result<()> {
        let mut mesh = create_corner_mesh()?;
        mesh.set_poly_flags(PolyRef::new(3), PolyFlags::WALK | PolyFlags::DISABLED)?;
        let query = PolyMeshQuery::new(&mesh);
        let mut nav = NavQueryContext::new(&query, Vec3::ONE);
        nav.filter_mut().exclude_flags = PolyFlags::DISABLED;

        let mut corridor = PathCorridor::new();
        corridor.reset(PolyRef::new(1), Vec3::new(0.5, 0.0, 0.5));
        corridor.set_corridor(Vec3::new(3.0, 0.0, 3.5), &refs(&[1, 2, 3]));
        assert!(!corridor.is_valid(10, &nav));
        assert!(corridor.is_valid(2, &nav));

        corridor.trim_invalid_path(PolyRef::new(1), Vec3::new(0.5, 0.0, 0.5), &nav);
        assert_eq!(corridor.path(), &refs(&[1, 2])[..]);
        assert!((corridor.target() - Vec3::new(3.0, 0.0, 2.0)).length() < 1e-5);

        // Drift the target back along the surface
        assert!(corridor.move_target_position(Vec3::new(3.0, 0.0, 1.0), &nav));
        assert!((corridor.target() - Vec3::new(3.0, 0.0, 1.0)).length() < 1e-5);
        assert_eq!(corridor.path(), &refs(&[1, 2])[..]);
        Ok(())
    }
}
