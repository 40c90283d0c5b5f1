//! Local boundary of walls around an agent
//!
//! Caches the closest navmesh wall segments so the avoidance solver does
//! not have to query the mesh every tick.

use navcrowd_common::{Result, Vec3, dist_point_segment_sqr_2d, dist_sqr_2d};
use navcrowd_query::PolyRef;

use crate::NavQueryContext;

const MAX_LOCAL_SEGS: usize = 8;
const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    start: Vec3,
    end: Vec3,
    /// Squared distance from the boundary center, used for pruning
    d: f32,
}

/// Wall segments near an agent, closest first
#[derive(Debug, Clone, Default)]
pub struct LocalBoundary {
    center: Option<Vec3>,
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the cached segments; the next check forces an update
    pub fn reset(&mut self) {
        self.center = None;
        self.segs.clear();
        self.polys.clear();
    }

    /// Collects walls within `collision_query_range` of `pos`
    pub fn update(
        &mut self,
        poly_ref: PolyRef,
        pos: Vec3,
        collision_query_range: f32,
        nav: &NavQueryContext,
    ) -> Result<()> {
        if !poly_ref.is_valid() {
            self.reset();
            return Ok(());
        }

        self.center = Some(pos);
        self.segs.clear();

        // First query non-overlapping polygons
        self.polys = nav.query().find_local_neighbourhood(
            poly_ref,
            pos,
            collision_query_range,
            nav.filter(),
            MAX_LOCAL_POLYS,
        )?;

        // Secondly, store all polygon edges
        let range_sqr = collision_query_range * collision_query_range;
        for &poly in &self.polys {
            let walls = nav.query().get_poly_wall_segments(poly, nav.filter())?;
            for (start, end) in walls {
                let (dist_sqr, _) = dist_point_segment_sqr_2d(&pos, &start, &end);
                if dist_sqr > range_sqr {
                    continue;
                }
                insert_segment(&mut self.segs, Segment { start, end, d: dist_sqr });
            }
        }

        Ok(())
    }

    /// True when every cached polygon still passes the filter
    pub fn is_valid(&self, nav: &NavQueryContext) -> bool {
        !self.polys.is_empty() && self.polys.iter().all(|&r| nav.is_valid(r))
    }

    /// True if the boundary was never computed or `pos` moved more than
    /// `threshold` away from where it was
    pub fn needs_update(&self, pos: Vec3, threshold: f32) -> bool {
        self.center
            .is_none_or(|c| dist_sqr_2d(&c, &pos) > threshold * threshold)
    }

    /// Position the boundary was computed around
    pub fn center(&self) -> Option<Vec3> {
        self.center
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    /// Iterates the cached segments, closest first
    pub fn segments(&self) -> impl Iterator<Item = (Vec3, Vec3)> + '_ {
        self.segs.iter().map(|s| (s.start, s.end))
    }
}

fn insert_segment(segs: &mut Vec<Segment>, seg: Segment) {
    let at = segs.iter().position(|s| seg.d <= s.d).unwrap_or(segs.len());
    if at >= MAX_LOCAL_SEGS {
        return;
    }
    segs.insert(at, seg);
    segs.truncate(MAX_LOCAL_SEGS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use navcrowd_query::test_mesh_helpers::{create_corner_mesh, create_square_mesh};
    use navcrowd_query::{PolyFlags, PolyMeshQuery};

    #[test]
    fn test_boundary_collects_nearby_walls() -> Result<()> {
        let mesh = create_square_mesh(5.0, 1)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let (r, pos) = nav.find_nearest(Vec3::new(4.0, 0.0, 0.0)).expect("on mesh");

        let mut boundary = LocalBoundary::new();
        boundary.update(r, pos, 2.0, &nav)?;

        // Only the wall at x = 5 is within range
        assert_eq!(boundary.segment_count(), 1);
        let (a, b) = boundary.segments().next().expect("one wall");
        assert!((a.x - 5.0).abs() < 1e-5 && (b.x - 5.0).abs() < 1e-5);
        assert!(boundary.is_valid(&nav));
        Ok(())
    }

    #[test]
    fn test_boundary_sorted_by_distance() -> Result<()> {
        let mesh = create_corner_mesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let pos = Vec3::new(3.0, 0.0, 0.5);
        let (r, _) = nav.find_nearest(pos).expect("on mesh");

        let mut boundary = LocalBoundary::new();
        boundary.update(r, pos, 10.0, &nav)?;

        let dists: Vec<f32> = boundary
            .segments()
            .map(|(a, b)| dist_point_segment_sqr_2d(&pos, &a, &b).0)
            .collect();
        assert!(!dists.is_empty());
        assert!(dists.len() <= MAX_LOCAL_SEGS);
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
        Ok(())
    }

    #[test]
    fn test_boundary_needs_update() -> Result<()> {
        let mesh = create_square_mesh(5.0, 1)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let (r, pos) = nav.find_nearest(Vec3::ZERO).expect("on mesh");

        let mut boundary = LocalBoundary::new();
        assert!(boundary.needs_update(pos, 1.0));
        boundary.update(r, pos, 4.0, &nav)?;
        assert!(!boundary.needs_update(pos + Vec3::new(0.5, 0.0, 0.0), 1.0));
        assert!(boundary.needs_update(pos + Vec3::new(1.5, 0.0, 0.0), 1.0));

        boundary.update(PolyRef::NULL, pos, 4.0, &nav)?;
        assert_eq!(boundary.segment_count(), 0);
        assert!(!boundary.is_valid(&nav));
        Ok(())
    }

    #[test]
    fn test_boundary_invalidated_by_filter() -> Result<()> {
        let mesh = create_square_mesh(5.0, 2)?;
        let query = PolyMeshQuery::new(&mesh);
        let mut nav = NavQueryContext::new(&query, Vec3::ONE);
        let (r, pos) = nav.find_nearest(Vec3::new(-1.0, 0.0, -1.0)).expect("on mesh");

        let mut boundary = LocalBoundary::new();
        boundary.update(r, pos, 3.0, &nav)?;
        assert!(boundary.is_valid(&nav));

        nav.filter_mut().exclude_flags = PolyFlags::WALK;
        assert!(!boundary.is_valid(&nav));
        Ok(())
    }
}
