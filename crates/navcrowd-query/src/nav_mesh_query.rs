//! Query interface over a navigation mesh

use super::{PolyRef, QueryFilter, RaycastHit, StraightPathPoint};
use navcrowd_common::{Result, Vec3};

/// Read-only queries over a walkable polygon surface.
///
/// Implementations must be safe to share between threads: the crowd
/// evaluates agents against the same query concurrently when its
/// `parallel` feature is enabled.
pub trait NavMeshQuery: Send + Sync {
    /// Finds the polygon nearest to `center` within the box
    /// `center ± half_extents`, returning it with the closest point on it.
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Result<(PolyRef, Vec3)>;

    /// Finds a polygon path from `start_ref` to `end_ref`.
    ///
    /// If the end cannot be reached the path leads to the polygon closest
    /// to `end_pos`. The result is truncated to `max_path` polygons.
    fn find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<Vec<PolyRef>>;

    /// Finds the straight-line corners of a polygon path.
    fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>>;

    /// Casts a ray along the surface from `start_pos` towards `end_pos`.
    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit>;

    /// Moves from `start_pos` towards `end_pos` constrained to the surface.
    ///
    /// Returns the reached position and the visited polygons in order,
    /// ending with the polygon containing the result. At most
    /// `max_visited` polygons are searched.
    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<(Vec3, Vec<PolyRef>)>;

    /// Returns true if `poly_ref` exists and passes the filter
    fn is_valid_poly_ref(&self, poly_ref: PolyRef, filter: &QueryFilter) -> bool;

    /// Closest point on or inside the polygon, with surface height
    fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: Vec3) -> Result<Vec3>;

    /// `pos` itself if it is inside the polygon on the xz plane,
    /// otherwise the closest point on its boundary
    fn closest_point_on_poly_boundary(&self, poly_ref: PolyRef, pos: Vec3) -> Result<Vec3>;

    /// Height of the polygon surface under `pos`
    fn get_poly_height(&self, poly_ref: PolyRef, pos: Vec3) -> Result<f32>;

    /// Endpoints of an off-mesh connection, ordered for an agent arriving
    /// from `prev_ref`
    fn get_off_mesh_connection_end_points(
        &self,
        prev_ref: PolyRef,
        con_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)>;

    /// Collects connected polygons within `radius` of `center`
    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>>;

    /// Edges of the polygon that are not shared with a passable neighbour
    fn get_poly_wall_segments(
        &self,
        poly_ref: PolyRef,
        filter: &QueryFilter,
    ) -> Result<Vec<(Vec3, Vec3)>>;
}
