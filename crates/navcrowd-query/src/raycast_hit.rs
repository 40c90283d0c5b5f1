//! Raycast hit information

use super::PolyRef;
use navcrowd_common::Vec3;

/// Result of casting a ray along the navigation surface
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// The hit parameter along the ray.
    /// Set to `f32::MAX` if the ray end lies on the surface without hitting a wall
    pub t: f32,

    /// The normal of the wall that was hit
    pub hit_normal: Vec3,

    /// The edge of the final polygon where the wall was hit
    pub hit_edge_index: Option<usize>,

    /// Polygons visited by the ray, in order
    pub path: Vec<PolyRef>,
}

impl RaycastHit {
    /// Creates a hit that reached the ray end
    pub fn no_hit(path: Vec<PolyRef>) -> Self {
        Self {
            t: f32::MAX,
            hit_normal: Vec3::ZERO,
            hit_edge_index: None,
            path,
        }
    }

    /// Checks if this represents a wall hit
    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }
}
