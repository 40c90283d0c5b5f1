//! Navigation mesh query surface consumed by the crowd simulation
//!
//! The [`NavMeshQuery`] trait is the boundary between agents and the
//! walkable surface. [`PolyMesh`] and [`PolyMeshQuery`] provide an
//! in-memory implementation over explicit convex polygons, suitable for
//! hosts that already have a polygon soup and for tests.

mod nav_mesh_query;
mod poly_mesh;
mod poly_mesh_query;
mod raycast_hit;
mod status;
pub mod test_mesh_helpers;

#[cfg(test)]
mod poly_mesh_query_tests;

pub use nav_mesh_query::NavMeshQuery;
pub use poly_mesh::{OffMeshConnectionDesc, PolyMesh, PolyMeshBuilder};
pub use poly_mesh_query::PolyMeshQuery;
pub use raycast_hit::RaycastHit;
pub use status::Status;

use navcrowd_common::Vec3;

/// Maximum number of area types a filter can weigh
pub const MAX_AREAS: usize = 64;

/// Opaque reference to one navigation polygon.
///
/// Zero is never a valid reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u32);

impl PolyRef {
    /// The null reference
    pub const NULL: PolyRef = PolyRef(0);

    /// Creates a reference from its raw id
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id of the reference
    pub const fn id(&self) -> u32 {
        self.0
    }

    /// Returns true unless this is the null reference
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

bitflags::bitflags! {
    /// Polygon ability flags matched by [`QueryFilter`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct PolyFlags: u16 {
        /// Ground that can be walked on
        const WALK = 0x01;
        /// Water that can be swum through
        const SWIM = 0x02;
        /// Door passage
        const DOOR = 0x04;
        /// Jump or ladder style connection
        const JUMP = 0x08;
        /// Disabled polygon
        const DISABLED = 0x10;
    }
}

bitflags::bitflags! {
    /// Flags attached to straight path vertices
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct StraightPathFlags: u8 {
        /// The vertex is the start position
        const START = 0x01;
        /// The vertex is the end position
        const END = 0x02;
        /// The vertex is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// Kind of navigation polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum PolyType {
    /// Regular convex ground polygon
    #[default]
    Ground,
    /// Two-point link traversed by animation
    OffMeshConnection,
}

/// Polygon filter and traversal cost table
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct QueryFilter {
    /// Cost multiplier per area id
    #[cfg_attr(feature = "serialization", serde(with = "area_costs"))]
    pub area_cost: [f32; MAX_AREAS],
    /// A polygon must have at least one of these flags
    pub include_flags: PolyFlags,
    /// A polygon must have none of these flags
    pub exclude_flags: PolyFlags,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            area_cost: [1.0; MAX_AREAS],
            include_flags: PolyFlags::all(),
            exclude_flags: PolyFlags::empty(),
        }
    }
}

impl QueryFilter {
    /// Returns true if a polygon with the given flags may be visited
    pub fn pass_filter(&self, flags: PolyFlags) -> bool {
        flags.intersects(self.include_flags) && !flags.intersects(self.exclude_flags)
    }

    /// Traversal cost between two points on a polygon of `area`
    pub fn get_cost(&self, pa: &Vec3, pb: &Vec3, area: u8) -> f32 {
        let scale = self.area_cost.get(area as usize).copied().unwrap_or(1.0);
        pa.distance(*pb) * scale
    }
}

#[cfg(feature = "serialization")]
mod area_costs {
    use super::MAX_AREAS;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(costs: &[f32; MAX_AREAS], s: S) -> Result<S::Ok, S::Error> {
        costs.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[f32; MAX_AREAS], D::Error> {
        let costs = Vec::<f32>::deserialize(d)?;
        let mut out = [1.0; MAX_AREAS];
        for (dst, src) in out.iter_mut().zip(costs) {
            *dst = src;
        }
        Ok(out)
    }
}

/// One vertex of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    /// Vertex position
    pub pos: Vec3,
    /// Vertex classification
    pub flags: StraightPathFlags,
    /// Polygon entered at this vertex
    pub poly: PolyRef,
}
