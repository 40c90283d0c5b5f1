//! Shared navigation query context
//!
//! Bundles the navigation mesh query, the polygon filter and the query
//! extents every agent uses. The context is read by all agents during a
//! tick and only changes between ticks.

use navcrowd_common::Vec3;
use navcrowd_query::{NavMeshQuery, PolyRef, QueryFilter};

/// Navigation query surface shared by all agents
#[derive(Clone)]
pub struct NavQueryContext<'a> {
    query: &'a dyn NavMeshQuery,
    filter: QueryFilter,
    half_extents: Vec3,
}

impl std::fmt::Debug for NavQueryContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavQueryContext")
            .field("filter", &self.filter)
            .field("half_extents", &self.half_extents)
            .finish_non_exhaustive()
    }
}

impl<'a> NavQueryContext<'a> {
    /// Creates a context over `query` with the default filter
    pub fn new(query: &'a dyn NavMeshQuery, half_extents: Vec3) -> Self {
        Self {
            query,
            filter: QueryFilter::default(),
            half_extents,
        }
    }

    /// The underlying navigation query
    pub fn query(&self) -> &'a dyn NavMeshQuery {
        self.query
    }

    /// The polygon filter
    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    pub(crate) fn filter_mut(&mut self) -> &mut QueryFilter {
        &mut self.filter
    }

    /// Half extents used for nearest polygon queries
    pub fn half_extents(&self) -> Vec3 {
        self.half_extents
    }

    /// Nearest polygon to `pos`, if any lies within the query extents
    pub fn find_nearest(&self, pos: Vec3) -> Option<(PolyRef, Vec3)> {
        self.query
            .find_nearest_poly(pos, self.half_extents, &self.filter)
            .ok()
            .filter(|(r, _)| r.is_valid())
    }

    /// Returns true if `poly_ref` passes the current filter
    pub fn is_valid(&self, poly_ref: PolyRef) -> bool {
        poly_ref.is_valid() && self.query.is_valid_poly_ref(poly_ref, &self.filter)
    }
}
