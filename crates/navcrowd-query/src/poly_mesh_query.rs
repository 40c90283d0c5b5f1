//! Query implementation over a [`PolyMesh`]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use super::poly_mesh::{EXT_LINK_EDGE, Poly, PolyMesh};
use super::{
    NavMeshQuery, PolyRef, PolyType, QueryFilter, RaycastHit, Status, StraightPathFlags,
    StraightPathPoint,
};
use navcrowd_common::{
    Result, Vec3, closest_point_on_poly_edges, dist_point_segment_sqr_2d,
    intersect_segment_poly_2d, point_in_polygon_2d, tri_area_2d, vequal,
};

/// Heuristic scale for A*
const H_SCALE: f32 = 0.999;

/// Default maximum number of search nodes
pub const DEFAULT_MAX_NODES: usize = 2048;

/// Node state in the search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
struct Node {
    poly: usize,
    pos: Vec3,
    cost: f32,
    total: f32,
    parent: Option<usize>,
    state: NodeState,
}

/// Node wrapper for the binary heap (priority queue)
#[derive(Debug, Clone, Copy)]
struct HeapNode {
    index: usize,
    f: f32,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap, older nodes first on ties
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Portal between two adjacent polygons
struct Portal {
    left: Vec3,
    right: Vec3,
    to_type: PolyType,
}

/// Navigation queries over a [`PolyMesh`]
#[derive(Debug, Clone, Copy)]
pub struct PolyMeshQuery<'a> {
    mesh: &'a PolyMesh,
    max_nodes: usize,
}

impl<'a> PolyMeshQuery<'a> {
    /// Creates a query over `mesh`
    pub fn new(mesh: &'a PolyMesh) -> Self {
        Self {
            mesh,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }

    /// Limits the number of nodes a single path search may open
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes.max(1);
        self
    }

    /// The underlying mesh
    pub fn mesh(&self) -> &'a PolyMesh {
        self.mesh
    }

    fn index(&self, poly_ref: PolyRef) -> Result<usize> {
        self.mesh
            .poly_index(poly_ref)
            .ok_or_else(|| Status::InvalidParam.into())
    }

    fn portal(&self, from: usize, to: usize) -> Option<Portal> {
        let from_poly = self.mesh.poly_at(from);
        let to_poly = self.mesh.poly_at(to);

        if from_poly.poly_type == PolyType::OffMeshConnection {
            let link = from_poly.links.iter().find(|l| l.target == to)?;
            let v = self.mesh.vertex(from_poly.verts[link.edge as usize]);
            return Some(Portal {
                left: v,
                right: v,
                to_type: to_poly.poly_type,
            });
        }
        if to_poly.poly_type == PolyType::OffMeshConnection {
            let link = to_poly.links.iter().find(|l| l.target == from)?;
            let v = self.mesh.vertex(to_poly.verts[link.edge as usize]);
            return Some(Portal {
                left: v,
                right: v,
                to_type: to_poly.poly_type,
            });
        }

        let link = from_poly
            .links
            .iter()
            .find(|l| l.target == to && l.edge != EXT_LINK_EDGE)?;
        let n = from_poly.verts.len();
        let e = link.edge as usize;
        Some(Portal {
            left: self.mesh.vertex(from_poly.verts[e]),
            right: self.mesh.vertex(from_poly.verts[(e + 1) % n]),
            to_type: to_poly.poly_type,
        })
    }

    fn passes(&self, poly: &Poly, filter: &QueryFilter) -> bool {
        filter.pass_filter(poly.flags)
    }
}

/// Appends a straight path vertex. Returns true when the path is complete.
fn append_vertex(
    out: &mut Vec<StraightPathPoint>,
    pos: Vec3,
    flags: StraightPathFlags,
    poly: PolyRef,
    max_points: usize,
) -> bool {
    if let Some(last) = out.last_mut() {
        if vequal(&last.pos, &pos) {
            last.flags = flags;
            last.poly = poly;
            return false;
        }
    }
    out.push(StraightPathPoint { pos, flags, poly });
    out.len() >= max_points || flags.contains(StraightPathFlags::END)
}

impl NavMeshQuery for PolyMeshQuery<'_> {
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Result<(PolyRef, Vec3)> {
        if !center.is_finite() || !half_extents.is_finite() {
            return Err(Status::InvalidParam.into());
        }
        self.mesh
            .nearest_ground_poly(&center, &half_extents, |p| self.passes(p, filter))
            .map(|(idx, pos)| (PolyMesh::poly_ref(idx), pos))
            .ok_or_else(|| Status::NotFound.into())
    }

    fn find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<Vec<PolyRef>> {
        if !self.is_valid_poly_ref(start_ref, filter)
            || !self.is_valid_poly_ref(end_ref, filter)
            || max_path == 0
        {
            return Err(Status::InvalidParam.into());
        }
        if start_ref == end_ref {
            return Ok(vec![start_ref]);
        }

        let start = self.index(start_ref)?;
        let end = self.index(end_ref)?;

        let mut nodes: Vec<Node> = Vec::new();
        let mut lookup: HashMap<usize, usize> = HashMap::new();
        let mut open_list = BinaryHeap::new();

        let start_h = start_pos.distance(end_pos) * H_SCALE;
        nodes.push(Node {
            poly: start,
            pos: start_pos,
            cost: 0.0,
            total: start_h,
            parent: None,
            state: NodeState::Open,
        });
        lookup.insert(start, 0);
        open_list.push(HeapNode { index: 0, f: start_h });

        let mut best_node = 0;
        let mut best_cost = start_h;

        while let Some(HeapNode { index: current, .. }) = open_list.pop() {
            if nodes[current].state == NodeState::Closed {
                continue;
            }
            nodes[current].state = NodeState::Closed;

            let cur_poly = nodes[current].poly;
            if cur_poly == end {
                best_node = current;
                break;
            }

            let parent_poly = nodes[current].parent.map(|p| nodes[p].poly);
            let poly = self.mesh.poly_at(cur_poly);

            for link in &poly.links {
                let neighbour = link.target;
                if Some(neighbour) == parent_poly {
                    continue;
                }
                let neighbour_poly = self.mesh.poly_at(neighbour);
                if !self.passes(neighbour_poly, filter) {
                    continue;
                }
                let Some(portal) = self.portal(cur_poly, neighbour) else {
                    continue;
                };
                let mid = (portal.left + portal.right) * 0.5;

                let cur_pos = nodes[current].pos;
                let (cost, heuristic) = if neighbour == end {
                    let cost = nodes[current].cost
                        + filter.get_cost(&cur_pos, &mid, poly.area)
                        + filter.get_cost(&mid, &end_pos, neighbour_poly.area);
                    (cost, 0.0)
                } else {
                    let cost = nodes[current].cost + filter.get_cost(&cur_pos, &mid, poly.area);
                    (cost, mid.distance(end_pos) * H_SCALE)
                };
                let total = cost + heuristic;

                let node_idx = match lookup.get(&neighbour) {
                    Some(&idx) => {
                        if total >= nodes[idx].total {
                            continue;
                        }
                        idx
                    }
                    None => {
                        if nodes.len() >= self.max_nodes {
                            continue;
                        }
                        nodes.push(Node {
                            poly: neighbour,
                            pos: mid,
                            cost,
                            total,
                            parent: None,
                            state: NodeState::Open,
                        });
                        lookup.insert(neighbour, nodes.len() - 1);
                        nodes.len() - 1
                    }
                };

                let node = &mut nodes[node_idx];
                node.pos = mid;
                node.cost = cost;
                node.total = total;
                node.parent = Some(current);
                node.state = NodeState::Open;
                open_list.push(HeapNode {
                    index: node_idx,
                    f: total,
                });

                if heuristic < best_cost {
                    best_cost = heuristic;
                    best_node = node_idx;
                }
            }
        }

        let mut path = Vec::new();
        let mut cursor = Some(best_node);
        while let Some(idx) = cursor {
            path.push(PolyMesh::poly_ref(nodes[idx].poly));
            cursor = nodes[idx].parent;
        }
        path.reverse();
        path.truncate(max_path);
        Ok(path)
    }

    fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>> {
        let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
            return Err(Status::InvalidParam.into());
        };
        if max_points == 0 {
            return Err(Status::InvalidParam.into());
        }
        let indices = path
            .iter()
            .map(|&r| self.index(r))
            .collect::<Result<Vec<_>>>()?;

        let mut out = Vec::new();
        let closest_start = self.closest_point_on_poly_boundary(first, start_pos)?;
        let mut closest_end = self.closest_point_on_poly_boundary(last, end_pos)?;

        if append_vertex(
            &mut out,
            closest_start,
            StraightPathFlags::START,
            first,
            max_points,
        ) {
            return Ok(out);
        }

        if path.len() > 1 {
            let mut apex = closest_start;
            let mut portal_left = apex;
            let mut portal_right = apex;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_type = PolyType::Ground;
            let mut right_type = PolyType::Ground;
            let mut left_ref = Some(first);
            let mut right_ref = Some(first);

            let mut i = 0;
            while i < path.len() {
                let (left, right, to_type) = if i + 1 < path.len() {
                    match self.portal(indices[i], indices[i + 1]) {
                        Some(portal) => {
                            // Starting really close to the first portal, skip it
                            if i == 0 {
                                let (d, _) =
                                    dist_point_segment_sqr_2d(&apex, &portal.left, &portal.right);
                                if d < 0.001 * 0.001 {
                                    i += 1;
                                    continue;
                                }
                            }
                            (portal.left, portal.right, portal.to_type)
                        }
                        None => {
                            // Disconnected path, end at the last reachable polygon
                            closest_end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                            append_vertex(
                                &mut out,
                                closest_end,
                                StraightPathFlags::empty(),
                                path[i],
                                max_points,
                            );
                            return Ok(out);
                        }
                    }
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };

                // Right vertex
                if tri_area_2d(&apex, &portal_right, &right) <= 0.0 {
                    if vequal(&apex, &portal_right) || tri_area_2d(&apex, &portal_left, &right) > 0.0
                    {
                        portal_right = right;
                        right_ref = path.get(i + 1).copied();
                        right_type = to_type;
                        right_index = i;
                    } else {
                        apex = portal_left;
                        let apex_index = left_index;
                        let (flags, poly) = corner_flags(left_ref, left_type, last);
                        if append_vertex(&mut out, apex, flags, poly, max_points) {
                            return Ok(out);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex
                if tri_area_2d(&apex, &portal_left, &left) >= 0.0 {
                    if vequal(&apex, &portal_left) || tri_area_2d(&apex, &portal_right, &left) < 0.0
                    {
                        portal_left = left;
                        left_ref = path.get(i + 1).copied();
                        left_type = to_type;
                        left_index = i;
                    } else {
                        apex = portal_right;
                        let apex_index = right_index;
                        let (flags, poly) = corner_flags(right_ref, right_type, last);
                        if append_vertex(&mut out, apex, flags, poly, max_points) {
                            return Ok(out);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        append_vertex(&mut out, closest_end, StraightPathFlags::END, last, max_points);
        Ok(out)
    }

    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit> {
        if !self.is_valid_poly_ref(start_ref, filter) || !start_pos.is_finite() || !end_pos.is_finite()
        {
            return Err(Status::InvalidParam.into());
        }

        let mut hit = RaycastHit {
            t: 0.0,
            hit_normal: Vec3::ZERO,
            hit_edge_index: None,
            path: Vec::new(),
        };
        let mut cur = self.index(start_ref)?;

        loop {
            let verts = self.mesh.poly_verts(cur);
            let Some(clip) = intersect_segment_poly_2d(&start_pos, &end_pos, &verts) else {
                // Could not hit the polygon, keep the old t and report hit
                return Ok(hit);
            };
            hit.hit_edge_index = clip.seg_max;
            if clip.tmax > hit.t {
                hit.t = clip.tmax;
            }
            hit.path.push(PolyMesh::poly_ref(cur));

            // Ray end is completely inside the polygon
            let Some(seg) = clip.seg_max else {
                hit.t = f32::MAX;
                return Ok(hit);
            };

            let poly = self.mesh.poly_at(cur);
            let next = poly.links_on_edge(seg).map(|l| l.target).find(|&t| {
                let p = self.mesh.poly_at(t);
                p.poly_type == PolyType::Ground && self.passes(p, filter)
            });

            match next {
                Some(n) if hit.path.len() <= self.mesh.poly_count() => cur = n,
                _ => {
                    // Hit a wall
                    let va = verts[seg];
                    let vb = verts[(seg + 1) % verts.len()];
                    let dx = vb.x - va.x;
                    let dz = vb.z - va.z;
                    hit.hit_normal = Vec3::new(dz, 0.0, -dx).normalize_or_zero();
                    return Ok(hit);
                }
            }
        }
    }

    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        if !self.is_valid_poly_ref(start_ref, filter) || !start_pos.is_finite() || !end_pos.is_finite()
        {
            return Err(Status::InvalidParam.into());
        }
        let start = self.index(start_ref)?;

        let search_pos = start_pos.lerp(end_pos, 0.5);
        let search_rad = start_pos.distance(end_pos) * 0.5 + 0.001;
        let search_rad_sqr = search_rad * search_rad;

        let mut parents: HashMap<usize, Option<usize>> = HashMap::new();
        parents.insert(start, None);
        let mut queue = VecDeque::from([start]);

        let mut best_pos = start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = start;

        while let Some(cur) = queue.pop_front() {
            let verts = self.mesh.poly_verts(cur);
            if point_in_polygon_2d(&end_pos, &verts) {
                best_node = cur;
                best_pos = end_pos;
                break;
            }

            let poly = self.mesh.poly_at(cur);
            let n = verts.len();
            for j in 0..n {
                let vj = verts[j];
                let vi = verts[(j + 1) % n];
                let neis: Vec<usize> = poly
                    .links_on_edge(j)
                    .map(|l| l.target)
                    .filter(|&t| {
                        let p = self.mesh.poly_at(t);
                        p.poly_type == PolyType::Ground && self.passes(p, filter)
                    })
                    .collect();

                if neis.is_empty() {
                    // Wall edge, calc distance
                    let (d, t) = dist_point_segment_sqr_2d(&end_pos, &vj, &vi);
                    if d < best_dist {
                        best_pos = vj.lerp(vi, t);
                        best_dist = d;
                        best_node = cur;
                    }
                } else {
                    for nei in neis {
                        if parents.contains_key(&nei) || parents.len() >= max_visited {
                            continue;
                        }
                        // Skip the link if it is too far from search constraint
                        let (d, _) = dist_point_segment_sqr_2d(&search_pos, &vj, &vi);
                        if d > search_rad_sqr {
                            continue;
                        }
                        parents.insert(nei, Some(cur));
                        queue.push_back(nei);
                    }
                }
            }
        }

        let mut visited = Vec::new();
        let mut cursor = Some(best_node);
        while let Some(idx) = cursor {
            visited.push(PolyMesh::poly_ref(idx));
            cursor = parents.get(&idx).copied().flatten();
        }
        visited.reverse();
        Ok((best_pos, visited))
    }

    fn is_valid_poly_ref(&self, poly_ref: PolyRef, filter: &QueryFilter) -> bool {
        self.mesh
            .poly_index(poly_ref)
            .is_some_and(|idx| self.passes(self.mesh.poly_at(idx), filter))
    }

    fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: Vec3) -> Result<Vec3> {
        let idx = self.index(poly_ref)?;
        Ok(self.mesh.closest_point(idx, &pos))
    }

    fn closest_point_on_poly_boundary(&self, poly_ref: PolyRef, pos: Vec3) -> Result<Vec3> {
        let idx = self.index(poly_ref)?;
        let verts = self.mesh.poly_verts(idx);
        if self.mesh.poly_at(idx).poly_type == PolyType::Ground && point_in_polygon_2d(&pos, &verts)
        {
            Ok(pos)
        } else {
            Ok(closest_point_on_poly_edges(&pos, &verts))
        }
    }

    fn get_poly_height(&self, poly_ref: PolyRef, pos: Vec3) -> Result<f32> {
        let idx = self.index(poly_ref)?;
        let poly = self.mesh.poly_at(idx);
        if poly.poly_type == PolyType::OffMeshConnection {
            let v0 = self.mesh.vertex(poly.verts[0]);
            let v1 = self.mesh.vertex(poly.verts[1]);
            let d0 = pos.distance(v0);
            let d1 = pos.distance(v1);
            let u = if d0 + d1 > 0.0 { d0 / (d0 + d1) } else { 0.0 };
            return Ok(v0.y + (v1.y - v0.y) * u);
        }
        self.mesh
            .ground_height(idx, &pos)
            .ok_or_else(|| Status::NotFound.into())
    }

    fn get_off_mesh_connection_end_points(
        &self,
        prev_ref: PolyRef,
        con_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)> {
        let idx = self.index(con_ref)?;
        let poly = self.mesh.poly_at(idx);
        if poly.poly_type != PolyType::OffMeshConnection {
            return Err(Status::InvalidParam.into());
        }
        let prev = self.mesh.poly_index(prev_ref);

        // The link on vertex 0 leads back to the start polygon
        let mut idx0 = 0;
        let mut idx1 = 1;
        if let Some(link) = poly.links.iter().find(|l| l.edge == 0) {
            if Some(link.target) != prev {
                idx0 = 1;
                idx1 = 0;
            }
        }
        Ok((
            self.mesh.vertex(poly.verts[idx0]),
            self.mesh.vertex(poly.verts[idx1]),
        ))
    }

    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>> {
        if !self.is_valid_poly_ref(start_ref, filter) || !radius.is_finite() || radius < 0.0 {
            return Err(Status::InvalidParam.into());
        }
        let start = self.index(start_ref)?;
        let radius_sqr = radius * radius;

        let mut result = vec![start_ref];
        let mut visited = HashSet::from([start]);
        let mut stack = VecDeque::from([start]);

        while let Some(cur) = stack.pop_front() {
            for link in &self.mesh.poly_at(cur).links {
                let nei = link.target;
                if visited.contains(&nei) {
                    continue;
                }
                let nei_poly = self.mesh.poly_at(nei);
                if nei_poly.poly_type == PolyType::OffMeshConnection || !self.passes(nei_poly, filter) {
                    continue;
                }
                let Some(portal) = self.portal(cur, nei) else {
                    continue;
                };
                // The circle is not touching the next polygon
                let (d, _) = dist_point_segment_sqr_2d(&center, &portal.left, &portal.right);
                if d > radius_sqr {
                    continue;
                }
                visited.insert(nei);
                if result.len() < max_result {
                    result.push(PolyMesh::poly_ref(nei));
                }
                stack.push_back(nei);
            }
        }
        Ok(result)
    }

    fn get_poly_wall_segments(
        &self,
        poly_ref: PolyRef,
        filter: &QueryFilter,
    ) -> Result<Vec<(Vec3, Vec3)>> {
        let idx = self.index(poly_ref)?;
        let poly = self.mesh.poly_at(idx);
        if poly.poly_type == PolyType::OffMeshConnection {
            return Ok(Vec::new());
        }
        let verts = self.mesh.poly_verts(idx);
        let n = verts.len();
        let segments = (0..n)
            .filter(|&j| {
                !poly
                    .links_on_edge(j)
                    .any(|l| self.passes(self.mesh.poly_at(l.target), filter))
            })
            .map(|j| (verts[j], verts[(j + 1) % n]))
            .collect();
        Ok(segments)
    }
}

fn corner_flags(
    poly: Option<PolyRef>,
    poly_type: PolyType,
    last: PolyRef,
) -> (StraightPathFlags, PolyRef) {
    match poly {
        None => (StraightPathFlags::END, last),
        Some(r) if poly_type == PolyType::OffMeshConnection => {
            (StraightPathFlags::OFFMESH_CONNECTION, r)
        }
        Some(r) => (StraightPathFlags::empty(), r),
    }
}
