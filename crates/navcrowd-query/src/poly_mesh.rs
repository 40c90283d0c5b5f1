//! In-memory navigation mesh over explicit convex polygons
//!
//! A [`PolyMesh`] is assembled with [`PolyMeshBuilder`] from vertices,
//! convex polygons given as vertex index lists and off-mesh connections.
//! Adjacency is derived from shared edges, winding is normalized to
//! clockwise and off-mesh connections are attached to the ground polygons
//! under their endpoints.

use std::collections::HashMap;

use super::{PolyFlags, PolyRef, PolyType, Status};
use log::{debug, warn};
use navcrowd_common::{
    Error, Result, Vec3, closest_height_point_triangle, closest_point_on_poly_edges,
    dist_point_segment_sqr_2d, poly_area_2d, point_in_polygon_2d,
};

/// Maximum number of vertices per polygon
pub const MAX_VERTS_PER_POLY: usize = 12;

/// Link edge marker for ground polygon links that lead onto an off-mesh connection
pub const EXT_LINK_EDGE: u8 = 0xff;

/// Directed link between two polygons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Index of the connected polygon
    pub target: usize,
    /// Edge of the owning polygon the link crosses.
    /// For off-mesh connection polygons 0 is the start vertex and 1 the end.
    pub edge: u8,
}

/// Polygon in the navigation mesh
#[derive(Debug, Clone)]
pub struct Poly {
    /// Vertex indices, clockwise
    pub verts: Vec<usize>,
    /// Outgoing links
    pub links: Vec<Link>,
    /// Ability flags
    pub flags: PolyFlags,
    /// Area id
    pub area: u8,
    /// Polygon type
    pub poly_type: PolyType,
    pub(crate) bmin: Vec3,
    pub(crate) bmax: Vec3,
}

impl Poly {
    /// Links crossing the given edge
    pub fn links_on_edge(&self, edge: usize) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |l| l.edge as usize == edge)
    }
}

/// Description of an off-mesh connection to attach to the mesh
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnectionDesc {
    /// Start point
    pub start: Vec3,
    /// End point
    pub end: Vec3,
    /// Snap radius of both endpoints
    pub radius: f32,
    /// Whether the connection can be taken from end to start
    pub bidirectional: bool,
    /// Ability flags
    pub flags: PolyFlags,
    /// Area id
    pub area: u8,
}

impl OffMeshConnectionDesc {
    /// Creates a one-way connection with jump flags
    pub fn new(start: Vec3, end: Vec3, radius: f32) -> Self {
        Self {
            start,
            end,
            radius,
            bidirectional: false,
            flags: PolyFlags::JUMP,
            area: 0,
        }
    }

    /// Makes the connection traversable in both directions
    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }
}

/// Navigation polygons and their adjacency
#[derive(Debug, Clone, Default)]
pub struct PolyMesh {
    verts: Vec<Vec3>,
    polys: Vec<Poly>,
}

impl PolyMesh {
    /// Number of polygons, including off-mesh connection polygons
    pub fn poly_count(&self) -> usize {
        self.polys.len()
    }

    /// Reference of the polygon at `index`
    pub fn poly_ref(index: usize) -> PolyRef {
        PolyRef::new(index as u32 + 1)
    }

    /// Index of the polygon behind `poly_ref`
    pub fn poly_index(&self, poly_ref: PolyRef) -> Option<usize> {
        let idx = (poly_ref.id() as usize).checked_sub(1)?;
        (idx < self.polys.len()).then_some(idx)
    }

    /// Polygon behind `poly_ref`
    pub fn poly(&self, poly_ref: PolyRef) -> Result<&Poly> {
        self.poly_index(poly_ref)
            .map(|idx| &self.polys[idx])
            .ok_or_else(|| Status::InvalidParam.into())
    }

    pub(crate) fn poly_at(&self, index: usize) -> &Poly {
        &self.polys[index]
    }

    /// Changes the flags of a polygon, e.g. to close a door
    pub fn set_poly_flags(&mut self, poly_ref: PolyRef, flags: PolyFlags) -> Result<()> {
        let idx = self
            .poly_index(poly_ref)
            .ok_or_else(|| Error::from(Status::InvalidParam))?;
        self.polys[idx].flags = flags;
        Ok(())
    }

    /// Vertex positions of a polygon
    pub fn poly_verts(&self, index: usize) -> Vec<Vec3> {
        self.polys[index].verts.iter().map(|&v| self.verts[v]).collect()
    }

    pub(crate) fn vertex(&self, index: usize) -> Vec3 {
        self.verts[index]
    }

    /// References of all off-mesh connection polygons
    pub fn off_mesh_connections(&self) -> Vec<PolyRef> {
        self.polys
            .iter()
            .enumerate()
            .filter(|(_, p)| p.poly_type == PolyType::OffMeshConnection)
            .map(|(i, _)| Self::poly_ref(i))
            .collect()
    }

    /// Height of a ground polygon under `pos`, if `pos` lies inside it
    pub(crate) fn ground_height(&self, index: usize, pos: &Vec3) -> Option<f32> {
        let verts = self.poly_verts(index);
        if !point_in_polygon_2d(pos, &verts) {
            return None;
        }
        for i in 1..verts.len() - 1 {
            if let Some(h) = closest_height_point_triangle(pos, &verts[0], &verts[i], &verts[i + 1]) {
                return Some(h);
            }
        }
        // Inside but numerically on a fan edge
        Some(closest_point_on_poly_edges(pos, &verts).y)
    }

    /// Closest point on a polygon to `pos`, with surface height
    pub(crate) fn closest_point(&self, index: usize, pos: &Vec3) -> Vec3 {
        let poly = &self.polys[index];
        if poly.poly_type == PolyType::OffMeshConnection {
            let v0 = self.verts[poly.verts[0]];
            let v1 = self.verts[poly.verts[1]];
            let (_, t) = dist_point_segment_sqr_2d(pos, &v0, &v1);
            return v0.lerp(v1, t);
        }
        match self.ground_height(index, pos) {
            Some(h) => Vec3::new(pos.x, h, pos.z),
            None => closest_point_on_poly_edges(pos, &self.poly_verts(index)),
        }
    }

    /// Ground polygons whose bounds overlap the box `center ± half_extents`
    pub(crate) fn query_ground_polys(
        &self,
        center: &Vec3,
        half_extents: &Vec3,
    ) -> impl Iterator<Item = usize> + '_ {
        let qmin = *center - *half_extents;
        let qmax = *center + *half_extents;
        self.polys.iter().enumerate().filter_map(move |(i, p)| {
            let overlaps = p.poly_type == PolyType::Ground
                && !(qmin.x > p.bmax.x
                    || qmax.x < p.bmin.x
                    || qmin.y > p.bmax.y
                    || qmax.y < p.bmin.y
                    || qmin.z > p.bmax.z
                    || qmax.z < p.bmin.z);
            overlaps.then_some(i)
        })
    }

    /// Nearest ground polygon accepted by `accept`
    pub(crate) fn nearest_ground_poly(
        &self,
        center: &Vec3,
        half_extents: &Vec3,
        accept: impl Fn(&Poly) -> bool,
    ) -> Option<(usize, Vec3)> {
        let mut nearest: Option<(usize, Vec3, f32)> = None;
        for idx in self.query_ground_polys(center, half_extents) {
            if !accept(&self.polys[idx]) {
                continue;
            }
            let closest = self.closest_point(idx, center);
            let d = closest.distance_squared(*center);
            if nearest.is_none_or(|(_, _, best)| d < best) {
                nearest = Some((idx, closest, d));
            }
        }
        nearest.map(|(idx, pos, _)| (idx, pos))
    }
}

/// Assembles a [`PolyMesh`]
#[derive(Debug, Clone)]
pub struct PolyMeshBuilder {
    verts: Vec<Vec3>,
    polys: Vec<(Vec<usize>, PolyFlags, u8)>,
    connections: Vec<OffMeshConnectionDesc>,
    walkable_climb: f32,
}

impl Default for PolyMeshBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PolyMeshBuilder {
    /// Creates an empty builder
    pub fn new() -> Self {
        Self {
            verts: Vec::new(),
            polys: Vec::new(),
            connections: Vec::new(),
            walkable_climb: 0.9,
        }
    }

    /// Vertical tolerance used when attaching off-mesh connections
    pub fn with_walkable_climb(mut self, climb: f32) -> Self {
        self.walkable_climb = climb;
        self
    }

    /// Adds a vertex and returns its index
    pub fn add_vertex(&mut self, v: Vec3) -> usize {
        self.verts.push(v);
        self.verts.len() - 1
    }

    /// Adds a convex polygon given by vertex indices, in either winding
    pub fn add_polygon(&mut self, indices: &[usize], flags: PolyFlags, area: u8) -> Result<usize> {
        if indices.len() < 3 || indices.len() > MAX_VERTS_PER_POLY {
            return Err(Error::InvalidParam(format!(
                "polygon must have 3..={} vertices, got {}",
                MAX_VERTS_PER_POLY,
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.verts.len()) {
            return Err(Error::InvalidParam(format!("vertex index {} out of range", bad)));
        }
        self.polys.push((indices.to_vec(), flags, area));
        Ok(self.polys.len() - 1)
    }

    /// Adds an off-mesh connection
    pub fn add_off_mesh_connection(&mut self, desc: OffMeshConnectionDesc) {
        self.connections.push(desc);
    }

    /// Builds the mesh, deriving adjacency and attaching connections
    pub fn build(self) -> Result<PolyMesh> {
        let verts = self.verts;
        let mut polys = Vec::with_capacity(self.polys.len() + self.connections.len());

        for (mut indices, flags, area) in self.polys {
            let pv: Vec<Vec3> = indices.iter().map(|&i| verts[i]).collect();
            let area2 = poly_area_2d(&pv);
            if area2.abs() < f32::EPSILON {
                return Err(Error::InvalidParam("degenerate polygon".to_string()));
            }
            if area2 > 0.0 {
                indices.reverse();
            }
            let (bmin, bmax) = bounds(indices.iter().map(|&i| verts[i]));
            polys.push(Poly {
                verts: indices,
                links: Vec::new(),
                flags,
                area,
                poly_type: PolyType::Ground,
                bmin,
                bmax,
            });
        }

        // Shared edges
        let mut edges: HashMap<(usize, usize), (usize, u8)> = HashMap::new();
        let mut pairs = Vec::new();
        for (pi, poly) in polys.iter().enumerate() {
            let n = poly.verts.len();
            for j in 0..n {
                let a = poly.verts[j];
                let b = poly.verts[(j + 1) % n];
                let key = (a.min(b), a.max(b));
                match edges.get(&key) {
                    Some(&(other, other_edge)) => pairs.push((pi, j as u8, other, other_edge)),
                    None => {
                        edges.insert(key, (pi, j as u8));
                    }
                }
            }
        }
        for (a, ea, b, eb) in pairs {
            polys[a].links.push(Link { target: b, edge: ea });
            polys[b].links.push(Link { target: a, edge: eb });
        }

        let mut mesh = PolyMesh { verts, polys };

        for con in self.connections {
            let ext = Vec3::new(con.radius, self.walkable_climb, con.radius);
            let start = snap_endpoint(&mesh, &con.start, con.radius, &ext);
            let end = snap_endpoint(&mesh, &con.end, con.radius, &ext);

            let con_idx = mesh.polys.len();
            let sv = mesh.verts.len();
            let start_pos = start.map_or(con.start, |(_, p)| p);
            let end_pos = end.map_or(con.end, |(_, p)| p);
            mesh.verts.push(start_pos);
            mesh.verts.push(end_pos);
            let (bmin, bmax) = bounds([start_pos, end_pos].into_iter());
            let mut poly = Poly {
                verts: vec![sv, sv + 1],
                links: Vec::new(),
                flags: con.flags,
                area: con.area,
                poly_type: PolyType::OffMeshConnection,
                bmin,
                bmax,
            };

            match start {
                Some((land, _)) => {
                    poly.links.push(Link { target: land, edge: 0 });
                    mesh.polys[land].links.push(Link {
                        target: con_idx,
                        edge: EXT_LINK_EDGE,
                    });
                }
                None => warn!("off-mesh connection start {:?} is not on the mesh", con.start),
            }
            match end {
                Some((land, _)) => {
                    poly.links.push(Link { target: land, edge: 1 });
                    if con.bidirectional {
                        mesh.polys[land].links.push(Link {
                            target: con_idx,
                            edge: EXT_LINK_EDGE,
                        });
                    }
                }
                None => warn!("off-mesh connection end {:?} is not on the mesh", con.end),
            }
            mesh.polys.push(poly);
        }

        debug!(
            "Built poly mesh with {} polygons and {} vertices",
            mesh.polys.len(),
            mesh.verts.len()
        );
        Ok(mesh)
    }
}

fn snap_endpoint(mesh: &PolyMesh, p: &Vec3, radius: f32, ext: &Vec3) -> Option<(usize, Vec3)> {
    let (idx, nearest) = mesh.nearest_ground_poly(p, ext, |_| true)?;
    let dx = nearest.x - p.x;
    let dz = nearest.z - p.z;
    if dx * dx + dz * dz > radius * radius {
        return None;
    }
    Some((idx, nearest))
}

fn bounds(points: impl Iterator<Item = Vec3>) -> (Vec3, Vec3) {
    points.fold((Vec3::splat(f32::MAX), Vec3::splat(-f32::MAX)), |(lo, hi), p| {
        (lo.min(p), hi.max(p))
    })
}
