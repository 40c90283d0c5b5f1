//! Small navigation meshes for tests and examples

use super::{OffMeshConnectionDesc, PolyFlags, PolyMesh, PolyMeshBuilder};
use navcrowd_common::{Result, Vec3};

/// Creates a flat grid of `cells × cells` square polygons covering
/// `[min.x, min.x + size] × [min.z, min.z + size]` at height `min.y`.
pub fn create_plane_grid(min: Vec3, size: f32, cells: usize) -> Result<PolyMesh> {
    let mut builder = PolyMeshBuilder::new();
    add_grid(&mut builder, min, size, size, cells, cells)?;
    builder.build()
}

/// Creates a square plane centred on the origin, `2 * half_size` wide
pub fn create_square_mesh(half_size: f32, cells: usize) -> Result<PolyMesh> {
    create_plane_grid(Vec3::new(-half_size, 0.0, -half_size), half_size * 2.0, cells)
}

/// Creates an L-shaped corridor of three 2×2 squares:
/// `[0,2]×[0,2]`, `[2,4]×[0,2]` and `[2,4]×[2,4]`.
pub fn create_corner_mesh() -> Result<PolyMesh> {
    let mut b = PolyMeshBuilder::new();
    let v = |b: &mut PolyMeshBuilder, x: f32, z: f32| b.add_vertex(Vec3::new(x, 0.0, z));
    let v00 = v(&mut b, 0.0, 0.0);
    let v02 = v(&mut b, 0.0, 2.0);
    let v20 = v(&mut b, 2.0, 0.0);
    let v22 = v(&mut b, 2.0, 2.0);
    let v40 = v(&mut b, 4.0, 0.0);
    let v42 = v(&mut b, 4.0, 2.0);
    let v24 = v(&mut b, 2.0, 4.0);
    let v44 = v(&mut b, 4.0, 4.0);
    b.add_polygon(&[v00, v02, v22, v20], PolyFlags::WALK, 0)?;
    b.add_polygon(&[v20, v22, v42, v40], PolyFlags::WALK, 0)?;
    b.add_polygon(&[v22, v24, v44, v42], PolyFlags::WALK, 0)?;
    b.build()
}

/// Creates two disconnected islands joined by a one-way off-mesh
/// connection from `(-1.5, 0, 0)` to `(2.5, 0, 0)`.
///
/// The left island spans `[-6,-1]×[-2,2]`, the right one `[2,7]×[-2,2]`,
/// each split into two cells along x. Polygon refs are 1 and 2 for the
/// left island, 3 and 4 for the right one and 5 for the connection.
pub fn create_islands_with_offmesh() -> Result<PolyMesh> {
    let mut b = PolyMeshBuilder::new();
    add_grid(&mut b, Vec3::new(-6.0, 0.0, -2.0), 5.0, 4.0, 2, 1)?;
    add_grid(&mut b, Vec3::new(2.0, 0.0, -2.0), 5.0, 4.0, 2, 1)?;
    b.add_off_mesh_connection(OffMeshConnectionDesc::new(
        Vec3::new(-1.5, 0.0, 0.0),
        Vec3::new(2.5, 0.0, 0.0),
        0.5,
    ));
    b.build()
}

fn add_grid(
    builder: &mut PolyMeshBuilder,
    min: Vec3,
    size_x: f32,
    size_z: f32,
    cells_x: usize,
    cells_z: usize,
) -> Result<()> {
    let cells_x = cells_x.max(1);
    let cells_z = cells_z.max(1);
    let dx = size_x / cells_x as f32;
    let dz = size_z / cells_z as f32;

    let mut ids = Vec::with_capacity((cells_x + 1) * (cells_z + 1));
    for z in 0..=cells_z {
        for x in 0..=cells_x {
            ids.push(builder.add_vertex(Vec3::new(
                min.x + x as f32 * dx,
                min.y,
                min.z + z as f32 * dz,
            )));
        }
    }
    let at = |x: usize, z: usize| ids[z * (cells_x + 1) + x];
    for z in 0..cells_z {
        for x in 0..cells_x {
            builder.add_polygon(
                &[at(x, z), at(x, z + 1), at(x + 1, z + 1), at(x + 1, z)],
                PolyFlags::WALK,
                0,
            )?;
        }
    }
    Ok(())
}
