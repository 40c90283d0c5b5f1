//! 2D geometry operations on the XZ plane (Y-up coordinate system)
//!
//! Polygons handed to these helpers are expected to be convex and wound
//! clockwise when looking down the Y axis.

use glam::Vec3;

/// Calculate twice the signed area of a 2D triangle on the XZ plane.
///
/// Negative when `c` lies to the left of the directed line `a -> b`,
/// positive when it lies to the right, zero for collinear points.
#[inline]
pub fn tri_area_2d(a: &Vec3, b: &Vec3, c: &Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

/// Twice the signed area of a polygon on the XZ plane.
/// Negative for the clockwise winding used by navigation polygons.
pub fn poly_area_2d(verts: &[Vec3]) -> f32 {
    let n = verts.len();
    let mut area = 0.0;
    for i in 0..n {
        let a = &verts[i];
        let b = &verts[(i + 1) % n];
        area += a.x * b.z - b.x * a.z;
    }
    area
}

/// Squared 2D distance from a point to a segment, with the parametric
/// position of the closest point along the segment.
pub fn dist_point_segment_sqr_2d(p: &Vec3, a: &Vec3, b: &Vec3) -> (f32, f32) {
    let pqx = b.x - a.x;
    let pqz = b.z - a.z;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * (p.x - a.x) + pqz * (p.z - a.z);
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let dx = a.x + t * pqx - p.x;
    let dz = a.z + t * pqz - p.z;
    (dx * dx + dz * dz, t)
}

/// Crossing-number point in polygon test on the XZ plane
pub fn point_in_polygon_2d(p: &Vec3, verts: &[Vec3]) -> bool {
    let n = verts.len();
    let mut inside = false;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi.z > p.z) != (vj.z > p.z))
            && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Result of clipping a segment against a convex polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolyHit {
    /// Parametric entry point along the segment
    pub tmin: f32,
    /// Parametric exit point along the segment
    pub tmax: f32,
    /// Edge through which the segment enters, if it starts outside
    pub seg_min: Option<usize>,
    /// Edge through which the segment leaves, if it ends outside
    pub seg_max: Option<usize>,
}

/// Clips the segment `p0 -> p1` against a clockwise convex polygon on the
/// XZ plane. Edge `j` runs from `verts[j]` to `verts[j + 1]`.
pub fn intersect_segment_poly_2d(p0: &Vec3, p1: &Vec3, verts: &[Vec3]) -> Option<SegmentPolyHit> {
    const EPS: f32 = 0.000_000_01;

    let mut hit = SegmentPolyHit {
        tmin: 0.0,
        tmax: 1.0,
        seg_min: None,
        seg_max: None,
    };
    let dir = *p1 - *p0;
    let n = verts.len();

    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let edge = verts[i] - verts[j];
        let diff = *p0 - verts[j];
        let num = crate::perp_2d(&edge, &diff);
        let den = -crate::perp_2d(&edge, &dir);
        if den.abs() < EPS {
            // Parallel to this edge
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            // Entering across this edge
            if t > hit.tmin {
                hit.tmin = t;
                hit.seg_min = Some(j);
                if hit.tmin > hit.tmax {
                    return None;
                }
            }
        } else if t < hit.tmax {
            // Leaving across this edge
            hit.tmax = t;
            hit.seg_max = Some(j);
            if hit.tmax < hit.tmin {
                return None;
            }
        }
        j = i;
    }

    Some(hit)
}

/// Closest point to `p` on the boundary of a polygon, measured on the XZ
/// plane. The height is interpolated along the closest edge.
pub fn closest_point_on_poly_edges(p: &Vec3, verts: &[Vec3]) -> Vec3 {
    let n = verts.len();
    let mut best = (f32::MAX, 0usize, 0.0f32);
    for j in 0..n {
        let a = &verts[j];
        let b = &verts[(j + 1) % n];
        let (d, t) = dist_point_segment_sqr_2d(p, a, b);
        if d < best.0 {
            best = (d, j, t);
        }
    }
    let (_, j, t) = best;
    verts[j].lerp(verts[(j + 1) % n], t)
}

/// Height of the triangle `a, b, c` under point `p`, if `p` lies inside
/// the triangle on the XZ plane.
pub fn closest_height_point_triangle(p: &Vec3, a: &Vec3, b: &Vec3, c: &Vec3) -> Option<f32> {
    const EPS: f32 = 1e-6;

    let v0 = *c - *a;
    let v1 = *b - *a;
    let v2 = *p - *a;

    let mut denom = v0.x * v1.z - v0.z * v1.x;
    if denom.abs() < EPS {
        return None;
    }
    let mut u = v1.z * v2.x - v1.x * v2.z;
    let mut v = v0.x * v2.z - v0.z * v2.x;
    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        Some(a.y + (v0.y * u + v1.y * v) / denom)
    } else {
        None
    }
}

/// Check if two axis-aligned boxes overlap on the XZ plane
#[inline]
pub fn overlap_bounds_2d(amin: &Vec3, amax: &Vec3, bmin: &Vec3, bmax: &Vec3) -> bool {
    !(amin.x > bmax.x || amax.x < bmin.x || amin.z > bmax.z || amax.z < bmin.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit square wound clockwise on the XZ plane
    fn square() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        ]
    }

    #[test]
    fn test_tri_area_sign() {
        let a = Vec3::ZERO;
        let b = Vec3::new(1.0, 0.0, 0.0);
        // With x to the right and z up, (0,0,1) is left of a->b
        assert!(tri_area_2d(&a, &b, &Vec3::new(0.0, 0.0, 1.0)) < 0.0);
        assert!(tri_area_2d(&a, &b, &Vec3::new(0.0, 0.0, -1.0)) > 0.0);
        assert_eq!(tri_area_2d(&a, &b, &Vec3::new(2.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn test_square_is_clockwise() {
        assert!(poly_area_2d(&square()) < 0.0);
    }

    #[test]
    fn test_point_in_polygon() {
        let verts = square();
        assert!(point_in_polygon_2d(&Vec3::new(0.5, 3.0, 0.5), &verts));
        assert!(!point_in_polygon_2d(&Vec3::new(1.5, 0.0, 0.5), &verts));
    }

    #[test]
    fn test_dist_point_segment() {
        let (d, t) = dist_point_segment_sqr_2d(
            &Vec3::new(0.5, 0.0, 1.0),
            &Vec3::ZERO,
            &Vec3::new(1.0, 0.0, 0.0),
        );
        assert!((d - 1.0).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_segment_poly_inside() {
        let hit = intersect_segment_poly_2d(
            &Vec3::new(0.2, 0.0, 0.5),
            &Vec3::new(0.8, 0.0, 0.5),
            &square(),
        )
        .expect("segment lies inside");
        assert_eq!(hit.seg_max, None);
        assert_eq!(hit.tmax, 1.0);
    }

    #[test]
    fn test_segment_poly_exit_edge() {
        let verts = square();
        let hit = intersect_segment_poly_2d(
            &Vec3::new(0.5, 0.0, 0.5),
            &Vec3::new(1.5, 0.0, 0.5),
            &verts,
        )
        .expect("segment starts inside");
        assert!((hit.tmax - 0.5).abs() < 1e-5);
        // Leaves through the edge from (1,0,1) to (1,0,0)
        assert_eq!(hit.seg_max, Some(2));
    }

    #[test]
    fn test_segment_poly_miss() {
        let hit = intersect_segment_poly_2d(
            &Vec3::new(2.0, 0.0, 2.0),
            &Vec3::new(3.0, 0.0, 3.0),
            &square(),
        );
        assert!(hit.is_none());
    }

    #[test]
    fn test_closest_height() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(0.0, 1.0, 1.0);
        let c = Vec3::new(1.0, 0.0, 0.0);
        let h = closest_height_point_triangle(&Vec3::new(0.25, 0.0, 0.5), &a, &b, &c);
        assert!((h.unwrap_or(f32::NAN) - 0.5).abs() < 1e-5);
        assert!(closest_height_point_triangle(&Vec3::new(2.0, 0.0, 2.0), &a, &b, &c).is_none());
    }

    #[test]
    fn test_closest_point_on_edges() {
        let p = closest_point_on_poly_edges(&Vec3::new(2.0, 0.0, 0.5), &square());
        assert!((p - Vec3::new(1.0, 0.0, 0.5)).length() < 1e-6);
    }
}
