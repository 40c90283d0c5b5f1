//! Vector utilities working on the xz plane

use glam::Vec3;

/// Calculates the distance between two points ignoring height
#[inline]
pub fn dist_2d(a: &Vec3, b: &Vec3) -> f32 {
    dist_sqr_2d(a, b).sqrt()
}

/// Calculates the squared distance between two points ignoring height
#[inline]
pub fn dist_sqr_2d(a: &Vec3, b: &Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

/// Dot product on the xz plane
#[inline]
pub fn dot_2d(u: &Vec3, v: &Vec3) -> f32 {
    u.x * v.x + u.z * v.z
}

/// Perp-dot product on the xz plane
#[inline]
pub fn perp_2d(u: &Vec3, v: &Vec3) -> f32 {
    u.z * v.x - u.x * v.z
}

/// Length of a vector on the xz plane
#[inline]
pub fn length_2d(v: &Vec3) -> f32 {
    (v.x * v.x + v.z * v.z).sqrt()
}

/// Normalizes a vector on the xz plane, dropping its height.
/// Returns zero for degenerate input.
pub fn normalize_2d(v: &Vec3) -> Vec3 {
    let len = length_2d(v);
    if len > f32::EPSILON {
        Vec3::new(v.x / len, 0.0, v.z / len)
    } else {
        Vec3::ZERO
    }
}

/// Rotates a vector around the y axis
#[inline]
pub fn rotate_2d(v: &Vec3, angle: f32) -> Vec3 {
    let (s, c) = angle.sin_cos();
    Vec3::new(v.x * c - v.z * s, v.y, v.x * s + v.z * c)
}

/// Clamps the length of a vector to `max_len`
pub fn clamp_length(v: &Vec3, max_len: f32) -> Vec3 {
    let len_sq = v.length_squared();
    if len_sq > max_len * max_len && len_sq > 0.0 {
        *v * (max_len / len_sq.sqrt())
    } else {
        *v
    }
}

/// Linear interpolation factor of `t` in `[t0, t1]`, clamped to `[0, 1]`
#[inline]
pub fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if t1 - t0 <= f32::EPSILON {
        return 1.0;
    }
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}

/// Returns true if two points are within a small tolerance of each other
#[inline]
pub fn vequal(a: &Vec3, b: &Vec3) -> bool {
    const THR: f32 = (1.0 / 16384.0) * (1.0 / 16384.0);
    a.distance_squared(*b) < THR
}
