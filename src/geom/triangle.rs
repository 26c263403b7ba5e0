//! Indexed triangles and ray/point queries against them.

use super::Vec3;

/// Barycentric tolerance for ray-triangle intersection.
///
/// Rays grazing a shared edge must still register a hit on at least one of
/// the adjacent triangles.
pub const BARY_TOLERANCE: f32 = 1e-4;

/// A triangle referencing the scene vertex list, tagged with a surface index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triangle {
    /// Indices into the scene vertex list.
    pub vertices: [u32; 3],
    /// Index into the scene surface table.
    pub surface: u32,
}

impl Triangle {
    pub fn new(vertices: [u32; 3], surface: u32) -> Self {
        Self { vertices, surface }
    }
}

/// Moller-Trumbore ray-triangle intersection with barycentric tolerance.
///
/// Returns the ray parameter `t > eps`, or `None`.
pub fn intersect_triangle(
    origin: Vec3,
    direction: Vec3,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
) -> Option<f32> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - v0;
    let u = s.dot(p) * inv_det;
    if !(-BARY_TOLERANCE..=1.0 + BARY_TOLERANCE).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = direction.dot(q) * inv_det;
    if v < -BARY_TOLERANCE || u + v > 1.0 + BARY_TOLERANCE {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t > 1e-6 {
        Some(t)
    } else {
        None
    }
}

/// Unit normal of a triangle, or `None` for a degenerate one.
pub fn triangle_normal(v0: Vec3, v1: Vec3, v2: Vec3) -> Option<Vec3> {
    (v1 - v0).cross(v2 - v0).normalize()
}

/// Mirror image of a point across the plane of a triangle.
pub fn mirror_point(p: Vec3, v0: Vec3, normal: Vec3) -> Vec3 {
    p - normal * (2.0 * normal.dot(p - v0))
}

/// Squared distance from a point to a triangle.
pub fn point_triangle_distance_sq(p: Vec3, v0: Vec3, v1: Vec3, v2: Vec3) -> f32 {
    // Project onto the plane, then clamp to the closest feature.
    let e0 = v1 - v0;
    let e1 = v2 - v0;
    let d = v0 - p;

    let a = e0.dot(e0);
    let b = e0.dot(e1);
    let c = e1.dot(e1);
    let d0 = e0.dot(d);
    let d1 = e1.dot(d);

    let det = a * c - b * b;
    let mut s = b * d1 - c * d0;
    let mut t = b * d0 - a * d1;

    if s + t <= det {
        if s < 0.0 {
            if t < 0.0 {
                // Region near v0.
                s = (-d0 / a.max(1e-20)).clamp(0.0, 1.0);
                t = 0.0;
                let alt = (-d1 / c.max(1e-20)).clamp(0.0, 1.0);
                let p_s = v0 + e0 * s;
                let p_t = v0 + e1 * alt;
                return (p - p_s).length_sq().min((p - p_t).length_sq());
            }
            s = 0.0;
            t = (-d1 / c.max(1e-20)).clamp(0.0, 1.0);
        } else if t < 0.0 {
            t = 0.0;
            s = (-d0 / a.max(1e-20)).clamp(0.0, 1.0);
        } else if det.abs() > 1e-20 {
            let inv = 1.0 / det;
            s *= inv;
            t *= inv;
        } else {
            s = 0.0;
            t = 0.0;
        }
    } else {
        // Region beyond the v1-v2 edge.
        let tmp0 = b + d0;
        let tmp1 = c + d1;
        if tmp1 > tmp0 {
            let numer = tmp1 - tmp0;
            let denom = a - 2.0 * b + c;
            s = (numer / denom.max(1e-20)).clamp(0.0, 1.0);
            t = 1.0 - s;
        } else {
            s = 0.0;
            t = (if tmp1 <= 0.0 {
                1.0
            } else {
                (-d1 / c.max(1e-20)).clamp(0.0, 1.0)
            }) as f32;
        }
    }

    let closest = v0 + e0 * s + e1 * t;
    (p - closest).length_sq()
}
