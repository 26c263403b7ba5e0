//! Voxelised scene: a uniform grid of triangle lists with 3D-DDA traversal.
//!
//! Shared read-only by the waveguide mesh builder and the ray tracer.

use std::collections::HashSet;

use crate::geom::{intersect_triangle, Aabb, Ray, Vec3};
use crate::scene::Scene;

/// Sentinel for "no triangle".
pub const NO_TRIANGLE: u32 = u32::MAX;

/// A uniform `side^3` grid over the (padded) scene bounding box, with a list
/// of overlapping triangle indices per voxel.
#[derive(Debug, Clone)]
pub struct VoxelisedScene {
    scene: Scene,
    aabb: Aabb,
    side: u32,
    voxels: Vec<Vec<u32>>,
}

impl VoxelisedScene {
    /// Voxelises a scene over its bounding box expanded by `padding` metres.
    pub fn new(scene: Scene, side: u32, padding: f32) -> Self {
        let side = side.max(1);
        let aabb = scene
            .aabb()
            .unwrap_or(Aabb::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0)))
            .padded(padding.max(1e-3));

        let mut voxels = vec![Vec::new(); (side * side * side) as usize];
        let voxel_dims = aabb.extent() / side as f32;

        for (tri_idx, _) in scene.triangles.iter().enumerate() {
            let (v0, v1, v2) = scene.triangle_vertices(tri_idx);
            let tri_aabb = Aabb::from_points(&[v0, v1, v2]).expect("triangle has three vertices");

            let lo = Self::clamped_cell(&aabb, voxel_dims, side, tri_aabb.min);
            let hi = Self::clamped_cell(&aabb, voxel_dims, side, tri_aabb.max);
            for x in lo[0]..=hi[0] {
                for y in lo[1]..=hi[1] {
                    for z in lo[2]..=hi[2] {
                        let cell = (x + side * (y + side * z)) as usize;
                        voxels[cell].push(tri_idx as u32);
                    }
                }
            }
        }

        Self {
            scene,
            aabb,
            side,
            voxels,
        }
    }

    /// Voxelises with a grid side derived from the triangle count.
    pub fn with_default_side(scene: Scene, padding: f32) -> Self {
        let side = ((scene.triangles.len() as f32).cbrt().ceil() as u32 * 2).clamp(4, 64);
        Self::new(scene, side, padding)
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn aabb(&self) -> &Aabb {
        &self.aabb
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn voxel_dims(&self) -> Vec3 {
        self.aabb.extent() / self.side as f32
    }

    /// Triangle indices stored in one voxel cell.
    pub fn voxel(&self, x: u32, y: u32, z: u32) -> &[u32] {
        &self.voxels[(x + self.side * (y + self.side * z)) as usize]
    }

    fn clamped_cell(aabb: &Aabb, voxel_dims: Vec3, side: u32, p: Vec3) -> [u32; 3] {
        let rel = p - aabb.min;
        let to_cell = |r: f32, d: f32| -> u32 {
            if d <= 0.0 {
                return 0;
            }
            ((r / d).floor().max(0.0) as u32).min(side - 1)
        };
        [
            to_cell(rel.x, voxel_dims.x),
            to_cell(rel.y, voxel_dims.y),
            to_cell(rel.z, voxel_dims.z),
        ]
    }

    /// Closest triangle intersected by the ray within `max_dist`.
    ///
    /// `skip` excludes one triangle (typically the one the ray starts on).
    /// Marches voxels front-to-back and stops as soon as the best hit lies
    /// within the already-traversed span.
    pub fn closest_intersection(
        &self,
        ray: &Ray,
        max_dist: f32,
        skip: Option<u32>,
    ) -> Option<(u32, f32)> {
        let mut best: Option<(u32, f32)> = None;
        self.walk_voxels(ray, max_dist, |tri_indices, t_exit| {
            for &tri in tri_indices {
                if Some(tri) == skip {
                    continue;
                }
                let (v0, v1, v2) = self.scene.triangle_vertices(tri as usize);
                if let Some(t) = intersect_triangle(ray.position, ray.direction, v0, v1, v2) {
                    if t <= max_dist && best.map(|(_, bt)| t < bt).unwrap_or(true) {
                        best = Some((tri, t));
                    }
                }
            }
            // Stop once the best hit cannot be beaten by a later voxel.
            matches!(best, Some((_, bt)) if bt <= t_exit)
        });
        best
    }

    /// Whether the straight segment between two points is unoccluded.
    ///
    /// `skip_a` / `skip_b` exclude the triangles the endpoints lie on.
    /// A millimetre guard band at both endpoints keeps points that sit on
    /// a surface from shadowing themselves through a coplanar neighbour.
    pub fn line_of_sight(&self, a: Vec3, b: Vec3, skip_a: Option<u32>, skip_b: Option<u32>) -> bool {
        const ENDPOINT_GUARD: f32 = 1e-3;
        let dist = a.distance(b);
        let Some(ray) = Ray::between(a, b) else {
            return true;
        };
        let limit = dist - ENDPOINT_GUARD;
        let mut blocked = false;
        self.walk_voxels(&ray, limit, |tri_indices, _| {
            for &tri in tri_indices {
                if Some(tri) == skip_a || Some(tri) == skip_b {
                    continue;
                }
                let (v0, v1, v2) = self.scene.triangle_vertices(tri as usize);
                if let Some(t) = intersect_triangle(ray.position, ray.direction, v0, v1, v2) {
                    if t > ENDPOINT_GUARD && t < limit {
                        blocked = true;
                        return true;
                    }
                }
            }
            false
        });
        !blocked
    }

    /// Parity of surface crossings along an (arbitrary) fixed direction.
    ///
    /// Odd parity means the point is inside the watertight geometry. Hits
    /// at (nearly) the same ray parameter are one surface crossing: a ray
    /// grazing a shared edge or a quad diagonal registers on both adjacent
    /// triangles but only passes through the surface once.
    pub fn is_inside(&self, point: Vec3) -> bool {
        let dir = Vec3::new(0.299, 0.587, 0.755).normalize().expect("non-zero");
        let ray = Ray {
            position: point,
            direction: dir,
        };
        let max_dist = self.aabb.diagonal() + 1.0;

        let mut seen: HashSet<u32> = HashSet::new();
        let mut hit_params: Vec<f32> = Vec::new();
        self.walk_voxels(&ray, max_dist, |tri_indices, _| {
            for &tri in tri_indices {
                if seen.contains(&tri) {
                    continue;
                }
                let (v0, v1, v2) = self.scene.triangle_vertices(tri as usize);
                if let Some(t) = intersect_triangle(ray.position, ray.direction, v0, v1, v2) {
                    seen.insert(tri);
                    hit_params.push(t);
                }
            }
            false
        });

        hit_params.sort_by(|a, b| a.partial_cmp(b).expect("finite ray parameters"));
        let mut crossings = 0usize;
        let mut last: Option<f32> = None;
        for t in hit_params {
            if last.map(|prev| t - prev > 1e-3).unwrap_or(true) {
                crossings += 1;
            }
            last = Some(t);
        }
        crossings % 2 == 1
    }

    /// 3D-DDA march over voxel cells along a ray.
    ///
    /// Calls `visit(triangles_in_cell, t_exit_of_cell)` per cell, in
    /// front-to-back order; the visitor returns `true` to stop.
    fn walk_voxels(&self, ray: &Ray, max_dist: f32, mut visit: impl FnMut(&[u32], f32) -> bool) {
        let dims = self.voxel_dims();
        let side = self.side as i64;

        // Advance the origin to the box entry if it starts outside.
        let mut t_start = 0.0f32;
        if !self.aabb.contains(ray.position, 0.0) {
            match slab_entry(&self.aabb, ray) {
                Some(t) if t <= max_dist => t_start = t + 1e-5,
                _ => return,
            }
        }
        let entry = ray.point_at(t_start);

        let rel = entry - self.aabb.min;
        let mut cell = [
            ((rel.x / dims.x).floor() as i64).clamp(0, side - 1),
            ((rel.y / dims.y).floor() as i64).clamp(0, side - 1),
            ((rel.z / dims.z).floor() as i64).clamp(0, side - 1),
        ];

        let dir = [ray.direction.x, ray.direction.y, ray.direction.z];
        let dim = [dims.x, dims.y, dims.z];
        let min = [self.aabb.min.x, self.aabb.min.y, self.aabb.min.z];
        let pos = [ray.position.x, ray.position.y, ray.position.z];

        let mut step = [0i64; 3];
        let mut t_max = [f32::INFINITY; 3];
        let mut t_delta = [f32::INFINITY; 3];
        for axis in 0..3 {
            if dir[axis] > 1e-12 {
                step[axis] = 1;
                let next_plane = min[axis] + (cell[axis] + 1) as f32 * dim[axis];
                t_max[axis] = (next_plane - pos[axis]) / dir[axis];
                t_delta[axis] = dim[axis] / dir[axis];
            } else if dir[axis] < -1e-12 {
                step[axis] = -1;
                let plane = min[axis] + cell[axis] as f32 * dim[axis];
                t_max[axis] = (plane - pos[axis]) / dir[axis];
                t_delta[axis] = -dim[axis] / dir[axis];
            }
        }

        loop {
            let t_exit = t_max[0].min(t_max[1]).min(t_max[2]);
            let idx = (cell[0] + side * (cell[1] + side * cell[2])) as usize;
            if visit(&self.voxels[idx], t_exit) {
                return;
            }
            if t_exit > max_dist {
                return;
            }
            // Step into the next voxel along the nearest crossing plane.
            let axis = if t_max[0] <= t_max[1] && t_max[0] <= t_max[2] {
                0
            } else if t_max[1] <= t_max[2] {
                1
            } else {
                2
            };
            cell[axis] += step[axis];
            if cell[axis] < 0 || cell[axis] >= side {
                return;
            }
            t_max[axis] += t_delta[axis];
        }
    }
}

/// Ray parameter at which the ray enters the box, if it does.
fn slab_entry(aabb: &Aabb, ray: &Ray) -> Option<f32> {
    let mut t_near = f32::NEG_INFINITY;
    let mut t_far = f32::INFINITY;
    let pos = [ray.position.x, ray.position.y, ray.position.z];
    let dir = [ray.direction.x, ray.direction.y, ray.direction.z];
    let lo = [aabb.min.x, aabb.min.y, aabb.min.z];
    let hi = [aabb.max.x, aabb.max.y, aabb.max.z];
    for axis in 0..3 {
        if dir[axis].abs() < 1e-12 {
            if pos[axis] < lo[axis] || pos[axis] > hi[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / dir[axis];
        let (t0, t1) = {
            let a = (lo[axis] - pos[axis]) * inv;
            let b = (hi[axis] - pos[axis]) * inv;
            if a < b {
                (a, b)
            } else {
                (b, a)
            }
        };
        t_near = t_near.max(t0);
        t_far = t_far.min(t1);
        if t_near > t_far || t_far < 0.0 {
            return None;
        }
    }
    Some(t_near.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Surface;

    fn shoebox_voxels() -> VoxelisedScene {
        let scene = Scene::shoebox(2.0, 2.0, 2.0, Surface::rigid());
        VoxelisedScene::new(scene, 8, 0.1)
    }

    #[test]
    fn test_closest_intersection_from_centre() {
        let voxels = shoebox_voxels();
        let ray = Ray::new(Vec3::new(1.0, 1.0, 1.0), Vec3::new(1.0, 0.0, 0.0)).unwrap();
        let (tri, t) = voxels.closest_intersection(&ray, 100.0, None).unwrap();
        assert!((t - 1.0).abs() < 1e-4, "wall at x=2 is 1 m away, got {t}");
        assert!((tri as usize) < voxels.scene().triangles.len());
    }

    #[test]
    fn test_closest_intersection_from_outside() {
        let voxels = shoebox_voxels();
        let ray = Ray::new(Vec3::new(1.0, 1.0, 50.0), Vec3::new(0.0, 0.0, -1.0)).unwrap();
        let (_, t) = voxels.closest_intersection(&ray, 100.0, None).unwrap();
        assert!((t - 48.0).abs() < 0.01, "ceiling at z=2, got t={t}");
    }

    #[test]
    fn test_miss_returns_none() {
        let voxels = shoebox_voxels();
        let ray = Ray::new(Vec3::new(1.0, 1.0, 50.0), Vec3::new(0.0, 0.0, 1.0)).unwrap();
        assert!(voxels.closest_intersection(&ray, 100.0, None).is_none());
    }

    #[test]
    fn test_is_inside() {
        let voxels = shoebox_voxels();
        assert!(voxels.is_inside(Vec3::new(1.0, 1.0, 1.0)));
        assert!(voxels.is_inside(Vec3::new(0.2, 1.8, 0.3)));
        assert!(!voxels.is_inside(Vec3::new(3.0, 1.0, 1.0)));
        assert!(!voxels.is_inside(Vec3::new(-0.5, -0.5, -0.5)));
    }

    #[test]
    fn test_line_of_sight_inside_room() {
        let voxels = shoebox_voxels();
        assert!(voxels.line_of_sight(
            Vec3::new(0.5, 0.5, 0.5),
            Vec3::new(1.5, 1.5, 1.5),
            None,
            None
        ));
        // A segment leaving the room crosses a wall.
        assert!(!voxels.line_of_sight(
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(5.0, 1.0, 1.0),
            None,
            None
        ));
    }

    #[test]
    fn test_skip_triangle_is_honoured() {
        let voxels = shoebox_voxels();
        let ray = Ray::new(Vec3::new(1.0, 1.0, 1.0), Vec3::new(1.0, 0.0, 0.0)).unwrap();
        let (tri, _) = voxels.closest_intersection(&ray, 100.0, None).unwrap();
        // From a point on that wall, looking along the wall-normal direction
        // back into the room, the skipped triangle must not self-intersect.
        let hit = ray.point_at(1.0);
        let back = Ray::new(hit, Vec3::new(-1.0, 0.0, 0.0)).unwrap();
        let (other, t) = voxels.closest_intersection(&back, 100.0, Some(tri)).unwrap();
        assert_ne!(other, tri);
        assert!((t - 2.0).abs() < 1e-3, "opposite wall is 2 m away, got {t}");
    }
}
