//! Image-source path enumeration and per-path pressure.
//!
//! Traced specular reflection histories feed a multitree keyed by triangle
//! index; shared prefixes deduplicate, so each distinct mirror sequence is
//! validated and contributes at most once. A path is valid when the source
//! image reconstructs to an unoccluded chain of in-extent reflections.

use std::collections::BTreeMap;

use crate::geom::{mirror_point, Vec3};
use crate::raytracer::mis::{compute_mis_weights, MisWeights};
use crate::raytracer::{pressure_for_distance, Impulse};
use crate::scene::{bands_splat, Bands, Environment, VoxelisedScene, NUM_BANDS};

#[derive(Debug, Default)]
struct TreeNode {
    children: BTreeMap<u32, TreeNode>,
}

/// Multitree of reflection sequences rooted at the source.
#[derive(Debug, Default)]
pub struct ImageSourceTree {
    root: TreeNode,
    paths: usize,
}

impl ImageSourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a triangle sequence; shared prefixes are deduplicated.
    pub fn push(&mut self, path: &[u32]) {
        let mut node = &mut self.root;
        for &triangle in path {
            node = node.children.entry(triangle).or_default();
        }
        self.paths += 1;
    }

    /// Number of sequences pushed (before deduplication).
    pub fn pushed(&self) -> usize {
        self.paths
    }

    /// Depth-first walk over every distinct prefix in the tree.
    fn walk(&self, mut visit: impl FnMut(&[u32])) {
        fn recurse(node: &TreeNode, stack: &mut Vec<u32>, visit: &mut impl FnMut(&[u32])) {
            for (&triangle, child) in node.children.iter() {
                stack.push(triangle);
                visit(stack);
                recurse(child, stack, visit);
                stack.pop();
            }
        }
        let mut stack = Vec::new();
        recurse(&self.root, &mut stack, &mut visit);
    }
}

/// Angle-dependent per-band pressure reflectance of a surface.
///
/// The per-band reflectance `sqrt(1 - absorption)` maps to an average wall
/// impedance; the reflectance seen at a given incidence angle follows from
/// that impedance.
pub fn angle_reflectance(absorption: &Bands, cos_angle: f32) -> Bands {
    std::array::from_fn(|band| {
        let r = (1.0 - absorption[band].clamp(0.0, 1.0)).sqrt();
        let impedance = (1.0 + r) / (1.0 - r).max(1e-6);
        let tmp = impedance * cos_angle.max(1e-6);
        (tmp - 1.0) / (tmp + 1.0)
    })
}

/// Flat per-band pressure reflectance, used when `flip_phase` is requested.
pub fn flat_reflectance(absorption: &Bands) -> Bands {
    std::array::from_fn(|band| (1.0 - absorption[band].clamp(0.0, 1.0)).sqrt())
}

/// Collects specular reflection histories and evaluates the valid paths.
pub struct ImageSourceProcessor {
    source: Vec3,
    receiver: Vec3,
    max_order: usize,
    mis_weights: MisWeights,
    mis_enabled: bool,
    flip_phase: bool,
    tree: ImageSourceTree,
}

impl ImageSourceProcessor {
    pub fn new(
        source: Vec3,
        receiver: Vec3,
        max_order: usize,
        total_rays: u64,
        mis_delta_pdf: f32,
        flip_phase: bool,
    ) -> Self {
        Self {
            source,
            receiver,
            max_order,
            mis_weights: compute_mis_weights(total_rays, mis_delta_pdf),
            mis_enabled: total_rays != 0,
            flip_phase,
            tree: ImageSourceTree::new(),
        }
    }

    /// Records one ray's reflection history, truncated to the maximum
    /// image-source order.
    pub fn record(&mut self, history: &[u32]) {
        if history.is_empty() {
            return;
        }
        let take = history.len().min(self.max_order);
        self.tree.push(&history[..take]);
    }

    fn mis_weight_for_order(&self, order: usize) -> f32 {
        if !self.mis_enabled {
            return 1.0;
        }
        if order <= self.max_order {
            self.mis_weights.image_source
        } else {
            1.0
        }
    }

    /// Validates every recorded path and returns the impulse list, direct
    /// line-of-sight contribution included.
    pub fn results(&self, voxels: &VoxelisedScene, environment: &Environment) -> Vec<Impulse> {
        let mut impulses = Vec::new();

        self.tree.walk(|path| {
            if let Some(impulse) = self.evaluate_path(path, voxels) {
                let order = path.len();
                let mut weighted = impulse;
                let weight = self.mis_weight_for_order(order);
                for volume in weighted.volume.iter_mut() {
                    *volume *= weight;
                }
                impulses.push(weighted);
            }
        });

        // The line-of-sight contribution is checked separately.
        if voxels
            .line_of_sight(self.source, self.receiver, None, None)
        {
            let mut direct = Impulse {
                volume: bands_splat(1.0),
                position: self.receiver,
                distance: self.source.distance(self.receiver),
            };
            let weight = self.mis_weight_for_order(0);
            for volume in direct.volume.iter_mut() {
                *volume *= weight;
            }
            impulses.push(direct);
        }

        // Correct every impulse for the distance travelled.
        for impulse in impulses.iter_mut() {
            let attenuation =
                pressure_for_distance(impulse.distance, environment.acoustic_impedance);
            for volume in impulse.volume.iter_mut() {
                *volume *= attenuation;
            }
        }

        impulses
    }

    /// Mirrors the source through the path and reconstructs the reflection
    /// chain from the receiver backwards.
    fn evaluate_path(&self, path: &[u32], voxels: &VoxelisedScene) -> Option<Impulse> {
        let scene = voxels.scene();

        // Successive images of the source.
        let mut images = Vec::with_capacity(path.len());
        let mut image = self.source;
        for &triangle in path {
            let (v0, _, _) = scene.triangle_vertices(triangle as usize);
            let normal = scene.triangle_normal(triangle as usize)?;
            image = mirror_point(image, v0, normal);
            images.push(image);
        }

        let mut volume = bands_splat(1.0);
        let mut point = self.receiver;
        let mut point_triangle: Option<u32> = None;

        for (k, &triangle) in path.iter().enumerate().rev() {
            let target = images[k];
            let direction = (target - point).normalize()?;
            let (v0, v1, v2) = scene.triangle_vertices(triangle as usize);
            let t = crate::geom::intersect_triangle(point, direction, v0, v1, v2)?;
            let hit = point + direction * t;

            // The segment to the reflection point must be unoccluded.
            if !voxels.line_of_sight(point, hit, point_triangle, Some(triangle)) {
                return None;
            }

            let normal = scene.triangle_normal(triangle as usize)?;
            let cos_angle = direction.dot(normal).abs();
            let surface = scene.triangle_surface(triangle as usize);
            let reflectance = if self.flip_phase {
                flat_reflectance(&surface.absorption)
            } else {
                angle_reflectance(&surface.absorption, cos_angle)
            };
            for band in 0..NUM_BANDS {
                volume[band] *= reflectance[band];
            }

            point = hit;
            point_triangle = Some(triangle);
        }

        // Final segment back to the real source.
        if !voxels.line_of_sight(point, self.source, point_triangle, None) {
            return None;
        }

        Some(Impulse {
            volume,
            position: self.receiver,
            // The unfolded path length is the distance to the deepest image.
            distance: self.receiver.distance(*images.last()?),
        })
    }
}
