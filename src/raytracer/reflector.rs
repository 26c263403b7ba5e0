//! Batch ray reflection against the voxelised scene.
//!
//! All random numbers are drawn on the driver thread before the parallel
//! bounce so that results do not depend on work scheduling; given the same
//! seed the reflection sequence is bit-reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::geom::{Ray, Vec3};
use crate::scene::{bands_mean, VoxelisedScene};
use crate::scene::voxels::NO_TRIANGLE;

/// Result of one bounce of one ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reflection {
    /// Hit position (the next secondary source).
    pub position: Vec3,
    /// Hit triangle index, or [`NO_TRIANGLE`].
    pub triangle: u32,
    /// Mean scattering of the hit surface.
    pub scatter_probability: f32,
    /// False once the ray has left the scene or died.
    pub keep_going: bool,
    /// Whether the receiver is visible from the hit point.
    pub receiver_visible: bool,
    /// Whether this bounce sampled the diffuse lobe.
    pub sampled_diffuse: bool,
    /// Pdf of the sampled outgoing direction.
    pub sample_pdf: f32,
    /// |n . outgoing| for diffuse samples, |n . incoming| for specular.
    pub cos_theta: f32,
}

impl Reflection {
    fn start() -> Self {
        Self {
            position: Vec3::ZERO,
            triangle: NO_TRIANGLE,
            scatter_probability: 0.0,
            keep_going: true,
            receiver_visible: false,
            sampled_diffuse: false,
            sample_pdf: 1.0,
            cos_theta: 0.0,
        }
    }

    fn dead() -> Self {
        Self {
            keep_going: false,
            ..Self::start()
        }
    }
}

/// Uniformly distributed unit vector, by rejection sampling.
fn random_unit_vector(rng: &mut impl Rng) -> Vec3 {
    loop {
        let x: f32 = rng.gen_range(-1.0..1.0);
        let y: f32 = rng.gen_range(-1.0..1.0);
        let z: f32 = rng.gen_range(-1.0..1.0);
        let len2 = x * x + y * y + z * z;
        if len2 > 1e-6 && len2 <= 1.0 {
            let len = len2.sqrt();
            return Vec3::new(x / len, y / len, z / len);
        }
    }
}

fn build_tangent(normal: Vec3) -> Vec3 {
    let up = if normal.z.abs() < 0.999 {
        Vec3::new(0.0, 0.0, 1.0)
    } else {
        Vec3::new(0.0, 1.0, 0.0)
    };
    up.cross(normal).normalize().unwrap_or(Vec3::new(1.0, 0.0, 0.0))
}

/// Cosine-weighted direction about `normal`; returns the direction and its
/// cosine with the normal.
fn cosine_weighted_direction(normal: Vec3, u1: f32, u2: f32) -> (Vec3, f32) {
    let phi = 2.0 * std::f32::consts::PI * (u1 - u1.floor());
    let r = u2.clamp(0.0, 1.0).sqrt();
    let x = r * phi.cos();
    let y = r * phi.sin();
    let z = (1.0 - u2.clamp(0.0, 1.0)).max(0.0).sqrt();
    let tangent = build_tangent(normal);
    let bitangent = normal.cross(tangent);
    let world = (tangent * x + bitangent * y + normal * z)
        .normalize()
        .unwrap_or(normal);
    (world, world.dot(normal).max(0.0))
}

/// Traces a fixed set of rays one bounce at a time.
pub struct Reflector {
    rays: Vec<Ray>,
    reflections: Vec<Reflection>,
    receiver: Vec3,
    rng: StdRng,
    uniforms: Vec<f32>,
}

impl Reflector {
    /// Shoots `num_rays` rays from the source in uniformly random
    /// directions drawn from the seeded generator.
    pub fn new(source: Vec3, receiver: Vec3, num_rays: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let rays = (0..num_rays)
            .map(|_| Ray {
                position: source,
                direction: random_unit_vector(&mut rng),
            })
            .collect();
        Self {
            rays,
            reflections: vec![Reflection::start(); num_rays],
            receiver,
            rng,
            uniforms: vec![0.0; num_rays * 3],
        }
    }

    /// Initial ray directions (for diagnostics and tests).
    pub fn rays(&self) -> &[Ray] {
        &self.rays
    }

    /// Number of rays still alive.
    pub fn alive(&self) -> usize {
        self.reflections.iter().filter(|r| r.keep_going).count()
    }

    /// Advances every live ray by one bounce.
    pub fn run_step(&mut self, voxels: &VoxelisedScene) -> &[Reflection] {
        for value in self.uniforms.iter_mut() {
            *value = self.rng.gen_range(0.0..1.0);
        }

        let receiver = self.receiver;
        let reach = voxels.aabb().diagonal() * 2.0;

        self.rays
            .par_iter_mut()
            .zip(self.reflections.par_iter_mut())
            .zip(self.uniforms.par_chunks(3))
            .for_each(|((ray, reflection), uniforms)| {
                if !reflection.keep_going {
                    *reflection = Reflection::dead();
                    return;
                }
                let previous_triangle =
                    (reflection.triangle != NO_TRIANGLE).then_some(reflection.triangle);

                let Some((triangle, t)) =
                    voxels.closest_intersection(ray, reach, previous_triangle)
                else {
                    *reflection = Reflection::dead();
                    return;
                };

                let hit = ray.point_at(t);
                let scene = voxels.scene();
                let Some(mut normal) = scene.triangle_normal(triangle as usize) else {
                    *reflection = Reflection::dead();
                    return;
                };
                // The shading normal opposes the incoming direction.
                if normal.dot(ray.direction) > 0.0 {
                    normal = -normal;
                }

                let receiver_visible =
                    voxels.line_of_sight(hit, receiver, Some(triangle), None);

                let surface = scene.triangle_surface(triangle as usize);
                let scatter_probability = bands_mean(&surface.scattering).clamp(0.0, 1.0);

                let sampled_diffuse =
                    scatter_probability > 0.0 && uniforms[0] < scatter_probability;

                let specular = ray.direction.reflect(normal);
                let (outgoing, sample_pdf, cos_theta) = if sampled_diffuse {
                    let (direction, cos) =
                        cosine_weighted_direction(normal, uniforms[1], uniforms[2]);
                    let pdf = (cos / std::f32::consts::PI).max(1e-6);
                    (direction, pdf, cos)
                } else {
                    (specular, 1.0, ray.direction.dot(normal).abs())
                };

                *reflection = Reflection {
                    position: hit,
                    triangle,
                    scatter_probability,
                    keep_going: true,
                    receiver_visible,
                    sampled_diffuse,
                    sample_pdf,
                    cos_theta,
                };
                *ray = Ray {
                    position: hit,
                    direction: outgoing,
                };
            });

        &self.reflections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Scene, Surface};

    fn box_voxels(scattering: f32) -> VoxelisedScene {
        let scene = Scene::shoebox(4.0, 4.0, 4.0, Surface::uniform(0.1, scattering));
        VoxelisedScene::new(scene, 8, 0.1)
    }

    #[test]
    fn test_rays_start_on_unit_sphere() {
        let reflector = Reflector::new(Vec3::new(2.0, 2.0, 2.0), Vec3::new(1.0, 1.0, 1.0), 64, 1);
        for ray in reflector.rays() {
            assert!((ray.direction.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_all_rays_hit_inside_a_closed_box() {
        let voxels = box_voxels(0.0);
        let mut reflector =
            Reflector::new(Vec3::new(2.0, 2.0, 2.0), Vec3::new(1.0, 1.0, 1.0), 128, 7);
        let reflections = reflector.run_step(&voxels);
        assert!(reflections.iter().all(|r| r.keep_going));
        assert!(reflections
            .iter()
            .all(|r| r.triangle != NO_TRIANGLE && r.position.is_finite()));
        // Everything is visible from everywhere in an empty box.
        assert!(reflections.iter().all(|r| r.receiver_visible));
    }

    #[test]
    fn test_zero_scattering_samples_specular_only() {
        let voxels = box_voxels(0.0);
        let mut reflector =
            Reflector::new(Vec3::new(2.0, 2.0, 2.0), Vec3::new(1.0, 1.0, 1.0), 64, 3);
        for _ in 0..4 {
            let reflections = reflector.run_step(&voxels);
            assert!(reflections
                .iter()
                .filter(|r| r.keep_going)
                .all(|r| !r.sampled_diffuse && r.sample_pdf == 1.0));
        }
    }

    #[test]
    fn test_full_scattering_samples_diffuse() {
        let voxels = box_voxels(1.0);
        let mut reflector =
            Reflector::new(Vec3::new(2.0, 2.0, 2.0), Vec3::new(1.0, 1.0, 1.0), 64, 3);
        let reflections = reflector.run_step(&voxels);
        for r in reflections.iter().filter(|r| r.keep_going) {
            assert!(r.sampled_diffuse);
            assert!(r.sample_pdf > 0.0);
            assert!(r.cos_theta >= 0.0);
        }
    }

    #[test]
    fn test_same_seed_is_bit_reproducible() {
        let voxels = box_voxels(0.5);
        let run = |seed: u64| {
            let mut reflector =
                Reflector::new(Vec3::new(2.0, 2.0, 2.0), Vec3::new(1.0, 1.0, 1.0), 32, seed);
            let mut all = Vec::new();
            for _ in 0..3 {
                all.extend_from_slice(reflector.run_step(&voxels));
            }
            all
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn test_cosine_sample_points_into_hemisphere() {
        let normal = Vec3::new(0.0, 0.0, 1.0);
        for i in 0..64 {
            let u1 = (i as f32) / 64.0;
            let u2 = ((i * 7) % 64) as f32 / 64.0;
            let (direction, cos) = cosine_weighted_direction(normal, u1, u2);
            assert!(direction.dot(normal) >= -1e-6);
            assert!((cos - direction.dot(normal).max(0.0)).abs() < 1e-5);
        }
    }
}
