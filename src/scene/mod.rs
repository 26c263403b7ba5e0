//! Immutable scene description: triangles, surfaces and frequency bands.

pub mod precomputed;
pub mod voxels;

pub use voxels::VoxelisedScene;

use crate::geom::{triangle_normal, Aabb, Triangle, Vec3};

/// Number of octave bands used throughout the engine (62.5 Hz to 8 kHz).
pub const NUM_BANDS: usize = 8;

/// Centre frequencies of the octave bands in Hz.
pub const BAND_CENTRES_HZ: [f64; NUM_BANDS] = [
    62.5, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0,
];

/// Per-band values (energy, pressure, coefficients).
pub type Bands = [f32; NUM_BANDS];

/// Band edges in Hz: `edges[k]..edges[k+1]` bounds band `k`.
pub fn band_edges_hz() -> [f64; NUM_BANDS + 1] {
    let mut edges = [0.0; NUM_BANDS + 1];
    let sqrt2 = std::f64::consts::SQRT_2;
    for (k, &centre) in BAND_CENTRES_HZ.iter().enumerate() {
        edges[k] = centre / sqrt2;
    }
    edges[NUM_BANDS] = BAND_CENTRES_HZ[NUM_BANDS - 1] * sqrt2;
    edges
}

/// All bands set to the same value.
pub fn bands_splat(value: f32) -> Bands {
    [value; NUM_BANDS]
}

/// Elementwise product.
pub fn bands_mul(a: &Bands, b: &Bands) -> Bands {
    std::array::from_fn(|i| a[i] * b[i])
}

/// Product with a scalar.
pub fn bands_scale(a: &Bands, scalar: f32) -> Bands {
    std::array::from_fn(|i| a[i] * scalar)
}

/// Elementwise sum accumulated into `a`.
pub fn bands_add_assign(a: &mut Bands, b: &Bands) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
}

pub fn bands_sum(a: &Bands) -> f32 {
    a.iter().sum()
}

pub fn bands_mean(a: &Bands) -> f32 {
    bands_sum(a) / NUM_BANDS as f32
}

/// Acoustic surface with per-band absorption and scattering in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    pub absorption: Bands,
    pub scattering: Bands,
}

impl Surface {
    pub fn new(absorption: Bands, scattering: Bands) -> Self {
        Self {
            absorption,
            scattering,
        }
    }

    /// Surface with uniform absorption and scattering across all bands.
    pub fn uniform(absorption: f32, scattering: f32) -> Self {
        Self {
            absorption: bands_splat(absorption),
            scattering: bands_splat(scattering),
        }
    }

    /// Perfectly reflective, purely specular surface.
    pub fn rigid() -> Self {
        Self::uniform(0.0, 0.0)
    }
}

/// Acoustic medium parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    /// Speed of sound in m/s.
    pub speed_of_sound: f64,
    /// Characteristic acoustic impedance in Pa*s/m.
    pub acoustic_impedance: f64,
    /// Ambient density in kg/m^3.
    pub ambient_density: f64,
}

impl Default for Environment {
    fn default() -> Self {
        let speed_of_sound = 340.0;
        let acoustic_impedance = 400.0;
        Self {
            speed_of_sound,
            acoustic_impedance,
            ambient_density: acoustic_impedance / speed_of_sound,
        }
    }
}

/// An immutable triangle scene.
#[derive(Debug, Clone)]
pub struct Scene {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<Triangle>,
    pub surfaces: Vec<Surface>,
}

impl Scene {
    pub fn new(vertices: Vec<Vec3>, triangles: Vec<Triangle>, surfaces: Vec<Surface>) -> Self {
        Self {
            vertices,
            triangles,
            surfaces,
        }
    }

    /// Axis-aligned shoebox room with one surface on all walls.
    ///
    /// The box spans `(0, 0, 0)` to `(width, depth, height)`.
    pub fn shoebox(width: f32, depth: f32, height: f32, surface: Surface) -> Self {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(width, 0.0, 0.0),
            Vec3::new(width, depth, 0.0),
            Vec3::new(0.0, depth, 0.0),
            Vec3::new(0.0, 0.0, height),
            Vec3::new(width, 0.0, height),
            Vec3::new(width, depth, height),
            Vec3::new(0.0, depth, height),
        ];
        // Two triangles per face, wound so the normals face inward.
        let faces: [[u32; 4]; 6] = [
            [0, 1, 2, 3], // floor
            [4, 7, 6, 5], // ceiling
            [0, 4, 5, 1], // y = 0
            [2, 6, 7, 3], // y = depth
            [0, 3, 7, 4], // x = 0
            [1, 5, 6, 2], // x = width
        ];
        let mut triangles = Vec::with_capacity(12);
        for quad in faces {
            triangles.push(Triangle::new([quad[0], quad[1], quad[2]], 0));
            triangles.push(Triangle::new([quad[0], quad[2], quad[3]], 0));
        }
        Self::new(vertices, triangles, vec![surface])
    }

    /// Vertices of one triangle.
    pub fn triangle_vertices(&self, index: usize) -> (Vec3, Vec3, Vec3) {
        let t = &self.triangles[index];
        (
            self.vertices[t.vertices[0] as usize],
            self.vertices[t.vertices[1] as usize],
            self.vertices[t.vertices[2] as usize],
        )
    }

    /// Unit normal of one triangle (degenerate triangles yield `None`).
    pub fn triangle_normal(&self, index: usize) -> Option<Vec3> {
        let (v0, v1, v2) = self.triangle_vertices(index);
        triangle_normal(v0, v1, v2)
    }

    /// Surface of one triangle; out-of-range surface indices map to a
    /// neutral surface rather than panicking.
    pub fn triangle_surface(&self, index: usize) -> Surface {
        let surface_idx = self.triangles[index].surface as usize;
        self.surfaces
            .get(surface_idx)
            .copied()
            .unwrap_or_else(Surface::rigid)
    }

    /// Bounding box of all vertices.
    pub fn aabb(&self) -> Option<Aabb> {
        Aabb::from_points(&self.vertices)
    }

    /// Total surface area in m^2.
    pub fn total_area(&self) -> f64 {
        (0..self.triangles.len())
            .map(|i| {
                let (v0, v1, v2) = self.triangle_vertices(i);
                0.5 * (v1 - v0).cross(v2 - v0).length() as f64
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_edges_bracket_centres() {
        let edges = band_edges_hz();
        for (k, &centre) in BAND_CENTRES_HZ.iter().enumerate() {
            assert!(
                edges[k] < centre && centre < edges[k + 1],
                "band {k}: {} not in ({}, {})",
                centre,
                edges[k],
                edges[k + 1]
            );
        }
    }

    #[test]
    fn test_bands_helpers() {
        let a = bands_splat(2.0);
        let b = bands_splat(3.0);
        assert_eq!(bands_mul(&a, &b), bands_splat(6.0));
        assert_eq!(bands_scale(&a, 0.5), bands_splat(1.0));
        assert!((bands_mean(&a) - 2.0).abs() < 1e-6);
        let mut c = bands_splat(1.0);
        bands_add_assign(&mut c, &a);
        assert_eq!(c, bands_splat(3.0));
    }

    #[test]
    fn test_shoebox_geometry() {
        let scene = Scene::shoebox(2.0, 3.0, 4.0, Surface::uniform(0.1, 0.2));
        assert_eq!(scene.triangles.len(), 12);
        let aabb = scene.aabb().unwrap();
        assert_eq!(aabb.max, Vec3::new(2.0, 3.0, 4.0));
        // 2*(2*3 + 2*4 + 3*4) = 52
        assert!((scene.total_area() - 52.0).abs() < 1e-4);
    }

    #[test]
    fn test_shoebox_normals_face_inward() {
        let scene = Scene::shoebox(2.0, 2.0, 2.0, Surface::rigid());
        let centre = Vec3::new(1.0, 1.0, 1.0);
        for i in 0..scene.triangles.len() {
            let (v0, _, _) = scene.triangle_vertices(i);
            let n = scene.triangle_normal(i).unwrap();
            let to_centre = (centre - v0).normalize().unwrap();
            assert!(
                n.dot(to_centre) > 0.0,
                "triangle {i} normal should face the room interior"
            );
        }
    }

    #[test]
    fn test_environment_default_density() {
        let env = Environment::default();
        assert!((env.ambient_density - env.acoustic_impedance / env.speed_of_sound).abs() < 1e-12);
    }
}
