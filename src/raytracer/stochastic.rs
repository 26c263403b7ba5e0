//! Stochastic energy accumulation: path throughputs, diffuse rain and the
//! energy-time histograms.

use crate::geom::Vec3;
use crate::raytracer::mis::{compute_mis_weights, MisWeights};
use crate::raytracer::reflector::Reflection;
use crate::scene::{bands_splat, Bands, Environment, Scene, NUM_BANDS};

/// Upper bound on histogram length, a runaway guard only.
const MAX_HISTOGRAM_BINS: usize = 1 << 22;

/// Energy-time histogram with per-band bins.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyHistogram {
    pub sample_rate: f32,
    pub bins: Vec<Bands>,
}

impl EnergyHistogram {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            bins: Vec::new(),
        }
    }

    /// Accumulates `volume` at `time` seconds.
    pub fn record(&mut self, time: f64, volume: &Bands) {
        let bin = (time.max(0.0) * self.sample_rate as f64) as usize;
        if bin >= MAX_HISTOGRAM_BINS {
            return;
        }
        if bin >= self.bins.len() {
            self.bins.resize(bin + 1, bands_splat(0.0));
        }
        for (acc, &v) in self.bins[bin].iter_mut().zip(volume.iter()) {
            *acc += v;
        }
    }

    /// Total energy across bins and bands.
    pub fn total_energy(&self) -> f64 {
        self.bins
            .iter()
            .map(|bin| bin.iter().map(|&v| v as f64).sum::<f64>())
            .sum()
    }

    /// Duration covered by the bins, in seconds.
    pub fn max_time(&self) -> f64 {
        self.bins.len() as f64 / self.sample_rate as f64
    }
}

/// Histogram resolved over arrival direction: an azimuth x elevation
/// look-up table of per-band bin vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionalEnergyHistogram<const AZ: usize, const EL: usize> {
    pub sample_rate: f32,
    pub table: Vec<Vec<Bands>>,
}

/// Default directional resolution.
pub const DIRECTIONAL_AZIMUTHS: usize = 20;
pub const DIRECTIONAL_ELEVATIONS: usize = 9;

impl<const AZ: usize, const EL: usize> DirectionalEnergyHistogram<AZ, EL> {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            table: vec![Vec::new(); AZ * EL],
        }
    }

    /// Table cell of a pointing direction (unit vector from the receiver).
    pub fn index(pointing: Vec3) -> usize {
        let azimuth = pointing.y.atan2(pointing.x);
        let elevation = pointing.z.clamp(-1.0, 1.0).asin();

        let two_pi = 2.0 * std::f32::consts::PI;
        let az_norm = (azimuth + two_pi) % two_pi / two_pi;
        let az_cell = ((az_norm * AZ as f32) as usize).min(AZ - 1);

        let el_norm = (elevation / std::f32::consts::PI) + 0.5;
        let el_cell = ((el_norm * EL as f32) as usize).min(EL - 1);

        az_cell * EL + el_cell
    }

    pub fn record(&mut self, pointing: Vec3, time: f64, volume: &Bands) {
        let bin = (time.max(0.0) * self.sample_rate as f64) as usize;
        if bin >= MAX_HISTOGRAM_BINS {
            return;
        }
        let cell = &mut self.table[Self::index(pointing)];
        if bin >= cell.len() {
            cell.resize(bin + 1, bands_splat(0.0));
        }
        for (acc, &v) in cell[bin].iter_mut().zip(volume.iter()) {
            *acc += v;
        }
    }

    /// Collapses the directional table into a plain histogram.
    pub fn mixed_down(&self) -> EnergyHistogram {
        let mut out = EnergyHistogram::new(self.sample_rate);
        for cell in &self.table {
            for (bin, volume) in cell.iter().enumerate() {
                out.record(bin as f64 / self.sample_rate as f64, volume);
            }
        }
        out
    }
}

/// Energy carried by each ray so the ray ensemble sums to the reference
/// source energy seen through the receiver sphere.
pub fn compute_ray_energy(num_rays: u64, source: Vec3, receiver: Vec3, receiver_radius: f32) -> f32 {
    if num_rays == 0 {
        return 0.0;
    }
    let distance = source.distance(receiver);
    let sin_y = receiver_radius / distance.max(receiver_radius);
    let angle = sin_y.clamp(-1.0, 1.0).asin();
    2.0 * (1.0 - angle.cos()) / num_rays as f32
}

/// Per-ray running state: throughputs, last position and path length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochasticPathInfo {
    pub throughput: Bands,
    pub deterministic: Bands,
    pub position: Vec3,
    pub distance: f32,
    /// Whether any bounce so far sampled the diffuse lobe.
    pub scattered: bool,
}

/// Distance along a segment at which it passes closest to a sphere centre,
/// or `None` when the closest approach lies outside the radius or segment.
fn segment_sphere_crossing(start: Vec3, end: Vec3, centre: Vec3, radius: f32) -> Option<f32> {
    let axis = end - start;
    let length = axis.length();
    let direction = axis.normalize()?;
    let t = (centre - start).dot(direction).clamp(0.0, length);
    let closest = start + direction * t;
    (closest.distance(centre) <= radius).then_some(t)
}

/// Accumulates diffuse rain (and MIS-gated specular emissions) into the
/// energy histogram, one batch of reflections per bounce.
pub struct StochasticProcessor {
    receiver: Vec3,
    receiver_radius: f32,
    speed_of_sound: f64,
    max_image_source_order: usize,
    mis_weights: MisWeights,
    mis_enabled: bool,
    paths: Vec<StochasticPathInfo>,
    histogram: EnergyHistogram,
    directional:
        Option<DirectionalEnergyHistogram<DIRECTIONAL_AZIMUTHS, DIRECTIONAL_ELEVATIONS>>,
}

impl StochasticProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Vec3,
        receiver: Vec3,
        environment: &Environment,
        num_rays: u64,
        max_image_source_order: usize,
        receiver_radius: f32,
        histogram_sample_rate: f32,
        mis_delta_pdf: f32,
        directional: bool,
    ) -> Self {
        let ray_energy = compute_ray_energy(num_rays, source, receiver, receiver_radius);
        let initial = StochasticPathInfo {
            throughput: bands_splat(ray_energy),
            deterministic: bands_splat(ray_energy),
            position: source,
            distance: 0.0,
            scattered: false,
        };
        Self {
            receiver,
            receiver_radius,
            speed_of_sound: environment.speed_of_sound,
            max_image_source_order,
            mis_weights: compute_mis_weights(num_rays, mis_delta_pdf),
            mis_enabled: num_rays != 0,
            paths: vec![initial; num_rays as usize],
            histogram: EnergyHistogram::new(histogram_sample_rate),
            directional: directional
                .then(|| DirectionalEnergyHistogram::new(histogram_sample_rate)),
        }
    }

    fn specular_weight(&self, step: usize) -> f32 {
        if self.max_image_source_order <= step {
            return 1.0;
        }
        if !self.mis_enabled {
            return 0.0;
        }
        self.mis_weights.path_tracer
    }

    fn bin(&mut self, hit: Vec3, volume: Bands, total_distance: f32) {
        let time = total_distance as f64 / self.speed_of_sound;
        self.histogram.record(time, &volume);
        if let Some(directional) = self.directional.as_mut() {
            if let Some(pointing) = (hit - self.receiver).normalize() {
                directional.record(pointing, time, &volume);
            }
        }
    }

    /// Consumes one batch of reflections (index-aligned with the rays).
    pub fn process(&mut self, reflections: &[Reflection], scene: &Scene, step: usize) {
        debug_assert_eq!(reflections.len(), self.paths.len());

        for (ray_idx, reflection) in reflections.iter().enumerate() {
            if !reflection.keep_going {
                continue;
            }
            let surface = scene.triangle_surface(reflection.triangle as usize);
            let scattering = surface.scattering;
            let reflectance: Bands =
                std::array::from_fn(|band| 1.0 - surface.absorption[band].clamp(0.0, 1.0));

            let path = self.paths[ray_idx];
            let outgoing_throughput: Bands =
                std::array::from_fn(|band| path.throughput[band] * reflectance[band]);
            let outgoing_specular: Bands =
                std::array::from_fn(|band| path.deterministic[band] * reflectance[band]);

            let scatter_probability = reflection.scatter_probability;
            let diffuse_probability = scatter_probability.max(1e-4);
            let specular_probability = (1.0 - scatter_probability).max(1e-4);

            // Energy split at this bounce.
            let rain_energy: Bands =
                std::array::from_fn(|band| outgoing_specular[band] * scattering[band]);
            let specular_chain: Bands =
                std::array::from_fn(|band| outgoing_specular[band] * (1.0 - scattering[band]));

            let diffuse_throughput: Bands = if reflection.sampled_diffuse {
                let cos_theta = reflection.cos_theta.max(0.0);
                let sample_pdf = reflection.sample_pdf.max(1e-6);
                let weight = cos_theta / sample_pdf;
                std::array::from_fn(|band| {
                    path.throughput[band]
                        * reflectance[band]
                        * scattering[band]
                        * std::f32::consts::FRAC_1_PI
                        * weight
                })
            } else {
                std::array::from_fn(|band| outgoing_throughput[band] * scattering[band])
            };
            let specular_throughput: Bands =
                std::array::from_fn(|band| outgoing_throughput[band] * (1.0 - scattering[band]));

            let hit = reflection.position;
            let total_distance = path.distance + path.position.distance(hit);

            // The flight segment may cross the receiver sphere; deposit the
            // carried throughput there. Pure-specular chains are MIS-gated
            // against the image-source estimator.
            if let Some(crossing) = segment_sphere_crossing(
                path.position,
                hit,
                self.receiver,
                self.receiver_radius,
            ) {
                let weight = if path.scattered {
                    1.0
                } else {
                    self.specular_weight(step)
                };
                if weight > 0.0 {
                    let volume: Bands =
                        std::array::from_fn(|band| path.throughput[band] * weight);
                    let crossing_point = path.position
                        + (hit - path.position).normalize().unwrap_or(Vec3::ZERO) * crossing;
                    self.bin(crossing_point, volume, path.distance + crossing);
                }
            }

            let propagated: Bands = if reflection.sampled_diffuse {
                std::array::from_fn(|band| diffuse_throughput[band] / diffuse_probability)
            } else {
                std::array::from_fn(|band| specular_throughput[band] / specular_probability)
            };

            self.paths[ray_idx] = StochasticPathInfo {
                throughput: propagated,
                deterministic: specular_chain,
                position: hit,
                distance: total_distance,
                scattered: path.scattered || reflection.sampled_diffuse,
            };

            if !reflection.receiver_visible {
                continue;
            }

            let to_receiver = self.receiver - hit;
            let receiver_distance = to_receiver.length();
            let arrival_distance = total_distance + receiver_distance;

            let sin_y = self.receiver_radius / receiver_distance.max(self.receiver_radius);
            let angle_correction = 1.0 - (1.0 - sin_y * sin_y).max(0.0).sqrt();

            let cos_alpha = scene
                .triangle_normal(reflection.triangle as usize)
                .and_then(|n| to_receiver.normalize().map(|d| n.dot(d).abs()))
                .unwrap_or(0.0);

            let geometry = angle_correction * 2.0 * cos_alpha
                / (receiver_distance * receiver_distance).max(1e-6);

            if reflection.sampled_diffuse {
                // Diffuse rain, Schroeder 5.20.
                let volume: Bands =
                    std::array::from_fn(|band| rain_energy[band] * geometry);
                self.bin(hit, volume, arrival_distance);
            } else {
                let weight = self.specular_weight(step);
                if weight > 0.0 {
                    let volume: Bands =
                        std::array::from_fn(|band| specular_chain[band] * geometry * weight);
                    self.bin(hit, volume, arrival_distance);
                }
            }
        }
    }

    /// Remaining per-ray state (for tests and diagnostics).
    pub fn paths(&self) -> &[StochasticPathInfo] {
        &self.paths
    }

    pub fn into_results(
        self,
    ) -> (
        EnergyHistogram,
        Option<DirectionalEnergyHistogram<DIRECTIONAL_AZIMUTHS, DIRECTIONAL_ELEVATIONS>>,
    ) {
        (self.histogram, self.directional)
    }
}
