//! Hybrid Monte-Carlo ray tracer.
//!
//! One batch of rays is traced bounce by bounce; every bounce feeds the
//! image-source tree (specular chains) and the stochastic energy histogram
//! (diffuse rain), with multiple-importance-sampling weights keeping the
//! two estimators consistent where they overlap.

pub mod image_source;
pub mod mis;
pub mod postprocess;
pub mod reflector;
pub mod stochastic;

pub use image_source::ImageSourceProcessor;
pub use mis::{compute_mis_weights, MisWeights, DEFAULT_MIS_DELTA_PDF};
pub use reflector::{Reflection, Reflector};
pub use stochastic::{
    compute_ray_energy, DirectionalEnergyHistogram, EnergyHistogram, StochasticProcessor,
    DIRECTIONAL_AZIMUTHS, DIRECTIONAL_ELEVATIONS,
};

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{EngineError, Result};
use crate::geom::Vec3;
use crate::scene::{bands_mean, Bands, Environment, VoxelisedScene};

/// One arrival: per-band pressure volume, position and path length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impulse {
    pub volume: Bands,
    pub position: Vec3,
    pub distance: f32,
}

/// Ray-tracer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RaytracerParameters {
    /// Number of rays shot from the source.
    pub rays: u64,
    /// Maximum image-source reflection order.
    pub max_image_source_order: u32,
    /// Receiver sphere radius in metres.
    pub receiver_radius: f32,
    /// Sample rate of the energy histogram in Hz.
    pub histogram_sample_rate: f32,
    /// Seed of the tracer's random stream.
    pub rng_seed: u64,
    /// Delta-pdf stand-in of the image-source estimator.
    pub mis_delta_pdf: f32,
    /// Also accumulate the azimuth/elevation-resolved histogram.
    pub directional_histogram: bool,
    /// Use flat (angle-independent) reflectance for image-source paths.
    pub flip_phase: bool,
}

impl Default for RaytracerParameters {
    fn default() -> Self {
        Self {
            rays: 1 << 13,
            max_image_source_order: 4,
            receiver_radius: 0.1,
            histogram_sample_rate: 1000.0,
            rng_seed: 0,
            mis_delta_pdf: DEFAULT_MIS_DELTA_PDF,
            directional_histogram: false,
            flip_phase: false,
        }
    }
}

/// Output of a tracer run.
#[derive(Debug, Clone)]
pub struct RaytracerResults {
    pub image_source: Vec<Impulse>,
    pub stochastic: EnergyHistogram,
    pub directional:
        Option<DirectionalEnergyHistogram<DIRECTIONAL_AZIMUTHS, DIRECTIONAL_ELEVATIONS>>,
}

/// Free-field intensity at a distance from a point source.
pub fn intensity_for_distance(distance: f64) -> f64 {
    1.0 / (4.0 * std::f64::consts::PI * (distance * distance).max(1e-12))
}

/// Pressure magnitude of a given intensity in a medium.
pub fn intensity_to_pressure(intensity: f64, acoustic_impedance: f64) -> f64 {
    (intensity.max(0.0) * acoustic_impedance).sqrt()
}

/// Free-field pressure attenuation over a distance.
pub fn pressure_for_distance(distance: f32, acoustic_impedance: f64) -> f32 {
    intensity_to_pressure(intensity_for_distance(distance as f64), acoustic_impedance) as f32
}

/// Bounces needed to drain the ensemble to negligible energy.
pub fn compute_optimum_reflection_number(min_absorption: f32) -> usize {
    let reflectance = (1.0 - min_absorption).clamp(0.0, 0.999) as f64;
    if reflectance <= 0.0 {
        return 8;
    }
    let bounces = (1e-6f64.ln() / reflectance.ln()).ceil() as usize;
    bounces.clamp(8, 512)
}

/// Traces `params.rays` rays and returns the image-source impulse list and
/// the stochastic energy histogram(s).
///
/// `reflections_callback` receives each bounce's reflection batch.
pub fn run(
    voxels: &VoxelisedScene,
    source: Vec3,
    receiver: Vec3,
    environment: &Environment,
    params: &RaytracerParameters,
    keep_going: &AtomicBool,
    reflections_callback: &mut dyn FnMut(&[Reflection]),
) -> Result<RaytracerResults> {
    let num_rays = params.rays as usize;
    let max_order = params.max_image_source_order as usize;

    let mut reflector = Reflector::new(source, receiver, num_rays, params.rng_seed);
    let mut image_processor = ImageSourceProcessor::new(
        source,
        receiver,
        max_order,
        params.rays,
        params.mis_delta_pdf,
        params.flip_phase,
    );
    let mut stochastic_processor = StochasticProcessor::new(
        source,
        receiver,
        environment,
        params.rays,
        max_order,
        params.receiver_radius,
        params.histogram_sample_rate,
        params.mis_delta_pdf,
        params.directional_histogram,
    );

    // Specular prefix of each ray's bounce history; a diffuse sample ends
    // the chain for image-source purposes.
    let mut histories: Vec<Vec<u32>> = vec![Vec::new(); num_rays];
    let mut specular_alive = vec![true; num_rays];

    let min_absorption = voxels
        .scene()
        .surfaces
        .iter()
        .map(|s| bands_mean(&s.absorption))
        .fold(1.0f32, f32::min);
    let max_bounces = compute_optimum_reflection_number(min_absorption).max(max_order + 1);

    for step in 0..max_bounces {
        if !keep_going.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled {
                completed_steps: step,
            });
        }
        if reflector.alive() == 0 {
            break;
        }

        let reflections = reflector.run_step(voxels).to_vec();
        reflections_callback(&reflections);

        for (ray_idx, reflection) in reflections.iter().enumerate() {
            if !reflection.keep_going {
                specular_alive[ray_idx] = false;
                continue;
            }
            if specular_alive[ray_idx] {
                if reflection.sampled_diffuse {
                    specular_alive[ray_idx] = false;
                } else if histories[ray_idx].len() < max_order {
                    histories[ray_idx].push(reflection.triangle);
                }
            }
        }

        stochastic_processor.process(&reflections, voxels.scene(), step);
    }

    for history in &histories {
        if !history.is_empty() {
            image_processor.record(history);
        }
    }

    let image_source = image_processor.results(voxels, environment);
    let (stochastic, directional) = stochastic_processor.into_results();

    Ok(RaytracerResults {
        image_source,
        stochastic,
        directional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Scene, Surface};

    fn setup(absorption: f32, scattering: f32) -> VoxelisedScene {
        let scene = Scene::shoebox(6.0, 4.0, 3.0, Surface::uniform(absorption, scattering));
        VoxelisedScene::new(scene, 8, 0.1)
    }

    fn default_params(rays: u64, seed: u64) -> RaytracerParameters {
        RaytracerParameters {
            rays,
            max_image_source_order: 3,
            receiver_radius: 0.1,
            histogram_sample_rate: 1000.0,
            rng_seed: seed,
            ..RaytracerParameters::default()
        }
    }

    #[test]
    fn test_run_produces_impulses_and_histogram() {
        let voxels = setup(0.2, 0.25);
        let keep_going = AtomicBool::new(true);
        let mut batches = 0usize;
        let results = run(
            &voxels,
            Vec3::new(1.0, 1.5, 1.0),
            Vec3::new(2.5, 2.0, 1.2),
            &Environment::default(),
            &default_params(512, 1),
            &keep_going,
            &mut |batch| {
                assert_eq!(batch.len(), 512);
                batches += 1;
            },
        )
        .unwrap();

        assert!(batches > 0);
        assert!(!results.image_source.is_empty(), "direct path at minimum");
        assert!(results.stochastic.total_energy() > 0.0);
        // I6: all bins non-negative.
        for bin in &results.stochastic.bins {
            assert!(bin.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn test_determinism_with_equal_seeds() {
        // I8: identical seeds give bit-identical impulses and histograms.
        let voxels = setup(0.2, 0.25);
        let run_once = |seed: u64| {
            let keep_going = AtomicBool::new(true);
            run(
                &voxels,
                Vec3::new(1.0, 1.5, 1.0),
                Vec3::new(2.5, 2.0, 1.2),
                &Environment::default(),
                &default_params(256, seed),
                &keep_going,
                &mut |_| {},
            )
            .unwrap()
        };
        let a = run_once(99);
        let b = run_once(99);
        assert_eq!(a.image_source, b.image_source);
        assert_eq!(a.stochastic, b.stochastic);

        let c = run_once(100);
        assert_ne!(
            a.stochastic, c.stochastic,
            "a different seed must change at least one bin"
        );
    }

    #[test]
    fn test_cancellation_mid_run() {
        let voxels = setup(0.0, 0.2);
        let keep_going = AtomicBool::new(true);
        let mut batches = 0usize;
        let err = {
            let stop_after = 2usize;
            let keep = &keep_going;
            run(
                &voxels,
                Vec3::new(1.0, 1.5, 1.0),
                Vec3::new(2.5, 2.0, 1.2),
                &Environment::default(),
                &default_params(128, 5),
                keep,
                &mut |_| {
                    batches += 1;
                    if batches == stop_after {
                        keep.store(false, Ordering::Release);
                    }
                },
            )
            .unwrap_err()
        };
        match err {
            EngineError::Cancelled { completed_steps } => assert_eq!(completed_steps, 2),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn test_direct_path_peak_index() {
        // R1: for a rigid box the direct ISM impulse lands at
        // floor(|S - R| * fs / c) within one sample.
        let voxels = setup(0.0, 0.0);
        let keep_going = AtomicBool::new(true);
        let source = Vec3::new(1.0, 1.0, 1.0);
        let receiver = Vec3::new(3.0, 1.5, 1.2);
        let environment = Environment::default();
        let results = run(
            &voxels,
            source,
            receiver,
            &environment,
            &default_params(256, 3),
            &keep_going,
            &mut |_| {},
        )
        .unwrap();

        let d = source.distance(receiver);
        let direct = results
            .image_source
            .iter()
            .min_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap())
            .unwrap();
        assert!((direct.distance - d).abs() < 1e-3);

        let fs_out = 48000.0;
        let expected = (d as f64 * fs_out / environment.speed_of_sound).floor() as i64;
        let actual = (direct.distance as f64 * fs_out / environment.speed_of_sound).floor() as i64;
        assert!((expected - actual).abs() <= 1);
    }

    #[test]
    fn test_pressure_for_distance_falls_off() {
        let near = pressure_for_distance(1.0, 400.0);
        let far = pressure_for_distance(2.0, 400.0);
        assert!((near / far - 2.0).abs() < 1e-4, "1/d pressure law");
    }

    #[test]
    fn test_reflection_number_grows_with_reflectance() {
        assert!(compute_optimum_reflection_number(0.9) < compute_optimum_reflection_number(0.1));
        assert!(compute_optimum_reflection_number(0.0) <= 512);
        assert!(compute_optimum_reflection_number(1.0) >= 8);
    }
}
