//! Engine entry point and the per-pair orchestrator.
//!
//! [`run`] drives the mesh builder, the waveguide and the ray tracer for
//! one source/receiver pair and returns the raw solver outputs;
//! [`IntermediateResults::postprocess`] turns them into a single-channel
//! IR. [`render_pairs`] loops over pairs and normalises across channels.

use std::sync::atomic::AtomicBool;

use crate::env::RuntimeOptions;
use crate::error::{EngineError, Result};
use crate::geom::Vec3;
use crate::postprocess::{
    crossover_filter, direct_path_index, has_energy, inject_direct_path, left_hanning, max_mag,
    sanitize, CROSSOVER_WIDTH,
};
use crate::raytracer::{Reflection, RaytracerParameters, RaytracerResults};
use crate::scene::{Environment, VoxelisedScene};
use crate::waveguide::backend::host_layout_info;
use crate::waveguide::driver::{self, BandpassBand};
use crate::waveguide::mesh::{compute_sample_rate, grid_spacing, MeshDescriptor};
use crate::waveguide::postprocess::min_valid_band_edge_hz;
use crate::waveguide::{build_mesh, select_backend, ComputeBackend, WaveguideParameters};

/// Compute resources and runtime options shared by engine runs.
pub struct ComputeContext {
    backend: Box<dyn ComputeBackend>,
    options: RuntimeOptions,
}

impl ComputeContext {
    /// Context with options read from the process environment.
    pub fn new() -> Result<Self> {
        Self::with_options(RuntimeOptions::from_env())
    }

    /// Context with explicit options (used by tests and embedders).
    pub fn with_options(options: RuntimeOptions) -> Result<Self> {
        let backend = select_backend(&options)?;
        // Host/device layout parity is a precondition of every upload.
        let host = host_layout_info();
        let probed = backend.layout_probe();
        if host != probed {
            log::error!("layout mismatch: host {host:?} vs {} {probed:?}", backend.name());
            return Err(EngineError::BackendUnavailable {
                requested: backend.name().to_string(),
            });
        }
        Ok(Self { backend, options })
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }
}

/// Phase of an engine run, reported through [`EngineEvents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    BuildingMesh,
    RunningWaveguide,
    RunningRaytracer,
    Postprocessing,
    Complete,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::BuildingMesh => "building_mesh",
            EngineState::RunningWaveguide => "running_waveguide",
            EngineState::RunningRaytracer => "running_raytracer",
            EngineState::Postprocessing => "postprocessing",
            EngineState::Complete => "complete",
        }
    }
}

/// Diagnostic sink. All callbacks run on the engine task and must not
/// block; implementations typically push into bounded queues.
pub trait EngineEvents {
    fn on_engine_state_changed(
        &self,
        run_index: usize,
        total_runs: usize,
        state: EngineState,
        progress: f64,
    ) {
        let _ = (run_index, total_runs, state, progress);
    }

    /// Fired once per run, after the mesh is built.
    fn on_waveguide_node_positions_changed(&self, descriptor: &MeshDescriptor) {
        let _ = descriptor;
    }

    /// Fired after every waveguide step with the current pressure buffer.
    fn on_waveguide_node_pressures_changed(&self, pressures: &[f32]) {
        let _ = pressures;
    }

    /// Fired after every ray-tracer bounce with the reflection batch.
    fn on_raytracer_reflections_generated(&self, reflections: &[Reflection]) {
        let _ = reflections;
    }
}

/// Sink that ignores every event.
pub struct NullEvents;

impl EngineEvents for NullEvents {}

/// Raw outputs of both solvers for one source/receiver pair.
#[derive(Debug)]
pub struct IntermediateResults {
    pub raytracer: RaytracerResults,
    pub waveguide: Vec<BandpassBand>,
    pub room_volume: f64,
    pub source: Vec3,
    pub receiver: Vec3,
    pub environment: Environment,
    rng_seed: u64,
    options: RuntimeOptions,
}

impl IntermediateResults {
    /// Renders one channel at `output_sample_rate`: bandlimits and sums the
    /// two models, windows the leading edge and sanitises the result.
    pub fn postprocess(&self, output_sample_rate: f64) -> Result<Vec<f32>> {
        let raytracer_signal = crate::raytracer::postprocess::postprocess(
            &self.raytracer.image_source,
            &self.raytracer.stochastic,
            self.room_volume,
            &self.environment,
            output_sample_rate,
            self.rng_seed,
        );

        let source_receiver_distance = self.source.distance(self.receiver) as f64;

        if self.waveguide.is_empty() {
            let mut output = raytracer_signal;
            if !has_energy(&output) {
                if !self.options.allow_silent_fallback {
                    return Err(EngineError::SilentOutput);
                }
                log::warn!("silent ray-traced IR; injecting direct-path fallback");
                inject_direct_path(
                    &mut output,
                    source_receiver_distance,
                    output_sample_rate,
                    self.environment.speed_of_sound,
                );
            }
            return Ok(output);
        }

        let waveguide_signal =
            crate::waveguide::postprocess::postprocess(&self.waveguide, output_sample_rate);

        let cutoff = min_valid_band_edge_hz(&self.waveguide).unwrap_or(500.0)
            / output_sample_rate;
        let mut output = crossover_filter(
            &waveguide_signal,
            &raytracer_signal,
            cutoff,
            CROSSOVER_WIDTH,
        );

        // Leading-edge window removes any DC offset before the direct sound.
        let window_length = output.len().min(direct_path_index(
            source_receiver_distance,
            output_sample_rate,
            self.environment.speed_of_sound,
        ));
        if window_length > 0 {
            let window = left_hanning(window_length);
            for (sample, w) in output.iter_mut().zip(window.iter()) {
                *sample *= w;
            }
        }

        let replaced = sanitize(&mut output);
        if replaced != 0 {
            log::warn!("sanitized {replaced} non-finite samples in the crossover output");
        }

        if !has_energy(&output) {
            if !self.options.allow_silent_fallback {
                return Err(EngineError::SilentOutput);
            }
            log::warn!("silent combined IR; injecting direct-path fallback");
            inject_direct_path(
                &mut output,
                source_receiver_distance,
                output_sample_rate,
                self.environment.speed_of_sound,
            );
        }

        Ok(output)
    }
}

#[allow(clippy::too_many_arguments)]
fn run_indexed(
    ctx: &ComputeContext,
    voxels: &VoxelisedScene,
    source: Vec3,
    receiver: Vec3,
    environment: &Environment,
    raytracer_params: &RaytracerParameters,
    waveguide_params: &WaveguideParameters,
    simulation_time: f64,
    keep_going: &AtomicBool,
    events: &dyn EngineEvents,
    run_index: usize,
    total_runs: usize,
) -> Result<IntermediateResults> {
    events.on_engine_state_changed(run_index, total_runs, EngineState::BuildingMesh, 0.0);

    let spacing = grid_spacing(
        environment.speed_of_sound,
        waveguide_params.sampling_frequency(),
    );
    let mut mesh = build_mesh(
        voxels,
        spacing,
        environment.speed_of_sound,
        ctx.options(),
        None,
        None,
    )?;
    events.on_waveguide_node_positions_changed(&mesh.descriptor);

    let mesh_rate = compute_sample_rate(&mesh.descriptor, environment.speed_of_sound);
    let expected_steps = (mesh_rate * simulation_time).ceil().max(1.0);

    events.on_engine_state_changed(run_index, total_runs, EngineState::RunningWaveguide, 0.0);
    let waveguide = driver::run(
        ctx.backend(),
        &mut mesh,
        waveguide_params,
        source,
        receiver,
        environment,
        simulation_time,
        keep_going,
        ctx.options(),
        &mut |pressures, step| {
            events.on_waveguide_node_pressures_changed(pressures);
            events.on_engine_state_changed(
                run_index,
                total_runs,
                EngineState::RunningWaveguide,
                ((step + 1) as f64 / expected_steps).min(1.0),
            );
        },
    )?;

    events.on_engine_state_changed(run_index, total_runs, EngineState::RunningRaytracer, 0.0);
    let raytracer = crate::raytracer::run(
        voxels,
        source,
        receiver,
        environment,
        raytracer_params,
        keep_going,
        &mut |reflections| events.on_raytracer_reflections_generated(reflections),
    )?;

    let waveguide_energy: f64 = waveguide
        .iter()
        .flat_map(|b| b.band.outputs.iter())
        .map(|o| (o.pressure as f64).abs())
        .sum();
    let empty = raytracer.image_source.is_empty()
        && raytracer.stochastic.total_energy() == 0.0
        && waveguide_energy == 0.0;
    if empty && !ctx.options().allow_empty_intermediate {
        return Err(EngineError::SilentOutput);
    }

    events.on_engine_state_changed(run_index, total_runs, EngineState::Complete, 1.0);

    Ok(IntermediateResults {
        raytracer,
        waveguide,
        room_volume: mesh.estimated_volume(),
        source,
        receiver,
        environment: *environment,
        rng_seed: raytracer_params.rng_seed,
        options: ctx.options().clone(),
    })
}

/// Runs both solvers for one source/receiver pair.
#[allow(clippy::too_many_arguments)]
pub fn run(
    ctx: &ComputeContext,
    voxels: &VoxelisedScene,
    source: Vec3,
    receiver: Vec3,
    environment: &Environment,
    raytracer_params: &RaytracerParameters,
    waveguide_params: &WaveguideParameters,
    simulation_time: f64,
    keep_going: &AtomicBool,
    events: &dyn EngineEvents,
) -> Result<IntermediateResults> {
    run_indexed(
        ctx,
        voxels,
        source,
        receiver,
        environment,
        raytracer_params,
        waveguide_params,
        simulation_time,
        keep_going,
        events,
        0,
        1,
    )
}

/// Renders every source/receiver pair and normalises the channel set.
///
/// Fails fast: any per-pair failure aborts the whole render with no
/// partial output.
#[allow(clippy::too_many_arguments)]
pub fn render_pairs(
    ctx: &ComputeContext,
    voxels: &VoxelisedScene,
    pairs: &[(Vec3, Vec3)],
    environment: &Environment,
    raytracer_params: &RaytracerParameters,
    waveguide_params: &WaveguideParameters,
    simulation_time: f64,
    output_sample_rate: f64,
    keep_going: &AtomicBool,
    events: &dyn EngineEvents,
) -> Result<Vec<Vec<f32>>> {
    let spacing = grid_spacing(
        environment.speed_of_sound,
        waveguide_params.sampling_frequency(),
    ) as f32;

    let mut channels = Vec::with_capacity(pairs.len());
    for (run_index, &(source, receiver)) in pairs.iter().enumerate() {
        let distance = source.distance(receiver);
        if distance < spacing {
            return Err(EngineError::PlacementTooClose { distance, spacing });
        }

        let results = run_indexed(
            ctx,
            voxels,
            source,
            receiver,
            environment,
            raytracer_params,
            waveguide_params,
            simulation_time,
            keep_going,
            events,
            run_index,
            pairs.len(),
        )?;

        events.on_engine_state_changed(
            run_index,
            pairs.len(),
            EngineState::Postprocessing,
            0.0,
        );
        channels.push(results.postprocess(output_sample_rate)?);
    }

    let mut peak = channels.iter().map(|c| max_mag(c)).fold(0.0f32, f32::max);
    if peak == 0.0 {
        if !ctx.options().allow_silent_fallback {
            return Err(EngineError::SilentOutput);
        }
        for (channel, &(source, receiver)) in channels.iter_mut().zip(pairs.iter()) {
            inject_direct_path(
                channel,
                source.distance(receiver) as f64,
                output_sample_rate,
                environment.speed_of_sound,
            );
        }
        peak = channels.iter().map(|c| max_mag(c)).fold(0.0f32, f32::max);
        if peak == 0.0 {
            return Err(EngineError::SilentOutput);
        }
    }

    for channel in channels.iter_mut() {
        for sample in channel.iter_mut() {
            *sample /= peak;
        }
    }

    Ok(channels)
}
