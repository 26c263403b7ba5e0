//! Host-side waveguide simulation loop.
//!
//! Builds the mesh tables once per scene, then per run: allocates the
//! ping-pong pressure buffers, injects the transparent source, submits the
//! pressure and boundary kernels through the backend, collects the
//! receiver output and polls for cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::env::RuntimeOptions;
use crate::error::{EngineError, Result};
use crate::geom::Vec3;
use crate::scene::{Environment, Surface, VoxelisedScene};
use crate::waveguide::backend::{BoundaryKernelArgs, ComputeBackend, PressureKernelArgs};
use crate::waveguide::boundary::{
    assign_boundary_indices, build_layout, face_coefficient_index, BoundaryIndexData,
    BoundaryLayout,
};
use crate::waveguide::filters::{to_flat_coefficients, CoefficientsCanonical, MemoryCanonical};
use crate::waveguide::kernel::{
    Diagnostics, ERR_INF, ERR_NAN, ERR_OUTSIDE_MESH, ERR_OUTSIDE_RANGE, ERR_SUSPICIOUS_BOUNDARY,
};
use crate::waveguide::mesh::{compute_sample_rate, MeshDescriptor, WaveguideParameters};
use crate::waveguide::pcs::{make_pcs_transparent_signal, SoftSource, SourceSignal};
use crate::waveguide::receiver::{DirectionalReceiver, PressureReceiver, ReceiverOutput};
use crate::waveguide::setup::{
    build_surface_coefficients, classify_nodes, estimate_volume, is_boundary, is_interior,
    CondensedNode,
};
use crate::scene::precomputed::PrecomputedBoundary;

/// Receiver output of one waveguide run.
#[derive(Debug, Clone)]
pub struct Band {
    pub outputs: Vec<ReceiverOutput>,
    pub sample_rate: f64,
}

impl Band {
    /// Pressure samples of the band.
    pub fn pressures(&self) -> Vec<f32> {
        self.outputs.iter().map(|o| o.pressure).collect()
    }
}

/// A band together with the frequency range it is valid over.
#[derive(Debug, Clone)]
pub struct BandpassBand {
    pub band: Band,
    /// (low, high) edge of the valid range in Hz.
    pub valid_hz: (f64, f64),
}

/// The mesh tables built once per scene: descriptor, condensed nodes,
/// coefficient table, per-dimension boundary arrays and the packed layout.
#[derive(Debug)]
pub struct WaveguideMesh {
    pub descriptor: MeshDescriptor,
    pub nodes: Vec<CondensedNode>,
    pub surfaces: Vec<Surface>,
    pub coefficients: Vec<CoefficientsCanonical>,
    pub index_data: BoundaryIndexData,
    pub layout: BoundaryLayout,
}

impl WaveguideMesh {
    /// Room volume from the interior node count.
    pub fn estimated_volume(&self) -> f64 {
        estimate_volume(&self.descriptor, &self.nodes)
    }

    fn zero_filter_memories(&mut self) {
        for entry in self.index_data.b1.iter_mut() {
            for bd in entry.array.iter_mut() {
                bd.filter_memory = MemoryCanonical::default();
            }
        }
        for entry in self.index_data.b2.iter_mut() {
            for bd in entry.array.iter_mut() {
                bd.filter_memory = MemoryCanonical::default();
            }
        }
        for entry in self.index_data.b3.iter_mut() {
            for bd in entry.array.iter_mut() {
                bd.filter_memory = MemoryCanonical::default();
            }
        }
    }
}

/// Builds the waveguide mesh for a voxelised scene.
///
/// `precomputed` optionally supplies per-node boundary labels which, with
/// `label_surfaces`, override the default per-triangle surface lookup.
pub fn build_mesh(
    voxels: &VoxelisedScene,
    spacing: f64,
    speed_of_sound: f64,
    options: &RuntimeOptions,
    precomputed: Option<&PrecomputedBoundary>,
    label_surfaces: Option<&HashMap<i16, Surface>>,
) -> Result<WaveguideMesh> {
    let spacing = spacing as f32;
    let pad = options.voxel_pad as f32;
    let aabb = voxels.aabb();
    let descriptor = MeshDescriptor {
        min_corner: aabb.min - Vec3::new(1.0, 1.0, 1.0) * (pad * spacing),
        dimensions: [
            (aabb.extent().x / spacing).ceil() as i32 + 1 + 2 * options.voxel_pad as i32,
            (aabb.extent().y / spacing).ceil() as i32 + 1 + 2 * options.voxel_pad as i32,
            (aabb.extent().z / spacing).ceil() as i32 + 1 + 2 * options.voxel_pad as i32,
        ],
        spacing,
    };

    let mut nodes = classify_nodes(&descriptor, voxels)?;

    // Surface table: scene surfaces, then any labelled surfaces.
    let mut surfaces = voxels.scene().surfaces.clone();
    let mut label_to_index: HashMap<i16, u32> = HashMap::new();
    if let Some(table) = label_surfaces {
        let mut labels: Vec<i16> = table.keys().copied().collect();
        labels.sort_unstable();
        for label in labels {
            label_to_index.insert(label, surfaces.len() as u32);
            surfaces.push(table[&label]);
        }
    }

    let mesh_sample_rate = compute_sample_rate(&descriptor, speed_of_sound);
    let coefficients =
        build_surface_coefficients(&surfaces, mesh_sample_rate, options.force_identity_coeffs);

    let index_data = assign_boundary_indices(&descriptor, &mut nodes, |node_index, port| {
        if let Some(pre) = precomputed {
            if let Some(&label) = pre.labels.get(node_index as usize) {
                if let Some(&coeff) = label_to_index.get(&label) {
                    return coeff;
                }
            }
        }
        face_coefficient_index(&descriptor, voxels, node_index, port)
    });

    let layout = build_layout(&descriptor, &nodes, &index_data, &coefficients, voxels);

    log::debug!(
        "waveguide mesh: {:?} nodes, {} b1 / {} b2 / {} b3 boundary entries, spacing {spacing}",
        descriptor.num_nodes(),
        index_data.b1.len(),
        index_data.b2.len(),
        index_data.b3.len(),
    );

    Ok(WaveguideMesh {
        descriptor,
        nodes,
        surfaces,
        coefficients,
        index_data,
        layout,
    })
}

fn interior_node_at(mesh: &WaveguideMesh, position: Vec3) -> Option<u32> {
    let index = mesh.descriptor.node_at(position)?;
    let bt = mesh.nodes[index as usize].boundary_type;
    (is_interior(bt) || is_boundary(bt)).then_some(index)
}

fn stage_error(flags: u32, step: usize, diagnostics: &Diagnostics) -> Result<()> {
    if flags == 0 {
        return Ok(());
    }
    if flags & ERR_INF != 0 {
        return Err(EngineError::PressureInf { step });
    }
    if flags & ERR_NAN != 0 {
        return Err(EngineError::PressureNan {
            step,
            diagnostics: diagnostics.get().copied().map(Box::new),
        });
    }
    if flags & ERR_OUTSIDE_MESH != 0 {
        return Err(EngineError::OutsideMesh { step });
    }
    if flags & ERR_SUSPICIOUS_BOUNDARY != 0 {
        return Err(EngineError::SuspiciousBoundary { step });
    }
    if flags & ERR_OUTSIDE_RANGE != 0 {
        return Err(EngineError::IndexOutOfRange { step });
    }
    Ok(())
}

fn debug_node_dump(mesh: &WaveguideMesh, node: u64) {
    let Ok(index) = u32::try_from(node) else {
        return;
    };
    if index as usize >= mesh.nodes.len() {
        log::warn!("DEBUG_NODE {node} is outside the node table");
        return;
    }
    let condensed = mesh.nodes[index as usize];
    let locator = mesh.descriptor.locator(index);
    let neighbors = mesh.descriptor.neighbors(index);
    log::debug!(
        "node {index} locator={locator:?} boundary_type={:#x} boundary_index={} neighbors={neighbors:?}",
        condensed.boundary_type,
        condensed.boundary_index,
    );
}

/// Runs one waveguide band on the already-built mesh.
///
/// `pressure_callback(current_buffer, step)` is invoked synchronously after
/// each completed step.
#[allow(clippy::too_many_arguments)]
pub fn run_band(
    backend: &dyn ComputeBackend,
    mesh: &mut WaveguideMesh,
    source: Vec3,
    receiver: Vec3,
    environment: &Environment,
    simulation_time: f64,
    keep_going: &AtomicBool,
    options: &RuntimeOptions,
    pressure_callback: &mut dyn FnMut(&[f32], usize),
) -> Result<Band> {
    let sample_rate = compute_sample_rate(&mesh.descriptor, environment.speed_of_sound);

    let source_node = interior_node_at(mesh, source)
        .ok_or(EngineError::SourceOutside { position: source })?;
    let receiver_node = interior_node_at(mesh, receiver)
        .ok_or(EngineError::ReceiverOutside { position: receiver })?;

    let total_steps = (sample_rate * simulation_time).ceil() as usize;
    if total_steps == 0 {
        return Ok(Band {
            outputs: Vec::new(),
            sample_rate,
        });
    }

    let source_signal = SoftSource::new(make_pcs_transparent_signal(
        total_steps,
        environment.acoustic_impedance,
        environment.speed_of_sound,
        sample_rate,
        mesh.descriptor.spacing as f64,
    ));

    let mut receiver_state = DirectionalReceiver::new(
        &mesh.descriptor,
        sample_rate,
        environment.ambient_density,
        receiver_node,
        receiver,
    )?;

    mesh.zero_filter_memories();

    let num_nodes = mesh.descriptor.num_nodes();
    let mut previous = vec![0.0f32; num_nodes];
    let mut current = vec![0.0f32; num_nodes];
    let mut previous_history = vec![0.0f32; num_nodes];
    backend.zero(&mut previous);
    backend.zero(&mut current);
    backend.zero(&mut previous_history);

    if let Some(node) = options.debug_node {
        debug_node_dump(mesh, node);
    }

    let step_cap = options
        .max_steps
        .map(|cap| (cap as usize).min(total_steps))
        .unwrap_or(total_steps);

    let errors = AtomicU32::new(0);
    let diagnostics = Diagnostics::new();

    for step in 0..step_cap {
        if !keep_going.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled {
                completed_steps: step,
            });
        }

        current[source_node as usize] += source_signal.sample(step);

        previous_history.copy_from_slice(&previous);

        errors.store(0, Ordering::Relaxed);
        backend.pressure_kernel(PressureKernelArgs {
            previous: &mut previous,
            current: &current,
            nodes: &mesh.nodes,
            descriptor: &mesh.descriptor,
            boundary_1: &mesh.index_data.b1,
            boundary_2: &mesh.index_data.b2,
            boundary_3: &mesh.index_data.b3,
            coefficients: &mesh.coefficients,
            errors: &errors,
            diagnostics: &diagnostics,
            step,
            trace_node: options.trace_node,
        });
        if options.wg_trace {
            log::debug!("kernel 'pressure' complete (step={step}, gws={num_nodes})");
        }
        stage_error(errors.load(Ordering::Relaxed), step, &diagnostics)?;

        // Boundary filter updates read the just-written next pressures.
        let boundary_stage = |name: &str, count: usize| -> Result<()> {
            if options.wg_trace && count != 0 {
                log::debug!("kernel '{name}' complete (step={step}, gws={count})");
            }
            stage_error(errors.load(Ordering::Relaxed), step, &diagnostics)
        };

        errors.store(0, Ordering::Relaxed);
        backend.boundary_kernel_3(BoundaryKernelArgs {
            storage: &mut mesh.index_data.b3,
            boundary_nodes: &mesh.index_data.nodes3,
            nodes: &mesh.nodes,
            descriptor: &mesh.descriptor,
            previous_history: &previous_history,
            current: &current,
            next: &previous,
            coefficients: &mesh.coefficients,
            errors: &errors,
            diagnostics: &diagnostics,
            step,
            trace_node: options.trace_node,
        });
        boundary_stage("boundary_3", mesh.index_data.b3.len())?;

        errors.store(0, Ordering::Relaxed);
        backend.boundary_kernel_2(BoundaryKernelArgs {
            storage: &mut mesh.index_data.b2,
            boundary_nodes: &mesh.index_data.nodes2,
            nodes: &mesh.nodes,
            descriptor: &mesh.descriptor,
            previous_history: &previous_history,
            current: &current,
            next: &previous,
            coefficients: &mesh.coefficients,
            errors: &errors,
            diagnostics: &diagnostics,
            step,
            trace_node: options.trace_node,
        });
        boundary_stage("boundary_2", mesh.index_data.b2.len())?;

        errors.store(0, Ordering::Relaxed);
        backend.boundary_kernel_1(BoundaryKernelArgs {
            storage: &mut mesh.index_data.b1,
            boundary_nodes: &mesh.index_data.nodes1,
            nodes: &mesh.nodes,
            descriptor: &mesh.descriptor,
            previous_history: &previous_history,
            current: &current,
            next: &previous,
            coefficients: &mesh.coefficients,
            errors: &errors,
            diagnostics: &diagnostics,
            step,
            trace_node: options.trace_node,
        });
        boundary_stage("boundary_1", mesh.index_data.b1.len())?;

        receiver_state.consume(&current, step);
        pressure_callback(&current, step);

        std::mem::swap(&mut previous, &mut current);
    }

    if step_cap < total_steps {
        log::warn!(
            "waveguide stopped at MAX_STEPS cap ({step_cap} of {total_steps} steps)"
        );
    }

    Ok(Band {
        outputs: receiver_state.into_outputs(),
        sample_rate,
    })
}

/// Runs the configured waveguide band(s).
#[allow(clippy::too_many_arguments)]
pub fn run(
    backend: &dyn ComputeBackend,
    mesh: &mut WaveguideMesh,
    parameters: &WaveguideParameters,
    source: Vec3,
    receiver: Vec3,
    environment: &Environment,
    simulation_time: f64,
    keep_going: &AtomicBool,
    options: &RuntimeOptions,
    pressure_callback: &mut dyn FnMut(&[f32], usize),
) -> Result<Vec<BandpassBand>> {
    match parameters {
        WaveguideParameters::SingleBand { cutoff_hz, .. } => {
            let band = run_band(
                backend,
                mesh,
                source,
                receiver,
                environment,
                simulation_time,
                keep_going,
                options,
                pressure_callback,
            )?;
            Ok(vec![BandpassBand {
                band,
                valid_hz: (0.0, *cutoff_hz),
            }])
        }
        WaveguideParameters::MultipleBand {
            bands,
            band_edges_hz,
            ..
        } => {
            let mut result = Vec::with_capacity(*bands);
            for band_index in 0..*bands {
                // Flat impedance coefficients fitted to this band alone.
                mesh.coefficients = mesh
                    .surfaces
                    .iter()
                    .map(|surface| {
                        to_flat_coefficients(
                            surface.absorption[band_index.min(surface.absorption.len() - 1)],
                        )
                    })
                    .collect();

                let band = run_band(
                    backend,
                    mesh,
                    source,
                    receiver,
                    environment,
                    simulation_time,
                    keep_going,
                    options,
                    pressure_callback,
                )?;
                let low = band_edges_hz.get(band_index).copied().unwrap_or(0.0);
                let high = band_edges_hz
                    .get(band_index + 1)
                    .copied()
                    .unwrap_or(low * 2.0);
                result.push(BandpassBand {
                    band,
                    valid_hz: (low, high),
                });
            }
            Ok(result)
        }
    }
}
