//! Kernel dispatch backends.
//!
//! The driver never iterates nodes itself; it submits whole kernels to a
//! [`ComputeBackend`] and waits for completion before the next stage, so
//! step `n + 1` only ever reads values written in step `n` or earlier. The
//! default accelerator backend executes each kernel as a data-parallel
//! command over the work-queue thread pool; the `cpu` backend is the
//! sequential host reference used for parity testing.

use std::mem::{offset_of, size_of};
use std::sync::atomic::AtomicU32;

use rayon::prelude::*;

use crate::env::{BackendKind, RuntimeOptions};
use crate::error::Result;
use crate::waveguide::boundary::{BoundaryData, BoundaryDataArray};
use crate::waveguide::filters::{CoefficientsCanonical, MemoryCanonical};
use crate::waveguide::kernel::{
    check_pressure, next_pressure, update_boundary_entry, Diagnostics,
};
use crate::waveguide::mesh::MeshDescriptor;
use crate::waveguide::setup::CondensedNode;

/// Sizes and field offsets of the shared boundary structures.
///
/// The host computes this record from its own types; each backend reports
/// the layout its kernels consume. The two must agree bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutInfo {
    pub sz_memory_canonical: u32,
    pub sz_coefficients_canonical: u32,
    pub sz_boundary_data: u32,
    pub sz_boundary_data_array_3: u32,
    pub off_bd_filter_memory: u32,
    pub off_bd_coefficient_index: u32,
    pub off_bd_guard_tag: u32,
    pub off_b3_data0: u32,
    pub off_b3_data1: u32,
    pub off_b3_data2: u32,
}

/// Layout of the boundary structures as laid out by the host compiler.
pub fn host_layout_info() -> LayoutInfo {
    let b3_base = offset_of!(BoundaryDataArray<3>, array) as u32;
    let stride = size_of::<BoundaryData>() as u32;
    LayoutInfo {
        sz_memory_canonical: size_of::<MemoryCanonical>() as u32,
        sz_coefficients_canonical: size_of::<CoefficientsCanonical>() as u32,
        sz_boundary_data: stride,
        sz_boundary_data_array_3: size_of::<BoundaryDataArray<3>>() as u32,
        off_bd_filter_memory: offset_of!(BoundaryData, filter_memory) as u32,
        off_bd_coefficient_index: offset_of!(BoundaryData, coefficient_index) as u32,
        off_bd_guard_tag: offset_of!(BoundaryData, guard_tag) as u32,
        off_b3_data0: b3_base,
        off_b3_data1: b3_base + stride,
        off_b3_data2: b3_base + 2 * stride,
    }
}

/// Arguments of the pressure kernel. `previous` is overwritten in place
/// with the next pressures; neighbour reads come from `current` only.
pub struct PressureKernelArgs<'a> {
    pub previous: &'a mut [f32],
    pub current: &'a [f32],
    pub nodes: &'a [CondensedNode],
    pub descriptor: &'a MeshDescriptor,
    pub boundary_1: &'a [BoundaryDataArray<1>],
    pub boundary_2: &'a [BoundaryDataArray<2>],
    pub boundary_3: &'a [BoundaryDataArray<3>],
    pub coefficients: &'a [CoefficientsCanonical],
    pub errors: &'a AtomicU32,
    pub diagnostics: &'a Diagnostics,
    pub step: usize,
    pub trace_node: Option<u64>,
}

/// Arguments of the boundary-filter kernel of dimensionality `D`.
pub struct BoundaryKernelArgs<'a, const D: usize> {
    pub storage: &'a mut [BoundaryDataArray<D>],
    pub boundary_nodes: &'a [u32],
    pub nodes: &'a [CondensedNode],
    pub descriptor: &'a MeshDescriptor,
    pub previous_history: &'a [f32],
    pub current: &'a [f32],
    pub next: &'a [f32],
    pub coefficients: &'a [CoefficientsCanonical],
    pub errors: &'a AtomicU32,
    pub diagnostics: &'a Diagnostics,
    pub step: usize,
    pub trace_node: Option<u64>,
}

/// Executes waveguide kernels. Submission is synchronous: when a kernel
/// method returns, all its lanes have completed.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reports the boundary-structure layout the backend's kernels use.
    fn layout_probe(&self) -> LayoutInfo;

    fn zero(&self, buffer: &mut [f32]);

    fn pressure_kernel(&self, args: PressureKernelArgs<'_>);

    fn boundary_kernel_1(&self, args: BoundaryKernelArgs<'_, 1>);
    fn boundary_kernel_2(&self, args: BoundaryKernelArgs<'_, 2>);
    fn boundary_kernel_3(&self, args: BoundaryKernelArgs<'_, 3>);
}

fn pressure_lane(
    index: usize,
    prev_cell: &mut f32,
    current: &[f32],
    nodes: &[CondensedNode],
    descriptor: &MeshDescriptor,
    boundary_1: &[BoundaryDataArray<1>],
    boundary_2: &[BoundaryDataArray<2>],
    boundary_3: &[BoundaryDataArray<3>],
    coefficients: &[CoefficientsCanonical],
    errors: &AtomicU32,
    diagnostics: &Diagnostics,
    step: usize,
    trace_node: Option<u64>,
) {
    let prev_pressure = *prev_cell;
    let next = next_pressure(
        index as u32,
        nodes,
        prev_pressure,
        current,
        descriptor,
        boundary_1,
        boundary_2,
        boundary_3,
        coefficients,
        errors,
        diagnostics,
        step,
    );
    check_pressure(index as u32, prev_pressure, next, errors, diagnostics, step);
    if trace_node == Some(index as u64) {
        log::trace!(
            "pressure step={step} node={index} prev={prev_pressure} curr={} next={next}",
            current[index],
        );
    }
    *prev_cell = next;
}

fn run_pressure(args: PressureKernelArgs<'_>, parallel: bool) {
    let PressureKernelArgs {
        previous,
        current,
        nodes,
        descriptor,
        boundary_1,
        boundary_2,
        boundary_3,
        coefficients,
        errors,
        diagnostics,
        step,
        trace_node,
    } = args;

    if parallel {
        previous
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, prev_cell)| {
                pressure_lane(
                    index, prev_cell, current, nodes, descriptor, boundary_1, boundary_2,
                    boundary_3, coefficients, errors, diagnostics, step, trace_node,
                )
            });
    } else {
        previous
            .iter_mut()
            .enumerate()
            .for_each(|(index, prev_cell)| {
                pressure_lane(
                    index, prev_cell, current, nodes, descriptor, boundary_1, boundary_2,
                    boundary_3, coefficients, errors, diagnostics, step, trace_node,
                )
            });
    }
}

fn run_boundary<const D: usize>(args: BoundaryKernelArgs<'_, D>, parallel: bool) {
    let BoundaryKernelArgs {
        storage,
        boundary_nodes,
        nodes,
        descriptor,
        previous_history,
        current,
        next,
        coefficients,
        errors,
        diagnostics,
        step,
        trace_node,
    } = args;

    let lane = |(work_index, entry): (usize, &mut BoundaryDataArray<D>)| {
        update_boundary_entry(
            work_index,
            entry,
            boundary_nodes,
            nodes,
            descriptor,
            previous_history,
            current,
            next,
            coefficients,
            errors,
            diagnostics,
            step,
            trace_node,
        )
    };

    if parallel {
        storage.par_iter_mut().enumerate().for_each(lane);
    } else {
        storage.iter_mut().enumerate().for_each(lane);
    }
}

/// Data-parallel backend over the work-queue thread pool.
pub struct AcceleratorBackend;

impl ComputeBackend for AcceleratorBackend {
    fn name(&self) -> &'static str {
        "accelerator"
    }

    fn layout_probe(&self) -> LayoutInfo {
        // The probe runs as a job on the same pool that executes kernels.
        let mut probed = None;
        rayon::scope(|scope| {
            scope.spawn(|_| probed = Some(host_layout_info()));
        });
        probed.expect("layout probe job completed")
    }

    fn zero(&self, buffer: &mut [f32]) {
        buffer.par_iter_mut().for_each(|v| *v = 0.0);
    }

    fn pressure_kernel(&self, args: PressureKernelArgs<'_>) {
        run_pressure(args, true);
    }

    fn boundary_kernel_1(&self, args: BoundaryKernelArgs<'_, 1>) {
        run_boundary(args, true);
    }

    fn boundary_kernel_2(&self, args: BoundaryKernelArgs<'_, 2>) {
        run_boundary(args, true);
    }

    fn boundary_kernel_3(&self, args: BoundaryKernelArgs<'_, 3>) {
        run_boundary(args, true);
    }
}

/// Sequential host reference backend.
pub struct CpuBackend;

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn layout_probe(&self) -> LayoutInfo {
        host_layout_info()
    }

    fn zero(&self, buffer: &mut [f32]) {
        buffer.fill(0.0);
    }

    fn pressure_kernel(&self, args: PressureKernelArgs<'_>) {
        run_pressure(args, false);
    }

    fn boundary_kernel_1(&self, args: BoundaryKernelArgs<'_, 1>) {
        run_boundary(args, false);
    }

    fn boundary_kernel_2(&self, args: BoundaryKernelArgs<'_, 2>) {
        run_boundary(args, false);
    }

    fn boundary_kernel_3(&self, args: BoundaryKernelArgs<'_, 3>) {
        run_boundary(args, false);
    }
}

/// Builds the backend selected by the runtime options.
pub fn select_backend(options: &RuntimeOptions) -> Result<Box<dyn ComputeBackend>> {
    Ok(match options.backend {
        BackendKind::Accelerator => Box::new(AcceleratorBackend),
        BackendKind::Cpu => Box::new(CpuBackend),
    })
}
