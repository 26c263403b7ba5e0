//! The waveguide update kernels.
//!
//! One time step is two passes: a pressure pass over every node (interior
//! stencil or 1-/2-/3-face boundary update), then a boundary pass that
//! feeds the ghost-point filters from the just-computed pressures. The
//! passes are data-parallel over disjoint output cells; error flags and the
//! first-failure diagnostics record are the only shared writes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::waveguide::boundary::BoundaryDataArray;
use crate::waveguide::filters::{
    canonical_step, CoefficientsCanonical, MemoryCanonical, CANONICAL_ORDER, MIN_B0,
};
use crate::waveguide::mesh::{opposite_port, port_axis, MeshDescriptor, NO_NEIGHBOR, PORTS};
use crate::waveguide::setup::{
    boundary_local_index, face_bit_count, is_interior, CondensedNode, FACE_BITS, ID_INSIDE,
    ID_NONE,
};

/// Courant number of the 6-port rectilinear scheme.
pub const COURANT: f32 = 0.577_350_3;
/// Squared Courant number.
pub const COURANT_SQ: f32 = 1.0 / 3.0;

/// Filter-memory cells beyond this magnitude reset the delay line.
pub const FILTER_MEMORY_LIMIT: f32 = 1.0e30;

/// Error word bits, OR-ed atomically by the kernels.
pub const ERR_OUTSIDE_MESH: u32 = 1 << 0;
pub const ERR_SUSPICIOUS_BOUNDARY: u32 = 1 << 1;
pub const ERR_INF: u32 = 1 << 2;
pub const ERR_NAN: u32 = 1 << 3;
pub const ERR_OUTSIDE_RANGE: u32 = 1 << 4;

/// First offending update captured when a numerical fault occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NanRecord {
    /// 1..3: ghost-point stages; 10/11: recovered memory clamps;
    /// 100: pressure NaN; 200+D: boundary division fault.
    pub code: u32,
    pub step: usize,
    pub node: u32,
    pub boundary_index: u32,
    /// Face slot within the boundary entry, -1 when not applicable.
    pub local_face: i32,
    pub coefficient_index: u32,
    /// Bit patterns of the participating f32 values.
    pub filt_state_bits: u32,
    pub a0_bits: u32,
    pub b0_bits: u32,
    pub diff_bits: u32,
    pub filter_input_bits: u32,
    pub prev_bits: u32,
    pub next_bits: u32,
}

/// First-write-wins diagnostics slot shared by all kernel lanes.
#[derive(Debug, Default)]
pub struct Diagnostics {
    record: OnceLock<NanRecord>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the record unless one is already present.
    pub fn record(&self, record: NanRecord) {
        let _ = self.record.set(record);
    }

    pub fn get(&self) -> Option<&NanRecord> {
        self.record.get()
    }
}

fn flag(errors: &AtomicU32, bits: u32) {
    errors.fetch_or(bits, Ordering::Relaxed);
}

/// Interior stencil: mean of the six neighbours scaled by 2, minus the
/// previous pressure. Missing neighbours contribute zero and set the
/// outside-mesh flag.
fn interior_update(
    index: u32,
    prev_pressure: f32,
    current: &[f32],
    descriptor: &MeshDescriptor,
    errors: &AtomicU32,
) -> f32 {
    let mut sum = 0.0;
    for port in 0..PORTS {
        let neighbor = descriptor.neighbor(index, port);
        if neighbor == NO_NEIGHBOR {
            flag(errors, ERR_OUTSIDE_MESH);
            continue;
        }
        sum += current[neighbor as usize];
    }
    sum / (PORTS as f32 / 2.0) - prev_pressure
}

/// Pressure update of a boundary node of any dimensionality.
///
/// `slots` are the node's face slots in packed order.
#[allow(clippy::too_many_arguments)]
fn boundary_pressure(
    index: u32,
    boundary_type: i32,
    boundary_index: u32,
    slots: &[crate::waveguide::boundary::BoundaryData],
    nodes: &[CondensedNode],
    prev_pressure: f32,
    current: &[f32],
    descriptor: &MeshDescriptor,
    coefficients: &[CoefficientsCanonical],
    errors: &AtomicU32,
    diagnostics: &Diagnostics,
    step: usize,
) -> f32 {
    // Ports pointing into the room, opposite each set face bit.
    let mut axes_used = [false; 3];
    let mut inner_sum = 0.0;
    for (port, &bit) in FACE_BITS.iter().enumerate() {
        if boundary_type & bit == 0 {
            continue;
        }
        axes_used[port_axis(port)] = true;
        let inner_port = opposite_port(port);
        let neighbor = descriptor.neighbor(index, inner_port);
        if neighbor == NO_NEIGHBOR {
            flag(errors, ERR_OUTSIDE_MESH);
            continue;
        }
        inner_sum += 2.0 * current[neighbor as usize];
    }

    // In-plane neighbours along the unused axes.
    let mut surrounding_sum = 0.0;
    for port in 0..PORTS {
        if axes_used[port_axis(port)] {
            continue;
        }
        let neighbor = descriptor.neighbor(index, port);
        if neighbor == NO_NEIGHBOR {
            flag(errors, ERR_OUTSIDE_MESH);
            continue;
        }
        let neighbor_type = nodes[neighbor as usize].boundary_type;
        if neighbor_type == ID_NONE || neighbor_type == ID_INSIDE {
            flag(errors, ERR_SUSPICIOUS_BOUNDARY);
        }
        surrounding_sum += current[neighbor as usize];
    }

    let weighted_surrounding = COURANT_SQ * (inner_sum + surrounding_sum);

    let mut filter_weighting = 0.0;
    let mut coeff_weighting = 0.0;
    for slot in slots {
        let ci = slot.coefficient_index as usize;
        let Some(coeffs) = coefficients.get(ci) else {
            flag(errors, ERR_OUTSIDE_RANGE);
            continue;
        };
        if coeffs.b[0].abs() > MIN_B0 {
            filter_weighting += slot.filter_memory.array[0] / coeffs.b[0];
            coeff_weighting += coeffs.a[0] / coeffs.b[0];
        }
    }
    let filter_weighting = COURANT_SQ * filter_weighting;
    let coeff_weighting = COURANT * coeff_weighting;

    let numerator =
        weighted_surrounding + filter_weighting + (coeff_weighting - 1.0) * prev_pressure;
    let mut denominator = 1.0 + coeff_weighting;
    if !denominator.is_finite() || denominator.abs() < 1e-12 {
        flag(errors, ERR_SUSPICIOUS_BOUNDARY);
        denominator = if denominator >= 0.0 { 1.0 } else { -1.0 };
    }

    let ret = numerator / denominator;
    if !ret.is_finite() {
        diagnostics.record(NanRecord {
            code: 200 + slots.len() as u32,
            step,
            node: index,
            boundary_index,
            local_face: -1,
            coefficient_index: 0,
            filt_state_bits: filter_weighting.to_bits(),
            a0_bits: coeff_weighting.to_bits(),
            b0_bits: denominator.to_bits(),
            diff_bits: numerator.to_bits(),
            filter_input_bits: denominator.to_bits(),
            prev_bits: prev_pressure.to_bits(),
            next_bits: ret.to_bits(),
        });
        flag(errors, ERR_NAN);
        return 0.0;
    }
    ret
}

/// Computes the next pressure of one node from the current/previous state.
///
/// This is the per-lane body of the pressure kernel; both backends call it
/// for every node index.
#[allow(clippy::too_many_arguments)]
pub fn next_pressure(
    index: u32,
    nodes: &[CondensedNode],
    prev_pressure: f32,
    current: &[f32],
    descriptor: &MeshDescriptor,
    boundary_1: &[BoundaryDataArray<1>],
    boundary_2: &[BoundaryDataArray<2>],
    boundary_3: &[BoundaryDataArray<3>],
    coefficients: &[CoefficientsCanonical],
    errors: &AtomicU32,
    diagnostics: &Diagnostics,
    step: usize,
) -> f32 {
    let node = nodes[index as usize];
    let bt = node.boundary_type;

    if is_interior(bt) {
        return interior_update(index, prev_pressure, current, descriptor, errors);
    }

    let bi = node.boundary_index as usize;
    let slots: &[crate::waveguide::boundary::BoundaryData] = match face_bit_count(bt) {
        1 => match boundary_1.get(bi) {
            Some(entry) => &entry.array,
            None => {
                flag(errors, ERR_OUTSIDE_RANGE);
                return 0.0;
            }
        },
        2 => match boundary_2.get(bi) {
            Some(entry) => &entry.array,
            None => {
                flag(errors, ERR_OUTSIDE_RANGE);
                return 0.0;
            }
        },
        3 => match boundary_3.get(bi) {
            Some(entry) => &entry.array,
            None => {
                flag(errors, ERR_OUTSIDE_RANGE);
                return 0.0;
            }
        },
        // Exterior nodes hold no pressure.
        _ => return 0.0,
    };

    let ret = boundary_pressure(
        index,
        bt,
        node.boundary_index,
        slots,
        nodes,
        prev_pressure,
        current,
        descriptor,
        coefficients,
        errors,
        diagnostics,
        step,
    );

    if ret.is_infinite() {
        flag(errors, ERR_INF);
    }
    ret
}

/// Checks a freshly computed pressure for NaN/Inf and records diagnostics.
pub fn check_pressure(
    index: u32,
    prev_pressure: f32,
    next: f32,
    errors: &AtomicU32,
    diagnostics: &Diagnostics,
    step: usize,
) {
    if next.is_infinite() {
        flag(errors, ERR_INF);
    }
    if next.is_nan() {
        diagnostics.record(NanRecord {
            code: 100,
            step,
            node: index,
            boundary_index: 0,
            local_face: 0,
            coefficient_index: 0,
            filt_state_bits: 0,
            a0_bits: 0,
            b0_bits: 0,
            diff_bits: 0,
            filter_input_bits: 0,
            prev_bits: prev_pressure.to_bits(),
            next_bits: next.to_bits(),
        });
        flag(errors, ERR_NAN);
    }
}

/// Ghost-point update of one face's filter delay line.
///
/// Consumes the node's previous and next pressures; the inner pressure is
/// read by the caller for tracing and the outside-mesh check only.
#[allow(clippy::too_many_arguments)]
pub fn ghost_point_update(
    bd: &mut crate::waveguide::boundary::BoundaryData,
    coeffs: &CoefficientsCanonical,
    next_pressure: f32,
    prev_pressure: f32,
    errors: &AtomicU32,
    diagnostics: &Diagnostics,
    global_index: u32,
    boundary_index: u32,
    local_face: usize,
    step: usize,
) {
    let mut a0 = coeffs.a[0];
    let mut b0 = coeffs.b[0];
    if !a0.is_finite() {
        a0 = 1.0;
    }
    if !b0.is_finite() {
        b0 = 1.0;
    }
    // Both denominators vanished: the face carries no filter.
    if b0.abs() < MIN_B0 && a0.abs() < MIN_B0 {
        return;
    }

    let make_record = |code: u32, filt_state: f32, diff: f32, filter_input: f32| NanRecord {
        code,
        step,
        node: global_index,
        boundary_index,
        local_face: local_face as i32,
        coefficient_index: bd.coefficient_index,
        filt_state_bits: filt_state.to_bits(),
        a0_bits: a0.to_bits(),
        b0_bits: b0.to_bits(),
        diff_bits: diff.to_bits(),
        filter_input_bits: filter_input.to_bits(),
        prev_bits: prev_pressure.to_bits(),
        next_bits: next_pressure.to_bits(),
    };

    let mut filt_state = bd.filter_memory.array[0];
    if !filt_state.is_finite() {
        filt_state = 0.0;
    }

    // Recover a blown delay line locally: zero it and keep going (code 10).
    let needs_reset = bd.filter_memory.array[..CANONICAL_ORDER]
        .iter()
        .any(|&v| !v.is_finite() || v.abs() > FILTER_MEMORY_LIMIT);
    if needs_reset {
        diagnostics.record(make_record(10, filt_state, 0.0, 0.0));
        bd.filter_memory = MemoryCanonical::default();
        filt_state = 0.0;
    }

    let delta = prev_pressure - next_pressure;
    if delta == 0.0 && filt_state == 0.0 {
        bd.filter_memory.array[0] = 0.0;
        return;
    }

    let safe_b0 = if b0.abs() > MIN_B0 {
        b0
    } else {
        b0.signum().max(-1.0).min(1.0) * MIN_B0
    };
    let diff = a0 * delta / (safe_b0 * COURANT) + filt_state / safe_b0;
    if !diff.is_finite() {
        flag(errors, ERR_NAN);
        diagnostics.record(make_record(1, filt_state, diff, 0.0));
        bd.filter_memory.array[0] = f32::NAN;
        return;
    }

    let filter_input = -diff;

    let mut memory = bd.filter_memory;
    let output = canonical_step(filter_input, &mut memory, coeffs);
    if !output.is_finite() {
        flag(errors, ERR_NAN);
        diagnostics.record(make_record(3, filt_state, diff, filter_input));
    }

    // Per-step clamp after the recurrence (code 11).
    let mut clamped = false;
    for value in memory.array[..CANONICAL_ORDER].iter_mut() {
        if !value.is_finite() || value.abs() > FILTER_MEMORY_LIMIT {
            *value = 0.0;
            clamped = true;
        }
    }
    if clamped {
        diagnostics.record(make_record(11, filt_state, diff, filter_input));
    }

    bd.filter_memory = memory;
}

/// Boundary-filter update of one table entry: runs the ghost-point update
/// of every face of the node.
///
/// This is the per-lane body of the boundary kernel of dimensionality `D`.
#[allow(clippy::too_many_arguments)]
pub fn update_boundary_entry<const D: usize>(
    work_index: usize,
    entry: &mut BoundaryDataArray<D>,
    boundary_nodes: &[u32],
    nodes: &[CondensedNode],
    descriptor: &MeshDescriptor,
    previous_history: &[f32],
    current: &[f32],
    next: &[f32],
    coefficients: &[CoefficientsCanonical],
    errors: &AtomicU32,
    diagnostics: &Diagnostics,
    step: usize,
    trace_node: Option<u64>,
) {
    let Some(&global_index) = boundary_nodes.get(work_index) else {
        flag(errors, ERR_OUTSIDE_RANGE);
        return;
    };
    let node = nodes[global_index as usize];
    if node.boundary_index as usize != work_index {
        flag(errors, ERR_OUTSIDE_RANGE);
        return;
    }

    let next_pressure = next[global_index as usize];
    let prev_pressure = previous_history[global_index as usize];

    for (port, &bit) in FACE_BITS.iter().enumerate() {
        let Some(local_face) = boundary_local_index(node.boundary_type, bit) else {
            continue;
        };
        if local_face >= D {
            flag(errors, ERR_SUSPICIOUS_BOUNDARY);
            continue;
        }
        let bd = &mut entry.array[local_face];
        let ci = bd.coefficient_index as usize;
        let Some(boundary_coeffs) = coefficients.get(ci) else {
            flag(errors, ERR_OUTSIDE_RANGE);
            continue;
        };

        // The inner pressure participates only in diagnostics.
        let inner_port = opposite_port(port);
        let inner = descriptor.neighbor(global_index, inner_port);
        let inner_pressure = if inner == NO_NEIGHBOR {
            flag(errors, ERR_OUTSIDE_MESH);
            0.0
        } else {
            current[inner as usize]
        };

        if trace_node == Some(global_index as u64) {
            log::trace!(
                "boundary_{D} step={step} node={global_index} face={local_face} \
                 prev={prev_pressure} curr={} next={next_pressure} inner={inner_pressure} \
                 fs0={} a0={} b0={}",
                current[global_index as usize],
                bd.filter_memory.array[0],
                boundary_coeffs.a[0],
                boundary_coeffs.b[0],
            );
        }

        ghost_point_update(
            bd,
            boundary_coeffs,
            next_pressure,
            prev_pressure,
            errors,
            diagnostics,
            global_index,
            node.boundary_index,
            local_face,
            step,
        );
    }
}
