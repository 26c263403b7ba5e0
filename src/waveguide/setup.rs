//! Node classification and surface coefficient tables.

use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::scene::{Surface, VoxelisedScene};
use crate::waveguide::filters::{
    is_stable, reflectance_filter, to_impedance_coefficients, CoefficientsCanonical, MIN_B0,
};
use crate::waveguide::mesh::{MeshDescriptor, PORTS};

/// Node classification bits.
pub const ID_NONE: i32 = 0;
pub const ID_INSIDE: i32 = 1 << 0;
pub const ID_NX: i32 = 1 << 1;
pub const ID_PX: i32 = 1 << 2;
pub const ID_NY: i32 = 1 << 3;
pub const ID_PY: i32 = 1 << 4;
pub const ID_NZ: i32 = 1 << 5;
pub const ID_PZ: i32 = 1 << 6;
pub const ID_REENTRANT: i32 = 1 << 7;

/// Face bit per port, in port order.
pub const FACE_BITS: [i32; PORTS] = [ID_NX, ID_PX, ID_NY, ID_PY, ID_NZ, ID_PZ];

/// One grid node: classification bits plus a dense boundary index.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondensedNode {
    pub boundary_type: i32,
    /// Meaningful only when at least one face bit is set.
    pub boundary_index: u32,
}

/// Face bits of a node type (INSIDE/REENTRANT masked out).
pub fn face_bits(boundary_type: i32) -> i32 {
    boundary_type & !(ID_INSIDE | ID_REENTRANT)
}

/// Number of set face bits.
pub fn face_bit_count(boundary_type: i32) -> u32 {
    face_bits(boundary_type).count_ones()
}

/// Whether the node runs the interior stencil.
pub fn is_interior(boundary_type: i32) -> bool {
    boundary_type & (ID_INSIDE | ID_REENTRANT) != 0
}

/// Whether the node is a boundary node of any dimensionality.
pub fn is_boundary(boundary_type: i32) -> bool {
    !is_interior(boundary_type) && matches!(face_bit_count(boundary_type), 1..=3)
}

/// Whether the node is a boundary node of dimensionality `d`.
pub fn is_boundary_d(boundary_type: i32, d: u32) -> bool {
    is_boundary(boundary_type) && face_bit_count(boundary_type) == d
}

/// Slot of a face within its node's boundary entry.
///
/// Faces are packed in port order; the slot is the rank of the face bit
/// among the set bits. Returns `None` if the bit is not set.
pub fn boundary_local_index(boundary_type: i32, face_bit: i32) -> Option<usize> {
    let mask = face_bits(boundary_type);
    if face_bit == 0 || mask & face_bit == 0 {
        return None;
    }
    Some((mask & (face_bit - 1)).count_ones() as usize)
}

/// Classifies every grid node as interior, boundary or exterior.
///
/// A node is interior when the parity ray cast against the voxelised scene
/// lands inside; interior nodes adjacent to exterior (or off-grid) space
/// become boundary nodes with one face bit per outside neighbour. Nodes
/// with four or more outside neighbours have no regular boundary update
/// and are marked reentrant instead.
pub fn classify_nodes(
    descriptor: &MeshDescriptor,
    voxels: &VoxelisedScene,
) -> Result<Vec<CondensedNode>> {
    let num_nodes = descriptor.num_nodes();

    let inside: Vec<bool> = (0..num_nodes as u32)
        .into_par_iter()
        .map(|index| voxels.is_inside(descriptor.position(index)))
        .collect();

    if !inside.iter().any(|&i| i) {
        return Err(EngineError::EmptyInterior);
    }

    let nodes: Vec<CondensedNode> = (0..num_nodes as u32)
        .into_par_iter()
        .map(|index| {
            if !inside[index as usize] {
                return CondensedNode {
                    boundary_type: ID_NONE,
                    boundary_index: 0,
                };
            }
            let mut bits = ID_NONE;
            for (port, &bit) in FACE_BITS.iter().enumerate() {
                let neighbor = descriptor.neighbor(index, port);
                let outside =
                    neighbor == crate::waveguide::mesh::NO_NEIGHBOR || !inside[neighbor as usize];
                if outside {
                    bits |= bit;
                }
            }
            let boundary_type = match bits.count_ones() {
                0 => ID_INSIDE,
                1..=3 => bits,
                _ => ID_INSIDE | ID_REENTRANT,
            };
            CondensedNode {
                boundary_type,
                boundary_index: 0,
            }
        })
        .collect();

    Ok(nodes)
}

/// Room volume estimated from the interior node count.
pub fn estimate_volume(descriptor: &MeshDescriptor, nodes: &[CondensedNode]) -> f64 {
    let interior = nodes
        .iter()
        .filter(|n| is_interior(n.boundary_type) || is_boundary(n.boundary_type))
        .count();
    let spacing = descriptor.spacing as f64;
    spacing * spacing * spacing * interior as f64
}

/// Builds the impedance coefficient table, one set per scene surface.
pub fn build_surface_coefficients(
    surfaces: &[Surface],
    mesh_sample_rate: f64,
    force_identity: bool,
) -> Vec<CoefficientsCanonical> {
    let mut coefficients: Vec<CoefficientsCanonical> = surfaces
        .iter()
        .map(|surface| {
            if force_identity {
                // The boundary-probe override: rigid walls everywhere.
                return crate::waveguide::filters::to_flat_coefficients(0.0);
            }

            let reflectance = reflectance_filter(&surface.absorption, mesh_sample_rate);
            let mut coeffs = to_impedance_coefficients(&reflectance);
            for value in coeffs.b.iter_mut().chain(coeffs.a.iter_mut()) {
                if !value.is_finite() {
                    *value = 0.0;
                }
            }

            // A near-zero denominator polynomial is the rigid limit, not an
            // unstable filter; the kernel guards that division separately.
            let effectively_rigid = coeffs.a[0].abs() < MIN_B0;
            if !effectively_rigid && !is_stable(&coeffs.a) {
                return CoefficientsCanonical::identity();
            }
            coeffs
        })
        .collect();

    let sanitized = sanitize_coefficients(&mut coefficients);
    if sanitized != 0 {
        log::warn!("sanitized {sanitized} boundary coefficient set(s); applied identity fallback");
    }
    coefficients
}

/// Replaces degenerate coefficient sets with the identity filter.
///
/// A set is degenerate when it is all-zero, or when `b[0]` is non-finite or
/// below [`MIN_B0`]. Returns the number of replaced sets and logs |b0|
/// statistics.
pub fn sanitize_coefficients(coefficients: &mut [CoefficientsCanonical]) -> usize {
    let mut sanitized = 0;
    let mut min_b0 = f64::INFINITY;
    let mut max_b0 = 0.0f64;
    for coeff in coefficients.iter_mut() {
        let all_zero = coeff
            .a
            .iter()
            .chain(coeff.b.iter())
            .all(|&value| value == 0.0);
        let b0 = coeff.b[0] as f64;
        min_b0 = min_b0.min(b0.abs());
        max_b0 = max_b0.max(b0.abs());
        if all_zero || !b0.is_finite() || b0.abs() < MIN_B0 as f64 {
            *coeff = CoefficientsCanonical::identity();
            sanitized += 1;
        }
    }
    if !coefficients.is_empty() {
        log::debug!(
            "coefficient sets: {} min|b0|={min_b0:.3e} max|b0|={max_b0:.3e}",
            coefficients.len()
        );
    }
    sanitized
}
