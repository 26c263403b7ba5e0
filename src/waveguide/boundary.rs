//! Boundary storage: Morton-ordered per-dimension tables, headers with
//! guard tags, coefficient blocks and signed-distance side data.
//!
//! All cross-references between the tables are integer handles; the
//! condensed node's `boundary_index` points into the dense per-dimension
//! array of its own dimensionality.

use crate::geom::{point_triangle_distance_sq, Ray, Vec3};
use crate::scene::VoxelisedScene;
use crate::waveguide::filters::{CoefficientsCanonical, MemoryCanonical};
use crate::waveguide::mesh::{MeshDescriptor, PORTS};
use crate::waveguide::setup::{
    boundary_local_index, face_bit_count, is_boundary, is_boundary_d, CondensedNode, FACE_BITS,
};

/// XOR mask applied to node indices stored in headers and guard tags.
pub const GUARD_MASK: u32 = 0xA5A5_A5A5;

/// Sentinel in the reverse node lookup table.
pub const NO_BOUNDARY_ENTRY: u32 = u32::MAX;

/// One boundary face slot: filter delay line plus its coefficient handle.
///
/// The layout (including the trailing padding) is what the accelerator
/// consumes; the layout probe asserts parity on sizes and offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryData {
    pub filter_memory: MemoryCanonical,
    pub coefficient_index: u32,
    pub guard_tag: u32,
    pub _pad: [u32; 6],
}

impl BoundaryData {
    pub fn new(coefficient_index: u32, node_index: u32) -> Self {
        Self {
            filter_memory: MemoryCanonical::default(),
            coefficient_index,
            guard_tag: node_index ^ GUARD_MASK,
            _pad: [0; 6],
        }
    }
}

/// The filter slots of one boundary node of dimensionality `D`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryDataArray<const D: usize> {
    pub array: [BoundaryData; D],
}

/// Per-entry header of the packed boundary layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryHeader {
    /// `node_index ^ GUARD_MASK`.
    pub guard: u32,
    /// Low 6 bits: face mask in port order; bits 6..16: coefficient-block id.
    pub dif: u16,
    /// Coefficient id of the first set face.
    pub material_index: u16,
}

/// Dense per-dimension boundary tables plus their node side tables.
#[derive(Debug, Clone)]
pub struct BoundaryIndexData {
    pub b1: Vec<BoundaryDataArray<1>>,
    pub b2: Vec<BoundaryDataArray<2>>,
    pub b3: Vec<BoundaryDataArray<3>>,
    /// Node index of each D=1 entry, in entry order.
    pub nodes1: Vec<u32>,
    pub nodes2: Vec<u32>,
    pub nodes3: Vec<u32>,
}

/// Packed boundary layout: headers, coefficient blocks and SDF side data,
/// one entry per boundary node of any dimensionality, in Morton order.
#[derive(Debug, Clone)]
pub struct BoundaryLayout {
    pub headers: Vec<BoundaryHeader>,
    /// Six canonical sets per entry, identity where the face bit is clear.
    pub coeff_blocks: Vec<CoefficientsCanonical>,
    pub coeff_block_offsets: Vec<u32>,
    pub sdf_distance: Vec<f32>,
    pub sdf_normal: Vec<Vec3>,
    /// Global node index per entry.
    pub node_indices: Vec<u32>,
    /// Global node index -> entry index, or [`NO_BOUNDARY_ENTRY`].
    pub node_lookup: Vec<u32>,
}

/// Interleaves the low 21 bits of each coordinate.
pub fn encode_morton3(x: u32, y: u32, z: u32) -> u64 {
    fn part(v: u32) -> u64 {
        let mut x = v as u64;
        x = (x | (x << 32)) & 0x1F00000000FFFF;
        x = (x | (x << 16)) & 0x1F0000FF0000FF;
        x = (x | (x << 8)) & 0x100F00F00F00F00F;
        x = (x | (x << 4)) & 0x10C30C30C30C30C3;
        x = (x | (x << 2)) & 0x1249249249249249;
        x
    }
    (part(z) << 2) | (part(y) << 1) | part(x)
}

struct BoundaryEntry {
    node_index: u32,
    morton: u64,
    boundary_type: i32,
}

fn sorted_boundary_entries(
    descriptor: &MeshDescriptor,
    nodes: &[CondensedNode],
) -> Vec<BoundaryEntry> {
    let mut entries: Vec<BoundaryEntry> = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| is_boundary(node.boundary_type))
        .map(|(index, node)| {
            let loc = descriptor.locator(index as u32);
            BoundaryEntry {
                node_index: index as u32,
                morton: encode_morton3(loc[0] as u32, loc[1] as u32, loc[2] as u32),
                boundary_type: node.boundary_type,
            }
        })
        .collect();
    entries.sort_by(|a, b| {
        a.morton
            .cmp(&b.morton)
            .then(a.node_index.cmp(&b.node_index))
    });
    entries
}

/// Surface id used when a face ray fails to find a wall.
const FALLBACK_SURFACE: u32 = 0;

/// Resolves the coefficient-set index of one boundary face.
///
/// Casts from the node centre along the outward face axis and takes the
/// surface of the closest triangle; the wall sits within a few spacings of
/// its boundary node.
pub fn face_coefficient_index(
    descriptor: &MeshDescriptor,
    voxels: &VoxelisedScene,
    node_index: u32,
    face_port: usize,
) -> u32 {
    let position = descriptor.position(node_index);
    let off = crate::waveguide::mesh::port_offset(face_port);
    let direction = Vec3::new(off[0] as f32, off[1] as f32, off[2] as f32);
    let Some(ray) = Ray::new(position, direction) else {
        return FALLBACK_SURFACE;
    };
    let near = 4.0 * descriptor.spacing;
    let reach = voxels.aabb().diagonal();
    for max_dist in [near, reach] {
        if let Some((tri, _)) = voxels.closest_intersection(&ray, max_dist, None) {
            return voxels.scene().triangles[tri as usize].surface;
        }
    }
    FALLBACK_SURFACE
}

/// Assigns dense Morton-ordered boundary indices and builds the
/// per-dimension tables.
///
/// `coefficient_for_face(node_index, port)` supplies each face's
/// coefficient-set index (default path: voxel lookup along the face axis;
/// a precomputed-label path may substitute its own closure).
pub fn assign_boundary_indices(
    descriptor: &MeshDescriptor,
    nodes: &mut [CondensedNode],
    mut coefficient_for_face: impl FnMut(u32, usize) -> u32,
) -> BoundaryIndexData {
    let entries = sorted_boundary_entries(descriptor, nodes);

    let mut data = BoundaryIndexData {
        b1: Vec::new(),
        b2: Vec::new(),
        b3: Vec::new(),
        nodes1: Vec::new(),
        nodes2: Vec::new(),
        nodes3: Vec::new(),
    };

    for entry in &entries {
        let mut slots = [BoundaryData::new(FALLBACK_SURFACE, entry.node_index); 3];
        for (port, &bit) in FACE_BITS.iter().enumerate() {
            if let Some(slot) = boundary_local_index(entry.boundary_type, bit) {
                slots[slot] = BoundaryData::new(
                    coefficient_for_face(entry.node_index, port),
                    entry.node_index,
                );
            }
        }

        let node = &mut nodes[entry.node_index as usize];
        match face_bit_count(entry.boundary_type) {
            1 => {
                node.boundary_index = data.b1.len() as u32;
                data.b1.push(BoundaryDataArray { array: [slots[0]] });
                data.nodes1.push(entry.node_index);
            }
            2 => {
                node.boundary_index = data.b2.len() as u32;
                data.b2.push(BoundaryDataArray {
                    array: [slots[0], slots[1]],
                });
                data.nodes2.push(entry.node_index);
            }
            3 => {
                node.boundary_index = data.b3.len() as u32;
                data.b3.push(BoundaryDataArray {
                    array: [slots[0], slots[1], slots[2]],
                });
                data.nodes3.push(entry.node_index);
            }
            _ => unreachable!("sorted_boundary_entries only yields D in 1..=3"),
        }
    }

    data
}

/// Signed distance to the triangle soup with per-node caching.
///
/// Negative inside the room. The search radius grows geometrically from
/// one voxel until a triangle is found or the scene diagonal is exceeded.
pub struct SignedDistanceSolver<'a> {
    descriptor: &'a MeshDescriptor,
    nodes: &'a [CondensedNode],
    voxels: &'a VoxelisedScene,
    cache: Vec<f32>,
}

impl<'a> SignedDistanceSolver<'a> {
    pub fn new(
        descriptor: &'a MeshDescriptor,
        nodes: &'a [CondensedNode],
        voxels: &'a VoxelisedScene,
    ) -> Self {
        Self {
            descriptor,
            nodes,
            voxels,
            cache: vec![f32::NAN; nodes.len()],
        }
    }

    pub fn distance(&mut self, node_index: u32) -> f32 {
        let cached = self.cache[node_index as usize];
        if !cached.is_nan() {
            return cached;
        }
        let position = self.descriptor.position(node_index);
        let unsigned = self.unsigned_distance(position);
        let bt = self.nodes[node_index as usize].boundary_type;
        let inside = crate::waveguide::setup::is_interior(bt) || is_boundary(bt);
        let signed = if inside { -unsigned } else { unsigned };
        self.cache[node_index as usize] = signed;
        signed
    }

    fn unsigned_distance(&self, point: Vec3) -> f32 {
        let aabb = self.voxels.aabb();
        let dims = self.voxels.voxel_dims();
        let side = self.voxels.side() as i32;
        let scene = self.voxels.scene();

        let rel = point - aabb.min;
        let base = [
            ((rel.x / dims.x).floor() as i32).clamp(0, side - 1),
            ((rel.y / dims.y).floor() as i32).clamp(0, side - 1),
            ((rel.z / dims.z).floor() as i32).clamp(0, side - 1),
        ];

        let max_voxel_dim = dims.x.max(dims.y).max(dims.z);
        let diag = aabb.diagonal();

        let mut best = f32::INFINITY;
        let mut found = false;
        let mut radius = max_voxel_dim;
        while radius <= diag {
            let span = [
                ((radius / dims.x).ceil() as i32).max(1),
                ((radius / dims.y).ceil() as i32).max(1),
                ((radius / dims.z).ceil() as i32).max(1),
            ];
            for x in (base[0] - span[0]).max(0)..=(base[0] + span[0]).min(side - 1) {
                for y in (base[1] - span[1]).max(0)..=(base[1] + span[1]).min(side - 1) {
                    for z in (base[2] - span[2]).max(0)..=(base[2] + span[2]).min(side - 1) {
                        for &tri in self.voxels.voxel(x as u32, y as u32, z as u32) {
                            let (v0, v1, v2) = scene.triangle_vertices(tri as usize);
                            let d2 = point_triangle_distance_sq(point, v0, v1, v2);
                            if d2 < best {
                                best = d2;
                                found = true;
                            }
                        }
                    }
                }
            }
            if found {
                break;
            }
            radius *= 1.5;
        }

        if found {
            best.sqrt()
        } else {
            0.0
        }
    }

    /// Unit gradient of the signed distance by central differences.
    pub fn normal(&mut self, node_index: u32) -> Vec3 {
        let loc = self.descriptor.locator(node_index);
        let spacing = self.descriptor.spacing;
        let centre = self.distance(node_index);

        let mut gradient = Vec3::ZERO;
        for axis in 0..3 {
            let mut plus_loc = loc;
            plus_loc[axis] += 1;
            let mut minus_loc = loc;
            minus_loc[axis] -= 1;

            let plus = self
                .descriptor
                .in_bounds(plus_loc)
                .then(|| self.distance(self.descriptor.index(plus_loc)));
            let minus = self
                .descriptor
                .in_bounds(minus_loc)
                .then(|| self.distance(self.descriptor.index(minus_loc)));

            let component = match (plus, minus) {
                (Some(p), Some(m)) => (p - m) / (2.0 * spacing),
                (Some(p), None) => (p - centre) / spacing,
                (None, Some(m)) => (centre - m) / spacing,
                (None, None) => 0.0,
            };
            match axis {
                0 => gradient.x = component,
                1 => gradient.y = component,
                _ => gradient.z = component,
            }
        }

        gradient.normalize().unwrap_or(Vec3::ZERO)
    }
}

/// Builds the packed layout for all boundary nodes.
pub fn build_layout(
    descriptor: &MeshDescriptor,
    nodes: &[CondensedNode],
    index_data: &BoundaryIndexData,
    surface_coefficients: &[CoefficientsCanonical],
    voxels: &VoxelisedScene,
) -> BoundaryLayout {
    let entries = sorted_boundary_entries(descriptor, nodes);

    let mut layout = BoundaryLayout {
        headers: Vec::with_capacity(entries.len()),
        coeff_blocks: Vec::with_capacity(entries.len() * PORTS),
        coeff_block_offsets: Vec::with_capacity(entries.len()),
        sdf_distance: Vec::with_capacity(entries.len()),
        sdf_normal: Vec::with_capacity(entries.len()),
        node_indices: Vec::with_capacity(entries.len()),
        node_lookup: vec![NO_BOUNDARY_ENTRY; nodes.len()],
    };

    let mut solver = SignedDistanceSolver::new(descriptor, nodes, voxels);
    let identity = CoefficientsCanonical::identity();

    for (entry_idx, entry) in entries.iter().enumerate() {
        layout.node_indices.push(entry.node_index);
        layout.node_lookup[entry.node_index as usize] = entry_idx as u32;

        let node = &nodes[entry.node_index as usize];
        let face_coeffs = gather_face_coefficients(node, index_data);

        let block_offset = layout.coeff_blocks.len() as u32;
        layout.coeff_block_offsets.push(block_offset);
        let mut face_mask = 0u16;
        for (port, &bit) in FACE_BITS.iter().enumerate() {
            if entry.boundary_type & bit != 0 {
                face_mask |= 1 << port;
            }
            match face_coeffs[port] {
                Some(coeff_idx) => layout.coeff_blocks.push(
                    surface_coefficients
                        .get(coeff_idx as usize)
                        .copied()
                        .unwrap_or(identity),
                ),
                None => layout.coeff_blocks.push(identity),
            }
        }

        let block_id = block_offset / PORTS as u32;
        let dif = (face_mask & 0x3F) | (((block_id & 0x3FF) << 6) as u16);
        let material_index = face_coeffs
            .iter()
            .flatten()
            .next()
            .map(|&idx| (idx & 0xFFFF) as u16)
            .unwrap_or(0);

        layout.headers.push(BoundaryHeader {
            guard: entry.node_index ^ GUARD_MASK,
            dif,
            material_index,
        });

        layout.sdf_distance.push(solver.distance(entry.node_index));
        layout.sdf_normal.push(solver.normal(entry.node_index));
    }

    layout
}

/// Coefficient-set index per port for one boundary node, `None` where the
/// face bit is clear.
fn gather_face_coefficients(
    node: &CondensedNode,
    index_data: &BoundaryIndexData,
) -> [Option<u32>; PORTS] {
    let mut out = [None; PORTS];
    let bt = node.boundary_type;
    let slot_coefficient = |slot: usize| -> Option<u32> {
        if is_boundary_d(bt, 1) {
            index_data
                .b1
                .get(node.boundary_index as usize)
                .map(|e| e.array[slot].coefficient_index)
        } else if is_boundary_d(bt, 2) {
            index_data
                .b2
                .get(node.boundary_index as usize)
                .map(|e| e.array[slot].coefficient_index)
        } else {
            index_data
                .b3
                .get(node.boundary_index as usize)
                .map(|e| e.array[slot].coefficient_index)
        }
    };
    for (port, &bit) in FACE_BITS.iter().enumerate() {
        if let Some(slot) = boundary_local_index(bt, bit) {
            out[port] = slot_coefficient(slot);
        }
    }
    out
}
