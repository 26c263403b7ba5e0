//! Rectilinear mesh descriptor and node addressing.

use crate::geom::Vec3;

/// Sentinel returned for a neighbour outside the grid.
pub const NO_NEIGHBOR: u32 = u32::MAX;

/// Number of ports of the rectilinear scheme.
pub const PORTS: usize = 6;

/// Port directions, one per axis sign.
pub const PORT_NX: usize = 0;
pub const PORT_PX: usize = 1;
pub const PORT_NY: usize = 2;
pub const PORT_PY: usize = 3;
pub const PORT_NZ: usize = 4;
pub const PORT_PZ: usize = 5;

/// Usable fraction of the mesh update rate for the rectilinear scheme.
pub const RECTILINEAR_USABLE_FRACTION: f64 = 0.196;

/// Opposite port along the same axis.
pub fn opposite_port(port: usize) -> usize {
    port ^ 1
}

/// Axis (0..3) of a port.
pub fn port_axis(port: usize) -> usize {
    port / 2
}

/// Locator offset of a port.
pub fn port_offset(port: usize) -> [i32; 3] {
    const OFFSETS: [[i32; 3]; PORTS] = [
        [-1, 0, 0],
        [1, 0, 0],
        [0, -1, 0],
        [0, 1, 0],
        [0, 0, -1],
        [0, 0, 1],
    ];
    OFFSETS[port]
}

/// Geometry of the node grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshDescriptor {
    /// Position of node (0, 0, 0).
    pub min_corner: Vec3,
    /// Node counts along x, y, z.
    pub dimensions: [i32; 3],
    /// Grid spacing in metres.
    pub spacing: f32,
}

impl MeshDescriptor {
    pub fn num_nodes(&self) -> usize {
        self.dimensions.iter().map(|&d| d.max(0) as usize).product()
    }

    /// Node index to (i, j, k) locator.
    pub fn locator(&self, index: u32) -> [i32; 3] {
        let nx = self.dimensions[0] as u32;
        let ny = self.dimensions[1] as u32;
        let i = index % nx;
        let j = (index / nx) % ny;
        let k = index / (nx * ny);
        [i as i32, j as i32, k as i32]
    }

    /// (i, j, k) locator to node index. The locator must be in bounds.
    pub fn index(&self, locator: [i32; 3]) -> u32 {
        debug_assert!(self.in_bounds(locator));
        (locator[0] + self.dimensions[0] * (locator[1] + self.dimensions[1] * locator[2])) as u32
    }

    pub fn in_bounds(&self, locator: [i32; 3]) -> bool {
        (0..3).all(|axis| locator[axis] >= 0 && locator[axis] < self.dimensions[axis])
    }

    /// World position of a node.
    pub fn position(&self, index: u32) -> Vec3 {
        let loc = self.locator(index);
        self.min_corner
            + Vec3::new(
                loc[0] as f32 * self.spacing,
                loc[1] as f32 * self.spacing,
                loc[2] as f32 * self.spacing,
            )
    }

    /// Neighbour of a node along one port, or [`NO_NEIGHBOR`].
    pub fn neighbor(&self, index: u32, port: usize) -> u32 {
        let mut loc = self.locator(index);
        let off = port_offset(port);
        for axis in 0..3 {
            loc[axis] += off[axis];
        }
        if self.in_bounds(loc) {
            self.index(loc)
        } else {
            NO_NEIGHBOR
        }
    }

    /// All six axial neighbours.
    pub fn neighbors(&self, index: u32) -> [u32; PORTS] {
        std::array::from_fn(|port| self.neighbor(index, port))
    }

    /// Closest node to a world position, or `None` outside the grid.
    pub fn node_at(&self, position: Vec3) -> Option<u32> {
        let rel = (position - self.min_corner) / self.spacing;
        let loc = [
            rel.x.round() as i32,
            rel.y.round() as i32,
            rel.z.round() as i32,
        ];
        self.in_bounds(loc).then(|| self.index(loc))
    }
}

/// Mesh update rate for a spacing and speed of sound.
pub fn compute_sample_rate(descriptor: &MeshDescriptor, speed_of_sound: f64) -> f64 {
    speed_of_sound / (descriptor.spacing as f64 * 3f64.sqrt())
}

/// Grid spacing that yields a given mesh update rate.
pub fn grid_spacing(speed_of_sound: f64, sample_rate: f64) -> f64 {
    speed_of_sound * 3f64.sqrt() / sample_rate
}

/// Waveguide simulation parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum WaveguideParameters {
    /// One run with the full fitted boundary filters.
    SingleBand {
        /// Highest frequency the band is valid up to, in Hz.
        cutoff_hz: f64,
        /// Fraction of the theoretical usable bandwidth actually trusted.
        usable_fraction: f64,
    },
    /// One run per band with flat boundary coefficients, constant spacing.
    MultipleBand {
        /// Number of bands simulated, counted from the lowest.
        bands: usize,
        /// `bands + 1` band edges in Hz.
        band_edges_hz: Vec<f64>,
        /// Fraction of the theoretical usable bandwidth actually trusted.
        usable_fraction: f64,
    },
}

impl WaveguideParameters {
    /// Mesh update rate needed for the highest valid frequency.
    pub fn sampling_frequency(&self) -> f64 {
        let max_hz = match self {
            WaveguideParameters::SingleBand { cutoff_hz, .. } => *cutoff_hz,
            WaveguideParameters::MultipleBand { band_edges_hz, .. } => {
                band_edges_hz.last().copied().unwrap_or(500.0)
            }
        };
        let usable = match self {
            WaveguideParameters::SingleBand {
                usable_fraction, ..
            }
            | WaveguideParameters::MultipleBand {
                usable_fraction, ..
            } => usable_fraction.clamp(1e-2, 1.0),
        };
        max_hz / (RECTILINEAR_USABLE_FRACTION * usable)
    }
}
