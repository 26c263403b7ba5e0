//! Digital-waveguide mesh solver.
//!
//! A rectilinear finite-difference mesh with per-surface IIR boundary
//! filters enforced through ghost points. The mesh builder classifies grid
//! nodes against the voxelised scene, the driver runs the per-step kernels
//! through a compute backend, and the band postprocessor bandlimits and
//! resamples the receiver output.

pub mod backend;
pub mod boundary;
pub mod driver;
pub mod filters;
pub mod kernel;
pub mod mesh;
pub mod pcs;
pub mod postprocess;
pub mod receiver;
pub mod setup;

pub use backend::{select_backend, ComputeBackend, LayoutInfo};
pub use driver::{build_mesh, Band, BandpassBand, WaveguideMesh};
pub use kernel::NanRecord;
pub use mesh::{compute_sample_rate, grid_spacing, MeshDescriptor, WaveguideParameters};
