//! roomverb: offline room-acoustics impulse response renderer.
//!
//! Given a triangle scene with per-surface octave-band absorption and
//! scattering, a source and a receiver, roomverb renders a time-domain
//! impulse response by combining two physical models:
//!
//! - a rectilinear digital-waveguide mesh (accurate at low frequencies),
//! - a hybrid image-source / stochastic ray tracer (efficient at high
//!   frequencies),
//!
//! cross-faded in the frequency domain by the postprocessor.
//!
//! The main entry point is [`engine::run`], which produces
//! [`engine::IntermediateResults`]; calling
//! [`engine::IntermediateResults::postprocess`] yields the final IR for one
//! channel. [`engine::render_pairs`] drives multiple source/receiver pairs
//! and normalises across channels.

pub mod engine;
pub mod env;
pub mod error;
pub mod geom;
pub mod metrics;
pub mod postprocess;
pub mod raytracer;
pub mod scene;
pub mod waveguide;

pub use engine::{run, ComputeContext, EngineEvents, EngineState, IntermediateResults};
pub use error::{EngineError, Result};
pub use geom::Vec3;
pub use scene::{Bands, Environment, Scene, Surface, VoxelisedScene, NUM_BANDS};
