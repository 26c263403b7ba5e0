//! Engine error types.
//!
//! Every failure crosses the engine boundary as an [`EngineError`] carrying
//! a stable machine-readable kind string plus a human-readable message.

use thiserror::Error;

use crate::geom::Vec3;
use crate::waveguide::kernel::NanRecord;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type surfaced by the engine and the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The mesh builder found zero interior nodes.
    #[error("no interior mesh nodes; check geometry watertightness and scaling")]
    EmptyInterior,

    /// The source position maps to a non-interior node.
    #[error("source position ({:.3}, {:.3}, {:.3}) maps to a non-interior node", .position.x, .position.y, .position.z)]
    SourceOutside {
        /// Requested source position.
        position: Vec3,
    },

    /// The receiver position maps to a non-interior node.
    #[error("receiver position ({:.3}, {:.3}, {:.3}) maps to a non-interior node", .position.x, .position.y, .position.z)]
    ReceiverOutside {
        /// Requested receiver position.
        position: Vec3,
    },

    /// A source/receiver pair is closer than one grid spacing.
    #[error("source and receiver are {distance:.4} m apart, within one grid spacing ({spacing:.4} m)")]
    PlacementTooClose { distance: f32, spacing: f32 },

    /// A pressure value reached infinity during the waveguide run.
    #[error("pressure reached +/-inf at step {step}; likely unstable boundary coefficients")]
    PressureInf { step: usize },

    /// A pressure or filter value became NaN during the waveguide run.
    #[error("pressure or filter state became NaN at step {step}")]
    PressureNan {
        step: usize,
        /// First offending update captured by the kernel, if any.
        diagnostics: Option<Box<NanRecord>>,
    },

    /// A stencil read requested a node that does not exist.
    #[error("waveguide stencil requested a non-existent neighbour at step {step}")]
    OutsideMesh { step: usize },

    /// Runtime boundary classification was inconsistent.
    #[error("inconsistent boundary classification at step {step}")]
    SuspiciousBoundary { step: usize },

    /// A boundary index fell outside its table.
    #[error("boundary index out of table bounds at step {step}")]
    IndexOutOfRange { step: usize },

    /// Cancellation was requested mid-run.
    #[error("run cancelled after {completed_steps} completed steps")]
    Cancelled { completed_steps: usize },

    /// The final impulse response has zero magnitude.
    #[error("rendered impulse response is silent (max |y| <= 1e-15)")]
    SilentOutput,

    /// The requested solver backend is not available.
    #[error("requested waveguide backend '{requested}' is not available")]
    BackendUnavailable { requested: String },

    /// A precomputed boundary input could not be loaded.
    #[error("failed to load precomputed input '{path}': {message}")]
    PrecomputedInput { path: String, message: String },
}

impl EngineError {
    /// Stable kind string for programmatic handling.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::EmptyInterior => "mesh/empty_interior",
            EngineError::SourceOutside { .. } => "mesh/source_outside",
            EngineError::ReceiverOutside { .. } => "mesh/receiver_outside",
            EngineError::PlacementTooClose { .. } => "placement/too_close",
            EngineError::PressureInf { .. } => "numerical/inf",
            EngineError::PressureNan { .. } => "numerical/nan",
            EngineError::OutsideMesh { .. } => "numerical/outside_mesh",
            EngineError::SuspiciousBoundary { .. } => "numerical/suspicious_boundary",
            EngineError::IndexOutOfRange { .. } => "index/out_of_range",
            EngineError::Cancelled { .. } => "run/cancelled",
            EngineError::SilentOutput => "output/silent",
            EngineError::BackendUnavailable { .. } => "capability/backend_unavailable",
            EngineError::PrecomputedInput { .. } => "io/precomputed_input",
        }
    }
}
