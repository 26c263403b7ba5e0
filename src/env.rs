//! Process-wide runtime options derived from environment variables.
//!
//! The options are read once, before the first engine run, into an immutable
//! [`RuntimeOptions`] snapshot that is passed by reference into the engine.
//! None of the engine code reads the process environment directly.

use std::env;

/// Which implementation executes the waveguide kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Data-parallel work-queue dispatch (default).
    Accelerator,
    /// Sequential host reference, used for parity testing.
    Cpu,
}

/// Immutable snapshot of the recognised environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// `WG_BACKEND`: `default` or `cpu`.
    pub backend: BackendKind,
    /// `MAX_STEPS`: cap on the waveguide step loop.
    pub max_steps: Option<u64>,
    /// `DEBUG_NODE`: node index to dump before the first step.
    pub debug_node: Option<u64>,
    /// `TRACE_NODE`: node index traced on every step.
    pub trace_node: Option<u64>,
    /// `WG_TRACE`: log a line each time a kernel stage completes.
    pub wg_trace: bool,
    /// `VOXEL_PAD`: node padding around the adjusted boundary (0..=16).
    pub voxel_pad: u32,
    /// `ALLOW_SILENT_FALLBACK`: enable the direct-path fallback for silent IRs.
    pub allow_silent_fallback: bool,
    /// `FORCE_IDENTITY_COEFFS`: replace all surface filters with identity.
    pub force_identity_coeffs: bool,
    /// `ALLOW_EMPTY_INTERMEDIATE`: bypass the empty-result check.
    pub allow_empty_intermediate: bool,
}

/// Default node padding around the adjusted boundary.
pub const DEFAULT_VOXEL_PAD: u32 = 5;

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::Accelerator,
            max_steps: None,
            debug_node: None,
            trace_node: None,
            wg_trace: false,
            voxel_pad: DEFAULT_VOXEL_PAD,
            allow_silent_fallback: false,
            force_identity_coeffs: false,
            allow_empty_intermediate: false,
        }
    }
}

impl RuntimeOptions {
    /// Reads all recognised variables from the process environment.
    pub fn from_env() -> Self {
        Self {
            backend: match env::var("WG_BACKEND").ok().as_deref() {
                Some(value) if value.eq_ignore_ascii_case("cpu") => BackendKind::Cpu,
                Some(value) if !value.is_empty() && !value.eq_ignore_ascii_case("default") => {
                    log::warn!("unknown WG_BACKEND value '{value}'; using the default backend");
                    BackendKind::Accelerator
                }
                _ => BackendKind::Accelerator,
            },
            max_steps: parse_u64("MAX_STEPS"),
            debug_node: parse_u64("DEBUG_NODE"),
            trace_node: parse_u64("TRACE_NODE"),
            wg_trace: flag_set("WG_TRACE"),
            voxel_pad: parse_u64("VOXEL_PAD")
                .map(|v| (v as u32).min(16))
                .unwrap_or(DEFAULT_VOXEL_PAD),
            allow_silent_fallback: flag_set("ALLOW_SILENT_FALLBACK"),
            force_identity_coeffs: flag_set("FORCE_IDENTITY_COEFFS"),
            allow_empty_intermediate: flag_set("ALLOW_EMPTY_INTERMEDIATE"),
        }
    }
}

fn parse_u64(name: &str) -> Option<u64> {
    let value = env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("ignoring unparseable {name}={value}");
            None
        }
    }
}

fn flag_set(name: &str) -> bool {
    env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}
