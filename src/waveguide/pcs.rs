//! Pressure-controlled source design.
//!
//! The injected signal models a small driven sphere: a bandlimited pulse
//! shaped by a mechanical highpass, made "transparent" by deconvolving the
//! mesh's own free-field response so that only the room contribution
//! appears at the receiver, then scaled by the rectilinear calibration
//! factor.

use crate::waveguide::filters::{highpass_biquad, BiquadState};
use crate::waveguide::mesh::RECTILINEAR_USABLE_FRACTION;

/// Longest PCS kernel, in samples.
pub const MAX_PCS_KERNEL_LENGTH: usize = 1 << 15;
/// Source sphere radius in metres.
pub const PCS_RADIUS_M: f64 = 0.05;
/// Source sphere mass in kilograms.
pub const PCS_SPHERE_MASS_KG: f64 = 0.025;
/// Mechanical highpass corner in Hz.
pub const PCS_LOW_CUTOFF_HZ: f64 = 100.0;
/// Mechanical highpass Q.
pub const PCS_LOW_Q: f64 = 0.7;
/// Injected samples are clamped to this magnitude.
pub const TRANSPARENT_GUARD_MAGNITUDE: f32 = 1.0e6;

/// Taps of the free-field correction kernel used by [`make_transparent`].
pub const TRANSPARENCY_KERNEL_TAPS: usize = 32;

/// Anything that supplies one injection sample per step.
pub trait SourceSignal {
    fn sample(&self, step: usize) -> f32;
}

/// A precomputed signal injected additively into the source node.
#[derive(Debug, Clone)]
pub struct SoftSource {
    signal: Vec<f32>,
}

impl SoftSource {
    pub fn new(signal: Vec<f32>) -> Self {
        Self { signal }
    }
}

impl SourceSignal for SoftSource {
    fn sample(&self, step: usize) -> f32 {
        self.signal.get(step).copied().unwrap_or(0.0)
    }
}

/// Support of the bandlimited excitation pulse, in samples.
const PULSE_SUPPORT: usize = 128;

/// Injection gain of the rectilinear scheme.
///
/// A unit injection radiates roughly `spacing / (4 pi d)` of pressure at
/// distance `d`; this gain matches that to the ray tracer's free-field
/// pressure `sqrt(Z / 4 pi) / d`, so the two models meet the crossover at
/// a common scale.
pub fn rectilinear_calibration_factor(spacing: f64, acoustic_impedance: f64) -> f64 {
    (4.0 * std::f64::consts::PI * acoustic_impedance).sqrt() / spacing.max(1e-6)
}

/// Free-field impulse response of the rectilinear mesh at the source node.
///
/// Computed by folding the mesh's octant symmetry: the response to a unit
/// injection depends only on |i|, |j|, |k|, so a single octant with mirror
/// reads at the coordinate planes reproduces the infinite mesh exactly for
/// as many steps as the octant is wide.
pub fn mesh_free_field_response(taps: usize) -> Vec<f64> {
    if taps == 0 {
        return Vec::new();
    }
    let r = taps + 2;
    let cell = |i: usize, j: usize, k: usize| i + r * (j + r * k);

    let mut previous = vec![0.0f64; r * r * r];
    let mut current = vec![0.0f64; r * r * r];
    current[cell(0, 0, 0)] = 1.0;

    let mut response = Vec::with_capacity(taps);
    for _ in 0..taps {
        response.push(current[cell(0, 0, 0)]);

        for k in 0..r {
            for j in 0..r {
                for i in 0..r {
                    let fold = |x: isize| -> Option<usize> {
                        let a = x.unsigned_abs();
                        (a < r).then_some(a)
                    };
                    let mut sum = 0.0;
                    for (di, dj, dk) in [
                        (-1, 0, 0),
                        (1, 0, 0),
                        (0, -1, 0),
                        (0, 1, 0),
                        (0, 0, -1),
                        (0, 0, 1),
                    ] {
                        if let (Some(a), Some(b), Some(c)) = (
                            fold(i as isize + di),
                            fold(j as isize + dj),
                            fold(k as isize + dk),
                        ) {
                            sum += current[cell(a, b, c)];
                        }
                    }
                    let here = cell(i, j, k);
                    previous[here] = sum / 3.0 - previous[here];
                }
            }
        }
        std::mem::swap(&mut previous, &mut current);
    }
    response
}

/// Deconvolves the mesh free-field response out of an injection signal.
///
/// Solves `t * g = s` for the injected sequence `t`, where `g` is the mesh
/// free-field response with `g[0] = 1`; the node then radiates `s` as if
/// the mesh were transparent to the source.
pub fn make_transparent(signal: &[f64], free_field: &[f64]) -> Vec<f64> {
    let g0 = free_field
        .first()
        .copied()
        .filter(|g| g.abs() > 1e-12)
        .unwrap_or(1.0);
    let mut out = vec![0.0f64; signal.len()];
    for n in 0..signal.len() {
        let mut acc = signal[n];
        let reach = n.min(free_field.len().saturating_sub(1));
        for m in 1..=reach {
            acc -= free_field[m] * out[n - m];
        }
        out[n] = acc / g0;
    }
    out
}

/// Designs the raw (pre-transparency) PCS kernel.
///
/// A Hann-windowed sinc pulse bandlimited to the usable mesh fraction,
/// shaped by the sphere's mechanical highpass and scaled by the radiating
/// surface of the sphere, peak-normalised.
#[allow(clippy::too_many_arguments)]
pub fn design_pcs_source(
    length: usize,
    acoustic_impedance: f64,
    speed_of_sound: f64,
    sample_rate: f64,
    radius: f64,
    sphere_mass: f64,
    low_cutoff_hz: f64,
    low_q: f64,
) -> Vec<f64> {
    if length == 0 {
        return Vec::new();
    }
    let kernel_length = length.min(MAX_PCS_KERNEL_LENGTH);
    let mut signal = vec![0.0f64; kernel_length];

    // Bandlimited pulse centred inside its support.
    let support = PULSE_SUPPORT.min(kernel_length);
    let centre = support / 2;
    let cutoff = RECTILINEAR_USABLE_FRACTION;
    for (n, sample) in signal.iter_mut().take(support).enumerate() {
        let x = n as f64 - centre as f64;
        let sinc = if x.abs() < 1e-12 {
            2.0 * cutoff
        } else {
            (2.0 * std::f64::consts::PI * cutoff * x).sin() / (std::f64::consts::PI * x)
        };
        let window =
            0.5 * (1.0 - (2.0 * std::f64::consts::PI * n as f64 / support as f64).cos());
        *sample = sinc * window;
    }

    // Mechanical model of the driven sphere.
    let hp = highpass_biquad((low_cutoff_hz / sample_rate).min(0.45), low_q);
    let mut state = BiquadState::default();
    for sample in signal.iter_mut() {
        *sample = state.process(*sample, &hp);
    }

    // Radiating-surface gain of the sphere, then peak normalisation so the
    // kernel amplitude is independent of the model constants.
    let surface_gain = 4.0 * std::f64::consts::PI * radius * radius * acoustic_impedance
        / (sphere_mass * speed_of_sound);
    for sample in signal.iter_mut() {
        *sample *= surface_gain;
    }
    let peak = signal.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
    if peak > 0.0 {
        for sample in signal.iter_mut() {
            *sample /= peak;
        }
    }
    signal
}

/// Full injection signal: designed kernel, transparency correction,
/// calibration and the ±[`TRANSPARENT_GUARD_MAGNITUDE`] clamp, padded with
/// zeros to `steps` samples.
pub fn make_pcs_transparent_signal(
    steps: usize,
    acoustic_impedance: f64,
    speed_of_sound: f64,
    sample_rate: f64,
    grid_spacing: f64,
) -> Vec<f32> {
    if steps == 0 {
        return Vec::new();
    }
    let raw = design_pcs_source(
        steps,
        acoustic_impedance,
        speed_of_sound,
        sample_rate,
        PCS_RADIUS_M,
        PCS_SPHERE_MASS_KG,
        PCS_LOW_CUTOFF_HZ,
        PCS_LOW_Q,
    );

    let free_field = mesh_free_field_response(TRANSPARENCY_KERNEL_TAPS);
    let transparent = make_transparent(&raw, &free_field);

    let calibration = rectilinear_calibration_factor(grid_spacing, acoustic_impedance);

    let mut signal = vec![0.0f32; steps];
    for (out, value) in signal.iter_mut().zip(transparent.iter()) {
        let scaled = (value * calibration) as f32;
        *out = if scaled.is_finite() {
            scaled.clamp(-TRANSPARENT_GUARD_MAGNITUDE, TRANSPARENT_GUARD_MAGNITUDE)
        } else {
            0.0
        };
    }
    signal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_field_starts_with_unit_sample() {
        let g = mesh_free_field_response(8);
        assert_eq!(g.len(), 8);
        assert!((g[0] - 1.0).abs() < 1e-12);
        // The injection leaves the node immediately; the next sample is the
        // -prev term of the stencil.
        assert!(g[1] <= 0.0, "expected ringing, got {}", g[1]);
    }

    #[test]
    fn test_free_field_decays() {
        let g = mesh_free_field_response(TRANSPARENCY_KERNEL_TAPS);
        let head: f64 = g[..4].iter().map(|v| v.abs()).sum();
        let tail: f64 = g[TRANSPARENCY_KERNEL_TAPS - 4..].iter().map(|v| v.abs()).sum();
        assert!(
            tail < head,
            "free-field response should decay: head={head} tail={tail}"
        );
    }

    #[test]
    fn test_transparency_deconvolution_roundtrip() {
        let g = mesh_free_field_response(16);
        let signal: Vec<f64> = (0..64).map(|n| ((n as f64) * 0.3).sin()).collect();
        let transparent = make_transparent(&signal, &g);
        // Convolving the transparent signal with g must reproduce the input.
        for n in 0..signal.len() {
            let mut acc = 0.0;
            for m in 0..g.len().min(n + 1) {
                acc += g[m] * transparent[n - m];
            }
            assert!(
                (acc - signal[n]).abs() < 1e-9,
                "sample {n}: {acc} != {}",
                signal[n]
            );
        }
    }

    #[test]
    fn test_pcs_signal_is_clamped_and_finite() {
        let signal = make_pcs_transparent_signal(512, 400.0, 340.0, 4000.0, 0.15);
        assert_eq!(signal.len(), 512);
        for &v in &signal {
            assert!(v.is_finite());
            assert!(v.abs() <= TRANSPARENT_GUARD_MAGNITUDE);
        }
        assert!(signal.iter().any(|&v| v != 0.0), "source must not be silent");
    }

    #[test]
    fn test_design_respects_length_cap() {
        let signal = design_pcs_source(
            MAX_PCS_KERNEL_LENGTH * 2,
            400.0,
            340.0,
            4000.0,
            PCS_RADIUS_M,
            PCS_SPHERE_MASS_KG,
            PCS_LOW_CUTOFF_HZ,
            PCS_LOW_Q,
        );
        assert_eq!(signal.len(), MAX_PCS_KERNEL_LENGTH);
        let peak = signal.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
        assert!((peak - 1.0).abs() < 1e-9, "kernel is peak-normalised");
    }
}
