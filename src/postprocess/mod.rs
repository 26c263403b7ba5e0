//! Crossover postprocessing: frequency-domain band splitting, the
//! leading-edge window, silence handling and normalisation helpers.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// |y| at or below this is treated as silence.
pub const SILENCE_THRESHOLD: f32 = 1e-15;

/// Relative transition half-width of the crossover pair.
pub const CROSSOVER_WIDTH: f64 = 0.2;

/// Raised-cosine lowpass magnitude.
///
/// `freq` and `cutoff` are normalised to the sample rate; the transition
/// band spans `cutoff * (1 - width) .. cutoff * (1 + width)`.
pub fn compute_lopass_magnitude(freq: f64, cutoff: f64, width: f64) -> f64 {
    let lower = cutoff * (1.0 - width);
    let upper = cutoff * (1.0 + width);
    if freq <= lower {
        1.0
    } else if freq >= upper {
        0.0
    } else {
        let phase = (freq - lower) / (upper - lower).max(1e-12);
        0.5 * (1.0 + (std::f64::consts::PI * phase).cos())
    }
}

/// Matched highpass magnitude; the pair sums to one at every frequency.
pub fn compute_hipass_magnitude(freq: f64, cutoff: f64, width: f64) -> f64 {
    1.0 - compute_lopass_magnitude(freq, cutoff, width)
}

/// Bandpass magnitude between two edges, built from the matched pair.
pub fn compute_bandpass_magnitude(freq: f64, low: f64, high: f64, width: f64) -> f64 {
    let hp = if low <= 0.0 {
        1.0
    } else {
        compute_hipass_magnitude(freq, low, width)
    };
    hp * compute_lopass_magnitude(freq, high.min(0.5), width)
}

/// Applies a zero-phase magnitude response in the frequency domain.
///
/// `magnitude` receives the normalised frequency of each bin in 0..0.5.
pub fn fft_magnitude_filter(signal: &[f32], magnitude: impl Fn(f64) -> f64) -> Vec<f32> {
    if signal.is_empty() {
        return Vec::new();
    }
    let n = signal.len();
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    let mut spectrum: Vec<Complex<f32>> =
        signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fft.process(&mut spectrum);

    for (k, bin) in spectrum.iter_mut().enumerate() {
        // Mirrored bins share the magnitude of their positive frequency.
        let freq = if k <= n / 2 { k } else { n - k } as f64 / n as f64;
        *bin *= magnitude(freq) as f32;
    }

    let ifft = planner.plan_fft_inverse(n);
    ifft.process(&mut spectrum);
    let scale = 1.0 / n as f32;
    spectrum.iter().map(|c| c.re * scale).collect()
}

/// Crossover: lowpasses `lo`, highpasses `hi` with the matched pair at
/// `cutoff` (normalised) and sums. Output length is the longer input.
pub fn crossover_filter(lo: &[f32], hi: &[f32], cutoff: f64, width: f64) -> Vec<f32> {
    let len = lo.len().max(hi.len());
    let pad = |signal: &[f32]| {
        let mut padded = signal.to_vec();
        padded.resize(len, 0.0);
        padded
    };

    let lo_filtered = fft_magnitude_filter(&pad(lo), |freq| {
        compute_lopass_magnitude(freq, cutoff, width)
    });
    let hi_filtered = fft_magnitude_filter(&pad(hi), |freq| {
        compute_hipass_magnitude(freq, cutoff, width)
    });

    lo_filtered
        .iter()
        .zip(hi_filtered.iter())
        .map(|(a, b)| a + b)
        .collect()
}

/// Left half of a Hanning window: 0 at the first sample, 1 at `length`.
pub fn left_hanning(length: usize) -> Vec<f32> {
    (0..length)
        .map(|n| {
            let phase = std::f64::consts::PI * n as f64 / length.max(1) as f64;
            (0.5 * (1.0 - phase.cos())) as f32
        })
        .collect()
}

/// Replaces non-finite samples with zero; returns how many were replaced.
pub fn sanitize(signal: &mut [f32]) -> usize {
    let mut replaced = 0;
    for sample in signal.iter_mut() {
        if !sample.is_finite() {
            *sample = 0.0;
            replaced += 1;
        }
    }
    replaced
}

pub fn max_mag(signal: &[f32]) -> f32 {
    signal.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()))
}

pub fn has_energy(signal: &[f32]) -> bool {
    max_mag(signal) > SILENCE_THRESHOLD
}

/// Sample index of the direct path.
pub fn direct_path_index(distance: f64, sample_rate: f64, speed_of_sound: f64) -> usize {
    (distance * sample_rate / speed_of_sound).floor() as usize
}

/// Adds a free-field direct-path impulse, growing the buffer if needed.
pub fn inject_direct_path(
    signal: &mut Vec<f32>,
    distance: f64,
    sample_rate: f64,
    speed_of_sound: f64,
) {
    let index = direct_path_index(distance, sample_rate, speed_of_sound);
    if signal.len() <= index {
        signal.resize(index + 1, 0.0);
    }
    signal[index] += (1.0 / distance.max(1e-6)) as f32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crossover_magnitudes_are_complementary() {
        for freq in [0.0, 0.05, 0.1, 0.12, 0.2, 0.4] {
            let lo = compute_lopass_magnitude(freq, 0.1, 0.2);
            let hi = compute_hipass_magnitude(freq, 0.1, 0.2);
            assert!((lo + hi - 1.0).abs() < 1e-12, "freq {freq}");
            assert!((0.0..=1.0).contains(&lo));
        }
        assert_eq!(compute_lopass_magnitude(0.01, 0.1, 0.2), 1.0);
        assert_eq!(compute_lopass_magnitude(0.3, 0.1, 0.2), 0.0);
    }

    #[test]
    fn test_fft_filter_passes_in_band_tone() {
        let fs = 1000.0;
        let signal: Vec<f32> = (0..1000)
            .map(|n| (2.0 * std::f64::consts::PI * 50.0 * n as f64 / fs).sin() as f32)
            .collect();
        let out = fft_magnitude_filter(&signal, |f| compute_lopass_magnitude(f, 0.2, 0.2));
        let energy_in: f64 = signal.iter().map(|&x| (x as f64).powi(2)).sum();
        let energy_out: f64 = out.iter().map(|&x| (x as f64).powi(2)).sum();
        assert!((energy_out / energy_in - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_fft_filter_rejects_out_of_band_tone() {
        let fs = 1000.0;
        let signal: Vec<f32> = (0..1000)
            .map(|n| (2.0 * std::f64::consts::PI * 400.0 * n as f64 / fs).sin() as f32)
            .collect();
        let out = fft_magnitude_filter(&signal, |f| compute_lopass_magnitude(f, 0.2, 0.2));
        let energy_out: f64 = out.iter().map(|&x| (x as f64).powi(2)).sum();
        assert!(energy_out < 1e-6, "stopband energy {energy_out}");
    }

    #[test]
    fn test_crossover_reconstructs_identical_signals() {
        // Feeding the same signal to both sides must reproduce it exactly.
        let signal: Vec<f32> = (0..512).map(|n| ((n as f32) * 0.123).sin()).collect();
        let out = crossover_filter(&signal, &signal, 0.15, CROSSOVER_WIDTH);
        for (a, b) in signal.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_left_hanning_shape() {
        let w = left_hanning(100);
        assert_eq!(w.len(), 100);
        assert!(w[0].abs() < 1e-9);
        assert!(w[99] > 0.99);
        for i in 1..100 {
            assert!(w[i] >= w[i - 1], "window must be non-decreasing");
        }
    }

    #[test]
    fn test_sanitize_and_energy_checks() {
        let mut signal = vec![0.0, f32::NAN, 1.0, f32::INFINITY];
        assert_eq!(sanitize(&mut signal), 2);
        assert!(has_energy(&signal));
        assert_eq!(max_mag(&signal), 1.0);
        let silent = vec![0.0f32; 8];
        assert!(!has_energy(&silent));
    }

    #[test]
    fn test_direct_path_injection() {
        let mut signal = vec![0.0f32; 4];
        inject_direct_path(&mut signal, 3.4, 48000.0, 340.0);
        let index = direct_path_index(3.4, 48000.0, 340.0);
        assert_eq!(index, 480);
        assert_eq!(signal.len(), 481);
        assert!((signal[index] - 1.0 / 3.4).abs() < 1e-5);
    }

    #[test]
    fn test_bandpass_adjacent_bands_sum_to_one() {
        // Adjacent bands sharing an edge are amplitude-complementary there.
        let low_band = |f: f64| compute_bandpass_magnitude(f, 0.0, 0.1, 0.2);
        let high_band = |f: f64| compute_bandpass_magnitude(f, 0.1, 0.3, 0.2);
        for f in [0.08, 0.09, 0.1, 0.11, 0.12] {
            let sum = low_band(f) + high_band(f);
            assert!((sum - 1.0).abs() < 1e-9, "freq {f}: sum {sum}");
        }
    }
}
