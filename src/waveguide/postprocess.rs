//! Waveguide band postprocessing: bandlimit and resample to the output rate.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::waveguide::driver::BandpassBand;

/// Bandlimits a signal to `[low_hz, high_hz]` and resamples it from
/// `fs_in` to `fs_out`, in the frequency domain.
pub fn fft_bandlimit_resample(
    signal: &[f32],
    fs_in: f64,
    fs_out: f64,
    low_hz: f64,
    high_hz: f64,
) -> Vec<f32> {
    if signal.is_empty() || fs_in <= 0.0 || fs_out <= 0.0 {
        return Vec::new();
    }
    let n = signal.len();
    let out_len = ((n as f64) * fs_out / fs_in).round().max(1.0) as usize;

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    let mut spectrum: Vec<Complex<f32>> =
        signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fft.process(&mut spectrum);

    let bin_hz = fs_in / n as f64;
    let low_bin = (low_hz / bin_hz).floor().max(0.0) as usize;
    let high_bin = ((high_hz / bin_hz).ceil() as usize).min(n / 2);
    let keep = high_bin.min(out_len.saturating_sub(1) / 2);

    let mut out_spectrum = vec![Complex::new(0.0f32, 0.0f32); out_len];
    if low_bin == 0 {
        out_spectrum[0] = spectrum[0];
    }
    for k in 1..=keep {
        if k < low_bin {
            continue;
        }
        out_spectrum[k] = spectrum[k];
        out_spectrum[out_len - k] = spectrum[k].conj();
    }

    let ifft = planner.plan_fft_inverse(out_len);
    ifft.process(&mut out_spectrum);

    let scale = 1.0 / n as f32;
    out_spectrum.iter().map(|c| c.re * scale).collect()
}

/// Converts the waveguide bands into one pressure signal at `fs_out`.
///
/// Each band is limited to its valid range before resampling; bands sum.
pub fn postprocess(bands: &[BandpassBand], fs_out: f64) -> Vec<f32> {
    let mut output: Vec<f32> = Vec::new();
    for bandpass in bands {
        let pressures = bandpass.band.pressures();
        let resampled = fft_bandlimit_resample(
            &pressures,
            bandpass.band.sample_rate,
            fs_out,
            bandpass.valid_hz.0,
            bandpass.valid_hz.1,
        );
        if resampled.len() > output.len() {
            output.resize(resampled.len(), 0.0);
        }
        for (out, value) in output.iter_mut().zip(resampled.iter()) {
            *out += value;
        }
    }
    output
}

/// Upper edge of the lowest valid band, which the crossover uses as its
/// cutoff.
pub fn min_valid_band_edge_hz(bands: &[BandpassBand]) -> Option<f64> {
    bands
        .iter()
        .map(|b| b.valid_hz.1)
        .min_by(|a, b| a.partial_cmp(b).expect("band edges are finite"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveguide::driver::Band;
    use crate::waveguide::receiver::ReceiverOutput;

    fn sine(freq: f64, fs: f64, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| (2.0 * std::f64::consts::PI * freq * n as f64 / fs).sin() as f32)
            .collect()
    }

    fn energy(signal: &[f32]) -> f64 {
        signal.iter().map(|&x| (x as f64) * (x as f64)).sum()
    }

    #[test]
    fn test_resample_changes_length() {
        let signal = sine(100.0, 2000.0, 400);
        let out = fft_bandlimit_resample(&signal, 2000.0, 8000.0, 0.0, 1000.0);
        assert_eq!(out.len(), 1600);
    }

    #[test]
    fn test_resample_preserves_in_band_content() {
        let fs_in = 2000.0;
        let signal = sine(100.0, fs_in, 1000);
        let out = fft_bandlimit_resample(&signal, fs_in, 4000.0, 0.0, 500.0);
        // Compare energy per sample (the rate doubles, the amplitude stays).
        let in_rms = (energy(&signal) / signal.len() as f64).sqrt();
        let out_rms = (energy(&out) / out.len() as f64).sqrt();
        assert!(
            (in_rms - out_rms).abs() / in_rms < 0.05,
            "rms {in_rms} vs {out_rms}"
        );
    }

    #[test]
    fn test_bandlimit_removes_out_of_band_content() {
        let fs = 4000.0;
        let in_band = sine(100.0, fs, 2000);
        let out_band = sine(1500.0, fs, 2000);
        let mixed: Vec<f32> = in_band
            .iter()
            .zip(out_band.iter())
            .map(|(a, b)| a + b)
            .collect();
        let filtered = fft_bandlimit_resample(&mixed, fs, fs, 0.0, 400.0);
        // Out-of-band tone removed: energy drops to about half.
        let ratio = energy(&filtered) / energy(&mixed);
        assert!(
            (ratio - 0.5).abs() < 0.05,
            "expected ~half the energy, got ratio {ratio}"
        );
    }

    #[test]
    fn test_postprocess_sums_bands() {
        let make_band = |freq: f64, valid: (f64, f64)| BandpassBand {
            band: Band {
                outputs: sine(freq, 2000.0, 500)
                    .into_iter()
                    .map(|pressure| ReceiverOutput {
                        intensity: [0.0; 3],
                        pressure,
                    })
                    .collect(),
                sample_rate: 2000.0,
            },
            valid_hz: valid,
        };
        let bands = [
            make_band(50.0, (0.0, 100.0)),
            make_band(200.0, (100.0, 300.0)),
        ];
        let out = postprocess(&bands, 2000.0);
        assert!(!out.is_empty());
        assert!(energy(&out) > 0.0);
        assert_eq!(min_valid_band_edge_hz(&bands), Some(100.0));
    }
}
