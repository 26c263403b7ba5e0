//! Ray-tracer postprocessing: diffuse-rain reconstruction from the energy
//! histogram, image-source impulse rendering and the multiband mixdown.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::postprocess::{compute_bandpass_magnitude, fft_magnitude_filter};
use crate::raytracer::stochastic::EnergyHistogram;
use crate::raytracer::{intensity_to_pressure, Impulse};
use crate::scene::{band_edges_hz, bands_splat, Bands, Environment, NUM_BANDS};

/// Event-rate ceiling of the Poisson dirac process, per second.
pub const MAX_EVENT_RATE: f64 = 1.0e4;

/// Relative transition width of the mixdown band filters.
const BAND_FILTER_WIDTH: f64 = 0.2;

/// A sparse +/-1 Dirac sequence with its sample rate.
#[derive(Debug, Clone)]
pub struct DiracSequence {
    pub sequence: Vec<f32>,
    pub sample_rate: f64,
}

/// `4 * pi * c^3 / V`: the quadratic coefficient of the reflection density.
pub fn constant_mean_event_occurrence(speed_of_sound: f64, room_volume: f64) -> f64 {
    4.0 * std::f64::consts::PI * speed_of_sound.powi(3) / room_volume.max(1e-3)
}

/// Mean event rate at time `t`, capped at [`MAX_EVENT_RATE`].
pub fn mean_event_occurrence(constant: f64, t: f64) -> f64 {
    (constant * t * t).min(MAX_EVENT_RATE)
}

/// Start time below which fewer than one event is expected.
fn t0(constant: f64) -> f64 {
    (2.0 * std::f64::consts::LN_2 / constant).cbrt()
}

fn interval_size(rng: &mut StdRng, mean_occurrence: f64) -> f64 {
    let u: f64 = rng.gen_range(0.0..1.0);
    // The floor keeps a pathological u = 0 draw from stalling the sweep.
    (-(1.0 - u).ln() / mean_occurrence.max(1e-9)).max(1e-6)
}

/// Generates a Poisson-like sparse Dirac sequence whose event rate grows
/// quadratically with time, with random polarity per event.
pub fn generate_dirac_sequence(
    speed_of_sound: f64,
    room_volume: f64,
    sample_rate: f64,
    max_time: f64,
    rng: &mut StdRng,
) -> DiracSequence {
    let constant = constant_mean_event_occurrence(speed_of_sound, room_volume);
    let len = (max_time * sample_rate).ceil().max(0.0) as usize;
    let mut sequence = vec![0.0f32; len];

    let mut t = t0(constant);
    while t < max_time {
        let index = (t * sample_rate) as usize;
        if index < sequence.len() {
            sequence[index] = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        }
        t += interval_size(rng, mean_event_occurrence(constant, t));
    }

    DiracSequence {
        sequence,
        sample_rate,
    }
}

/// Per-band weight applied to the rain: each band carries a fraction of
/// the Nyquist bandwidth.
fn sqrt_bandwidth_fractions(sample_rate: f64) -> [f64; NUM_BANDS] {
    let edges = band_edges_hz();
    let nyquist = (sample_rate * 0.5).max(1.0);
    std::array::from_fn(|band| {
        let bandwidth = (edges[band + 1] - edges[band]).max(0.0);
        (bandwidth / nyquist).min(1.0).sqrt()
    })
}

/// Weights the dirac sequence by the histogram energy, bin by bin.
pub fn weight_sequence(
    histogram: &EnergyHistogram,
    sequence: &DiracSequence,
    acoustic_impedance: f64,
) -> Vec<Bands> {
    let fractions = sqrt_bandwidth_fractions(sequence.sample_rate);

    let mut weighted: Vec<Bands> = sequence
        .sequence
        .iter()
        .map(|&v| bands_splat(v))
        .collect();

    let convert_index =
        |index: usize| -> usize { (index as f64 * sequence.sample_rate / histogram.sample_rate as f64) as usize };

    let ideal_length = convert_index(histogram.bins.len());
    weighted.truncate(ideal_length);

    for (bin_index, bin) in histogram.bins.iter().enumerate() {
        let begin = convert_index(bin_index).min(weighted.len());
        let end = convert_index(bin_index + 1).min(weighted.len());
        if begin >= end {
            continue;
        }

        let squared_sum: f64 = sequence.sequence[begin..end]
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum();

        let mut scale = bands_splat(0.0);
        if squared_sum != 0.0 {
            for band in 0..NUM_BANDS {
                let pressure = intensity_to_pressure(
                    bin[band] as f64 / squared_sum,
                    acoustic_impedance,
                );
                scale[band] = (pressure * fractions[band]) as f32;
            }
        }

        for frame in weighted[begin..end].iter_mut() {
            for band in 0..NUM_BANDS {
                frame[band] *= scale[band];
            }
        }
    }

    weighted
}

/// Bandpass-filters each band channel to its octave range and sums.
pub fn multiband_filter_and_mixdown(frames: &[Bands], sample_rate: f64) -> Vec<f32> {
    if frames.is_empty() {
        return Vec::new();
    }
    let edges = band_edges_hz();
    let mut output = vec![0.0f32; frames.len()];
    for band in 0..NUM_BANDS {
        let channel: Vec<f32> = frames.iter().map(|frame| frame[band]).collect();
        let low = edges[band] / sample_rate;
        let high = edges[band + 1] / sample_rate;
        let filtered = fft_magnitude_filter(&channel, |freq| {
            compute_bandpass_magnitude(freq, low, high, BAND_FILTER_WIDTH)
        });
        for (out, value) in output.iter_mut().zip(filtered.iter()) {
            *out += value;
        }
    }
    output
}

/// Renders the diffuse-rain portion of the IR.
pub fn stochastic_postprocess(
    histogram: &EnergyHistogram,
    room_volume: f64,
    environment: &Environment,
    output_sample_rate: f64,
    rng_seed: u64,
) -> Vec<f32> {
    if histogram.bins.is_empty() {
        return Vec::new();
    }
    // A separate stream from the tracer so the two stay independent.
    let mut rng = StdRng::seed_from_u64(rng_seed ^ 0x9E37_79B9_7F4A_7C15);
    let sequence = generate_dirac_sequence(
        environment.speed_of_sound,
        room_volume,
        output_sample_rate,
        histogram.max_time(),
        &mut rng,
    );
    let weighted = weight_sequence(histogram, &sequence, environment.acoustic_impedance);
    multiband_filter_and_mixdown(&weighted, output_sample_rate)
}

/// Renders the image-source impulse list at the output rate.
pub fn image_source_postprocess(
    impulses: &[Impulse],
    environment: &Environment,
    output_sample_rate: f64,
) -> Vec<f32> {
    if impulses.is_empty() {
        return Vec::new();
    }
    let max_distance = impulses
        .iter()
        .fold(0.0f32, |acc, imp| acc.max(imp.distance));
    let len = ((max_distance as f64 / environment.speed_of_sound) * output_sample_rate).ceil()
        as usize
        + 1;

    let mut frames = vec![bands_splat(0.0); len];
    for impulse in impulses {
        let index = ((impulse.distance as f64 / environment.speed_of_sound)
            * output_sample_rate) as usize;
        if let Some(frame) = frames.get_mut(index) {
            for band in 0..NUM_BANDS {
                frame[band] += impulse.volume[band];
            }
        }
    }
    multiband_filter_and_mixdown(&frames, output_sample_rate)
}

/// Full ray-tracer IR: image-source plus diffuse rain.
pub fn postprocess(
    impulses: &[Impulse],
    histogram: &EnergyHistogram,
    room_volume: f64,
    environment: &Environment,
    output_sample_rate: f64,
    rng_seed: u64,
) -> Vec<f32> {
    let specular = image_source_postprocess(impulses, environment, output_sample_rate);
    let rain = stochastic_postprocess(
        histogram,
        room_volume,
        environment,
        output_sample_rate,
        rng_seed,
    );

    let len = specular.len().max(rain.len());
    let mut output = vec![0.0f32; len];
    for (out, value) in output.iter_mut().zip(specular.iter()) {
        *out += value;
    }
    for (out, value) in output.iter_mut().zip(rain.iter()) {
        *out += value;
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Vec3;

    #[test]
    fn test_event_rate_is_capped() {
        let constant = constant_mean_event_occurrence(340.0, 30.0);
        assert!(mean_event_occurrence(constant, 1e3) <= MAX_EVENT_RATE);
        assert!(mean_event_occurrence(constant, 0.001) < mean_event_occurrence(constant, 0.01));
    }

    #[test]
    fn test_dirac_sequence_density_grows() {
        let mut rng = StdRng::seed_from_u64(1);
        let sequence = generate_dirac_sequence(340.0, 100.0, 8000.0, 1.0, &mut rng);
        assert_eq!(sequence.sequence.len(), 8000);
        let first_half = sequence.sequence[..4000]
            .iter()
            .filter(|&&v| v != 0.0)
            .count();
        let second_half = sequence.sequence[4000..]
            .iter()
            .filter(|&&v| v != 0.0)
            .count();
        assert!(
            second_half > first_half,
            "event density should grow with t^2: {first_half} vs {second_half}"
        );
        assert!(sequence.sequence.iter().all(|&v| v.abs() <= 1.0));
    }

    #[test]
    fn test_dirac_sequence_has_both_polarities() {
        let mut rng = StdRng::seed_from_u64(2);
        let sequence = generate_dirac_sequence(340.0, 50.0, 8000.0, 0.5, &mut rng);
        assert!(sequence.sequence.iter().any(|&v| v > 0.0));
        assert!(sequence.sequence.iter().any(|&v| v < 0.0));
    }

    #[test]
    fn test_weight_sequence_scales_with_energy() {
        let mut histogram = EnergyHistogram::new(100.0);
        histogram.record(0.05, &bands_splat(1.0));
        let mut rng = StdRng::seed_from_u64(3);
        let sequence = generate_dirac_sequence(340.0, 10.0, 1000.0, 0.1, &mut rng);
        let weighted = weight_sequence(&histogram, &sequence, 400.0);
        assert!(!weighted.is_empty());
        let energy: f64 = weighted
            .iter()
            .map(|frame| frame.iter().map(|&v| (v as f64).powi(2)).sum::<f64>())
            .sum();
        assert!(energy > 0.0, "weighted sequence must carry the bin energy");
    }

    #[test]
    fn test_empty_histogram_renders_empty() {
        let histogram = EnergyHistogram::new(1000.0);
        let out =
            stochastic_postprocess(&histogram, 30.0, &Environment::default(), 8000.0, 9);
        assert!(out.is_empty());
    }

    #[test]
    fn test_image_source_peak_lands_at_direct_delay() {
        let environment = Environment::default();
        let fs = 8000.0;
        let distance = 3.4f32; // 10 ms at c = 340
        let impulses = vec![Impulse {
            volume: bands_splat(0.5),
            position: Vec3::ZERO,
            distance,
        }];
        let out = image_source_postprocess(&impulses, &environment, fs);
        let expected = (distance as f64 / environment.speed_of_sound * fs) as usize;
        let peak = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert!(
            (peak as i64 - expected as i64).abs() <= 1,
            "peak at {peak}, expected {expected}"
        );
    }

    #[test]
    fn test_mixdown_of_flat_frames_reconstructs_signal() {
        // Frames equal across bands mix down to roughly the original,
        // because the band filters tile the spectrum up to Nyquist.
        let fs = 16000.0;
        let frames: Vec<Bands> = (0..512)
            .map(|n| bands_splat(((n as f32) * 0.21).sin()))
            .collect();
        let out = multiband_filter_and_mixdown(&frames, fs);
        assert_eq!(out.len(), frames.len());
        let energy: f64 = out.iter().map(|&v| (v as f64).powi(2)).sum();
        assert!(energy > 0.0);
    }
}
