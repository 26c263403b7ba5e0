//! Room-acoustic metrics derived from an impulse response.

/// Schroeder backward integration of a squared-pressure signal.
///
/// Returns the energy decay curve in dB, normalised to 0 dB at time zero.
pub fn schroeder_decay(energy: &[f64]) -> Vec<f64> {
    let total: f64 = energy.iter().sum();
    if total <= 0.0 {
        return vec![f64::NEG_INFINITY; energy.len()];
    }
    let mut decay = vec![0.0; energy.len()];
    let mut cumulative = total;
    for (out, &e) in decay.iter_mut().zip(energy.iter()) {
        *out = 10.0 * (cumulative / total).log10();
        cumulative -= e;
    }
    decay
}

/// Reverberation time from a decay curve.
///
/// Fits a line between the `start_db` and `end_db` crossings and
/// extrapolates to -60 dB. Returns `None` when the curve never reaches the
/// fitting range or decays the wrong way.
pub fn rt_from_decay(
    decay: &[f64],
    time_resolution: f64,
    start_db: f64,
    end_db: f64,
) -> Option<f64> {
    let mut i_start = None;
    let mut i_end = None;
    for (i, &value) in decay.iter().enumerate() {
        if value <= start_db && i_start.is_none() {
            i_start = Some(i);
        }
        if value <= end_db && i_end.is_none() {
            i_end = Some(i);
        }
    }
    let i_start = i_start?;
    let i_end = i_end?;
    if i_end <= i_start {
        return None;
    }

    let n = (i_end - i_start + 1) as f64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for (i, &y) in decay.iter().enumerate().take(i_end + 1).skip(i_start) {
        let x = i as f64 * time_resolution;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_xx - sum_x * sum_x);
    if slope >= 0.0 {
        return None;
    }
    Some(-60.0 / slope)
}

/// T20: fitted between -5 dB and -25 dB.
pub fn t20(energy: &[f64], time_resolution: f64) -> Option<f64> {
    rt_from_decay(&schroeder_decay(energy), time_resolution, -5.0, -25.0)
}

/// T30: fitted between -5 dB and -35 dB.
pub fn t30(energy: &[f64], time_resolution: f64) -> Option<f64> {
    rt_from_decay(&schroeder_decay(energy), time_resolution, -5.0, -35.0)
}

/// Sabine reverberation time prediction.
pub fn sabine_rt(volume: f64, surface_area: f64, absorption: f64) -> f64 {
    0.161 * volume / (absorption * surface_area).max(1e-9)
}

/// Eyring reverberation time prediction.
pub fn eyring_rt(volume: f64, surface_area: f64, absorption: f64) -> f64 {
    let log_term = -surface_area * (1.0 - absorption).max(1e-9).ln();
    0.161 * volume / log_term.max(1e-9)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential_energy(decay_rate: f64, dt: f64, len: usize) -> Vec<f64> {
        (0..len).map(|i| (-decay_rate * i as f64 * dt).exp()).collect()
    }

    #[test]
    fn test_schroeder_decay_is_monotone_from_zero() {
        let energy = exponential_energy(20.0, 0.001, 2000);
        let decay = schroeder_decay(&energy);
        assert!((decay[0] - 0.0).abs() < 1e-9);
        for i in 1..decay.len() {
            assert!(decay[i] <= decay[i - 1] + 1e-9);
        }
    }

    #[test]
    fn test_t30_of_known_exponential() {
        // Energy e^(-kt) decays at 10*k/ln(10) dB per second; RT60 is
        // 60 ln(10) / (10 k).
        let k = 40.0;
        let dt = 0.0005;
        let energy = exponential_energy(k, dt, 8000);
        let expected = 60.0 * std::f64::consts::LN_10 / (10.0 * k);
        let measured = t30(&energy, dt).expect("decay covers the fit range");
        assert!(
            (measured - expected).abs() / expected < 0.05,
            "measured {measured}, expected {expected}"
        );
    }

    #[test]
    fn test_silent_signal_has_no_rt() {
        let energy = vec![0.0; 100];
        assert!(t30(&energy, 0.001).is_none());
        assert!(t20(&energy, 0.001).is_none());
    }

    #[test]
    fn test_sabine_and_eyring_agree_for_low_absorption() {
        // Eyring converges to Sabine as absorption goes to zero.
        let volume = 90.0;
        let area = 126.0;
        let sabine = sabine_rt(volume, area, 0.01);
        let eyring = eyring_rt(volume, area, 0.01);
        assert!((sabine - eyring).abs() / sabine < 0.01);
        // Eyring is always shorter for real absorption.
        assert!(eyring_rt(volume, area, 0.3) < sabine_rt(volume, area, 0.3));
    }
}
