//! Multiple-importance-sampling weights between the image-source and
//! stochastic estimators.

/// Delta-distribution pdf stand-in for the image-source estimator.
pub const DEFAULT_MIS_DELTA_PDF: f32 = 1.0e6;

/// Blend weights; they sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MisWeights {
    pub image_source: f32,
    pub path_tracer: f32,
}

/// Balance-heuristic weights for `total_rays` stochastic samples against
/// the (near-)delta image-source estimator.
pub fn compute_mis_weights(total_rays: u64, delta_pdf: f32) -> MisWeights {
    if total_rays == 0 {
        return MisWeights {
            image_source: 1.0,
            path_tracer: 0.0,
        };
    }
    let n = total_rays as f32;
    let denom = delta_pdf + n;
    if denom == 0.0 {
        return MisWeights {
            image_source: 0.0,
            path_tracer: 1.0,
        };
    }
    MisWeights {
        image_source: delta_pdf / denom,
        path_tracer: n / denom,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rays_puts_all_weight_on_image_source() {
        let w = compute_mis_weights(0, DEFAULT_MIS_DELTA_PDF);
        assert_eq!(w.image_source, 1.0);
        assert_eq!(w.path_tracer, 0.0);
    }

    #[test]
    fn test_equal_pdfs_split_evenly() {
        let w = compute_mis_weights(1, 1.0);
        assert!((w.image_source - 0.5).abs() < 1e-5);
        assert!((w.path_tracer - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_weights_sum_to_one() {
        for rays in [1u64, 100, 1 << 14, 1 << 20] {
            let w = compute_mis_weights(rays, DEFAULT_MIS_DELTA_PDF);
            assert!((w.image_source + w.path_tracer - 1.0).abs() < 1e-6);
            assert!(w.image_source > 0.0 && w.path_tracer > 0.0);
        }
    }

    #[test]
    fn test_more_rays_shift_weight_to_path_tracer() {
        let few = compute_mis_weights(1 << 10, DEFAULT_MIS_DELTA_PDF);
        let many = compute_mis_weights(1 << 22, DEFAULT_MIS_DELTA_PDF);
        assert!(many.path_tracer > few.path_tracer);
    }
}
