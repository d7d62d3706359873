use super::{scaling_factor, SkinMethod, SkinParams, BOX_VARIANCE_CALIBRATION};

/// A decision backend with its parameters fully precomputed.
///
/// Precomputation happens once per configuration broadcast, never on the
/// per-pixel path; dispatch is by tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Backend {
    Gaussian {
        mean: [f32; 3],
        inv_two_var: [f32; 3],
        threshold: f32,
    },
    GaussianThreshold {
        mean: [f32; 3],
        inv_two_var: [f32; 3],
        threshold: f32,
    },
    BoundingBox {
        lo: [f32; 3],
        hi: [f32; 3],
    },
}

impl Backend {
    pub fn from_params(params: &SkinParams) -> Self {
        let factor = scaling_factor(params.scaling);
        let var_eff = params.variance.map(|v| v * factor);
        let threshold = params.threshold;

        match params.method {
            SkinMethod::Gaussian => Backend::Gaussian {
                mean: params.mean,
                inv_two_var: var_eff.map(|v| 1.0 / (2.0 * v)),
                threshold,
            },
            SkinMethod::GaussianThreshold => Backend::GaussianThreshold {
                mean: params.mean,
                inv_two_var: var_eff.map(|v| 1.0 / (2.0 * v)),
                threshold,
            },
            SkinMethod::BoundingBox => {
                // Solve exp(-(v - mean)^2 / (2 var)) = threshold for the
                // symmetric interval around the mean, with the calibration
                // constant applied to the variance first.
                let ln_threshold = threshold.max(1e-6).ln();
                let mut lo = [0.0f32; 3];
                let mut hi = [0.0f32; 3];
                for c in 0..3 {
                    let bound =
                        (-2.0 * var_eff[c] * BOX_VARIANCE_CALIBRATION * ln_threshold).sqrt();
                    lo[c] = params.mean[c] - bound;
                    hi[c] = params.mean[c] + bound;
                }
                Backend::BoundingBox { lo, hi }
            }
        }
    }

    /// Combined (product) unnormalized density of a normalized-difference
    /// triple. Only meaningful for the Gaussian backends.
    pub fn density(&self, d: [f32; 3]) -> f32 {
        match self {
            Backend::Gaussian {
                mean, inv_two_var, ..
            }
            | Backend::GaussianThreshold {
                mean, inv_two_var, ..
            } => {
                let mut exponent = 0.0;
                for c in 0..3 {
                    let delta = d[c] - mean[c];
                    exponent += delta * delta * inv_two_var[c];
                }
                (-exponent).exp()
            }
            Backend::BoundingBox { .. } => 0.0,
        }
    }

    /// The binary skin decision for one normalized-difference triple.
    pub fn is_skin(&self, d: [f32; 3]) -> bool {
        match self {
            Backend::Gaussian { threshold, .. } | Backend::GaussianThreshold { threshold, .. } => {
                self.density(d) >= *threshold
            }
            Backend::BoundingBox { lo, hi } => {
                (0..3).all(|c| d[c] >= lo[c] && d[c] <= hi[c])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skin::SkinParams;

    fn params(method: SkinMethod) -> SkinParams {
        SkinParams {
            method,
            mean: [0.1, -0.05, 0.2],
            variance: [0.01, 0.02, 0.01],
            scaling: 0,
            threshold: 0.5,
            roi: Vec::new(),
        }
    }

    #[test]
    fn density_peaks_at_the_mean() {
        let backend = Backend::from_params(&params(SkinMethod::Gaussian));
        let at_mean = backend.density([0.1, -0.05, 0.2]);
        assert!((at_mean - 1.0).abs() < 1e-6);

        let away = backend.density([0.4, 0.3, -0.2]);
        assert!(away < at_mean);
    }

    #[test]
    fn threshold_monotonicity_gaussian_threshold() {
        let d = [0.15, 0.0, 0.18];
        let mut previous_was_skin = true;
        for threshold in [0.0, 0.1, 0.3, 0.5, 0.7, 0.9, 1.0] {
            let mut p = params(SkinMethod::GaussianThreshold);
            p.threshold = threshold;
            let skin = Backend::from_params(&p).is_skin(d);
            // Raising the threshold can only turn skin into non-skin.
            assert!(previous_was_skin || !skin);
            previous_was_skin = skin;
        }
    }

    #[test]
    fn threshold_monotonicity_bounding_box() {
        let d = [0.15, 0.0, 0.18];
        let mut previous_was_skin = true;
        for threshold in [0.01, 0.1, 0.3, 0.5, 0.7, 0.9, 0.99] {
            let mut p = params(SkinMethod::BoundingBox);
            p.threshold = threshold;
            let skin = Backend::from_params(&p).is_skin(d);
            assert!(previous_was_skin || !skin);
            previous_was_skin = skin;
        }
    }

    #[test]
    fn bounding_box_interval_is_symmetric_around_the_mean() {
        let backend = Backend::from_params(&params(SkinMethod::BoundingBox));
        let Backend::BoundingBox { lo, hi } = backend else {
            panic!("wrong backend");
        };
        for c in 0..3 {
            let mean = params(SkinMethod::BoundingBox).mean[c];
            assert!((mean - lo[c] - (hi[c] - mean)).abs() < 1e-6);
        }
    }

    #[test]
    fn widening_scaling_accepts_more_pixels() {
        let d = [0.3, 0.1, 0.35];

        let mut narrow = params(SkinMethod::GaussianThreshold);
        narrow.scaling = -100;
        let mut wide = params(SkinMethod::GaussianThreshold);
        wide.scaling = 100;

        let narrow_backend = Backend::from_params(&narrow);
        let wide_backend = Backend::from_params(&wide);

        // A widened variance never rejects a pixel the narrow one accepts.
        if narrow_backend.is_skin(d) {
            assert!(wide_backend.is_skin(d));
        }
        assert!(wide_backend.density(d) >= narrow_backend.density(d));
    }

    #[test]
    fn box_tracks_thresholded_gaussian() {
        // Sample a grid of feature triples; the box backend must agree with
        // the thresholded Gaussian on the bulk of them.
        let gaussian = Backend::from_params(&params(SkinMethod::GaussianThreshold));
        let boxed = Backend::from_params(&params(SkinMethod::BoundingBox));

        let mut total = 0u32;
        let mut agree = 0u32;
        for i in 0..20 {
            for j in 0..20 {
                for k in 0..20 {
                    let d = [
                        -0.5 + i as f32 * 0.05,
                        -0.5 + j as f32 * 0.05,
                        -0.5 + k as f32 * 0.05,
                    ];
                    total += 1;
                    if gaussian.is_skin(d) == boxed.is_skin(d) {
                        agree += 1;
                    }
                }
            }
        }

        let agreement = agree as f32 / total as f32;
        assert!(agreement > 0.9, "agreement only {}", agreement);
    }
}
