mod backend;
mod roi;
mod worker;


pub(crate) use backend::Backend;
pub(crate) use roi::rasterize_polygon;
pub use worker::{Classification, GpuClassifyPipeline, GpuReducePipeline, SkinClassifierWorker};

use std::sync::Arc;

use glam::Vec2;

use crate::common::{Error, PlaneFormat, Result};
use crate::filters::FilterCore;
use crate::image::Image;
use crate::processing_context::ProcessingContext;

/// Decision backend for the statistical skin classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkinMethod {
    /// Raw unnormalized Gaussian density per pixel.
    Gaussian,
    /// Gaussian density hard-thresholded to a binary mask.
    #[default]
    GaussianThreshold,
    /// Per-channel interval test solved from the density equation.
    BoundingBox,
}

/// Exact epsilon of the normalized-difference rule. Shared verbatim by the
/// host implementation and the classify kernel.
pub const NORMALIZED_DIFF_EPSILON: f32 = 1e-4;

/// Slopes of the signed scaling parameter. Widening (>= 0) is steeper than
/// narrowing, matching the color-adjust response curve.
pub(crate) const SCALING_WIDEN_SLOPE: f32 = 0.04;
pub(crate) const SCALING_NARROW_SLOPE: f32 = 0.01;

/// Calibration constant applied to the variance before solving the density
/// equation for the bounding-box backend; chosen so box decisions track
/// the thresholded Gaussian ones.
pub(crate) const BOX_VARIANCE_CALIBRATION: f32 = 1.0 / 3.0;

const MIN_SCALING: i32 = -100;
const MAX_SCALING: i32 = 100;
const MIN_VARIANCE: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SkinParams {
    pub method: SkinMethod,
    pub mean: [f32; 3],
    pub variance: [f32; 3],
    pub scaling: i32,
    pub threshold: f32,
    pub roi: Vec<Vec2>,
}

impl Default for SkinParams {
    fn default() -> Self {
        Self {
            method: SkinMethod::default(),
            mean: [0.0; 3],
            variance: [0.01; 3],
            scaling: 0,
            threshold: 0.5,
            roi: Vec::new(),
        }
    }
}

/// Shared skin-classifier configuration.
///
/// Mirrors the filter/worker relationship: one classifier object per
/// pipeline, one [`SkinClassifierWorker`] per execution thread, parameter
/// changes broadcast synchronously to every worker.
pub struct SkinClassifier {
    core: Arc<FilterCore<SkinParams>>,
}

impl SkinClassifier {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new("skin_classifier", SkinParams::default()),
        }
    }

    pub fn method(&self) -> SkinMethod {
        self.core.params().method
    }

    pub fn set_method(&self, method: SkinMethod) {
        self.core.mutate(|p| p.method = method);
    }

    pub fn mean(&self) -> [f32; 3] {
        self.core.params().mean
    }

    pub fn set_mean(&self, mean: [f32; 3]) {
        self.core.mutate(|p| p.mean = mean);
    }

    pub fn variance(&self) -> [f32; 3] {
        self.core.params().variance
    }

    /// Sets the per-channel variance; each component is kept positive.
    pub fn set_variance(&self, variance: [f32; 3]) {
        let variance = variance.map(|v| v.max(MIN_VARIANCE));
        self.core.mutate(|p| p.variance = variance);
    }

    pub fn scaling(&self) -> i32 {
        self.core.params().scaling
    }

    /// Sets the signed variance scaling, clamped to `[-100, 100]`.
    pub fn set_scaling(&self, scaling: i32) {
        let scaling = scaling.clamp(MIN_SCALING, MAX_SCALING);
        self.core.mutate(|p| p.scaling = scaling);
    }

    pub fn threshold(&self) -> f32 {
        self.core.params().threshold
    }

    /// Sets the probability threshold, clamped to `[0, 1]`.
    pub fn set_threshold(&self, threshold: f32) {
        let threshold = threshold.clamp(0.0, 1.0);
        self.core.mutate(|p| p.threshold = threshold);
    }

    pub fn roi(&self) -> Vec<Vec2> {
        self.core.params().roi
    }

    /// Sets the region-of-interest polygon; an empty vertex list means the
    /// whole image. Workers re-rasterize their mask only when the vertex
    /// list actually changed.
    pub fn set_roi(&self, roi: Vec<Vec2>) {
        self.core.mutate(|p| p.roi = roi);
    }

    /// Derives the per-thread worker with its private GPU state.
    pub fn create_worker(&self, ctx: &mut ProcessingContext) -> Result<SkinClassifierWorker> {
        SkinClassifierWorker::create(self.core.clone(), ctx)
    }
}

impl Default for SkinClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Effective variance multiplier for the signed scaling parameter.
pub(crate) fn scaling_factor(scaling: i32) -> f32 {
    if scaling >= 0 {
        1.0 + SCALING_WIDEN_SLOPE * scaling as f32
    } else {
        1.0 + SCALING_NARROW_SLOPE * scaling as f32
    }
}

/// Per-channel-pair relative contrast of a 3-channel pixel.
///
/// `dx = (x - y) / (x + y)` when `|x - y|` exceeds the epsilon, else 0;
/// identically for the other two pairs. This exact rule is reused by the
/// classify kernel and by offline calibration sampling.
pub fn normalized_diff(x: f32, y: f32, z: f32) -> [f32; 3] {
    let mut dx = x - y;
    if dx.abs() > NORMALIZED_DIFF_EPSILON {
        dx /= x + y;
    } else {
        dx = 0.0;
    }

    let mut dy = x - z;
    if dy.abs() > NORMALIZED_DIFF_EPSILON {
        dy /= x + z;
    } else {
        dy = 0.0;
    }

    let mut dz = y - z;
    if dz.abs() > NORMALIZED_DIFF_EPSILON {
        dz /= y + z;
    } else {
        dz = 0.0;
    }

    [dx, dy, dz]
}

/// Offline calibration sampling: per-channel mean and variance of the
/// normalized differences over the ROI (whole image when empty).
///
/// The resulting statistics are what [`SkinClassifier::set_mean`] and
/// [`SkinClassifier::set_variance`] expect.
pub fn sample_statistics(image: &Image, roi: &[Vec2]) -> Result<([f32; 3], [f32; 3])> {
    let desc = *image.desc();
    if desc.format != PlaneFormat::RGB_F32 {
        return Err(Error::InvalidPlaneFormat(format!(
            "calibration sampling expects RGB_F32, got {}",
            desc.format
        )));
    }

    let mask = if roi.is_empty() {
        None
    } else {
        Some(rasterize_polygon(roi, desc.width, desc.height))
    };

    let mut count = 0u64;
    let mut sum = [0.0f64; 3];
    let mut sum_sq = [0.0f64; 3];

    for (idx, px) in image.pixels::<[f32; 3]>().iter().enumerate() {
        if let Some(mask) = &mask {
            if mask[idx] == 0 {
                continue;
            }
        }
        let d = normalized_diff(px[0], px[1], px[2]);
        count += 1;
        for c in 0..3 {
            sum[c] += d[c] as f64;
            sum_sq[c] += d[c] as f64 * d[c] as f64;
        }
    }

    if count == 0 {
        return Err(Error::InvalidPlaneFormat(
            "calibration region contains no pixels".to_string(),
        ));
    }

    let n = count as f64;
    let mut mean = [0.0f32; 3];
    let mut variance = [0.0f32; 3];
    for c in 0..3 {
        let m = sum[c] / n;
        mean[c] = m as f32;
        variance[c] = ((sum_sq[c] / n - m * m).max(MIN_VARIANCE as f64)) as f32;
    }

    Ok((mean, variance))
}
