// ============================================================
// Layer 5 — Patch Blender
// ============================================================
// Accumulates overlapping patch predictions into one
// full-volume prediction:
//
//   weighted_sum[c, region] += prediction[c] * weight
//   weight_total[region]    += weight
//   result                   = weighted_sum / weight_total
//
// Two weight policies:
//   Constant — every patch voxel counts 1.0
//   Gaussian — separable Gaussian centred on the patch,
//              σ = patch / 8 per axis, normalised to a peak
//              of 1.0 and clamped to stay strictly positive
//
// One BlendWeights instance is built per inference call and
// shared by every patch, model and flip of that call.
//
// Reference: ndarray crate documentation (Zip, slicing)

use std::fmt;
use std::str::FromStr;

use ndarray::{s, Array3, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::domain::error::{SegError, SegResult};
use crate::domain::volume::{Shape3, Volume};

const GAUSSIAN_SIGMA_SCALE: f64 = 0.125;

/// How patch voxels are weighted before accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    Constant,
    Gaussian,
}

impl FromStr for BlendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" | "uniform" => Ok(Self::Constant),
            "gaussian"             => Ok(Self::Gaussian),
            other => Err(format!("unknown blend mode '{other}' (expected constant|gaussian)")),
        }
    }
}

impl fmt::Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant => write!(f, "constant"),
            Self::Gaussian => write!(f, "gaussian"),
        }
    }
}

// ─── BlendWeights ─────────────────────────────────────────────────────────────
/// Per-voxel weight field with the spatial shape of one patch.
#[derive(Debug, Clone)]
pub struct BlendWeights {
    mode:    BlendMode,
    weights: Array3<f32>,
}

impl BlendWeights {
    pub fn new(mode: BlendMode, patch: Shape3) -> Self {
        let weights = match mode {
            BlendMode::Constant => Array3::ones((patch[0], patch[1], patch[2])),
            BlendMode::Gaussian => gaussian_field(patch),
        };
        Self { mode, weights }
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }

    pub fn patch_shape(&self) -> Shape3 {
        let (d, h, w) = self.weights.dim();
        [d, h, w]
    }

    pub fn values(&self) -> &Array3<f32> {
        &self.weights
    }
}

fn gaussian_axis(len: usize) -> Vec<f64> {
    let centre = (len as f64 - 1.0) / 2.0;
    let sigma  = (len as f64 * GAUSSIAN_SIGMA_SCALE).max(f64::EPSILON);
    (0..len)
        .map(|i| {
            let d = i as f64 - centre;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect()
}

fn gaussian_field(patch: Shape3) -> Array3<f32> {
    let gz = gaussian_axis(patch[0]);
    let gy = gaussian_axis(patch[1]);
    let gx = gaussian_axis(patch[2]);

    let raw = Array3::from_shape_fn((patch[0], patch[1], patch[2]), |(z, y, x)| {
        gz[z] * gy[y] * gx[x]
    });
    let peak = raw.iter().copied().fold(f64::MIN_POSITIVE, f64::max);
    let mut field = raw.mapv(|v| (v / peak) as f32);

    // underflowed corners would break the positivity invariant
    let floor = field
        .iter()
        .copied()
        .filter(|&v| v > 0.0)
        .fold(f32::INFINITY, f32::min)
        .min(1.0);
    field.mapv_inplace(|v| if v > 0.0 { v } else { floor });
    field
}

// ─── Accumulator ──────────────────────────────────────────────────────────────
/// Full-volume running sums for one inference call.
#[derive(Debug, Clone)]
pub struct Accumulator {
    weighted_sum: Volume,
    weight_total: Array3<f32>,
}

impl Accumulator {
    /// Zero-initialised accumulator for a `channels` × `dims` prediction.
    pub fn new(channels: usize, dims: Shape3) -> Self {
        Self {
            weighted_sum: Volume::zeros((channels, dims[0], dims[1], dims[2])),
            weight_total: Array3::zeros((dims[0], dims[1], dims[2])),
        }
    }

    pub fn channels(&self) -> usize {
        self.weighted_sum.len_of(Axis(0))
    }

    pub fn weight_total(&self) -> &Array3<f32> {
        &self.weight_total
    }

    /// Add `prediction * weights` into the region starting at `origin`.
    pub fn accumulate(
        &mut self,
        prediction: &Volume,
        origin:     Shape3,
        weights:    &BlendWeights,
    ) -> SegResult<()> {
        let (c, d, h, w) = prediction.dim();
        let patch = weights.patch_shape();
        if [d, h, w] != patch {
            return Err(SegError::shape(format!(
                "patch prediction is {:?} but blend weights are {:?}",
                [d, h, w], patch
            )));
        }
        if c != self.channels() {
            return Err(SegError::shape(format!(
                "patch prediction has {c} channels, accumulator expects {}",
                self.channels()
            )));
        }
        let (_, vd, vh, vw) = self.weighted_sum.dim();
        let [z, y, x] = origin;
        if z + d > vd || y + h > vh || x + w > vw {
            return Err(SegError::shape(format!(
                "patch at {:?} of size {:?} leaves volume {:?}",
                origin, patch, [vd, vh, vw]
            )));
        }

        let wv = weights.values();
        let mut region = self.weighted_sum.slice_mut(s![.., z..z + d, y..y + h, x..x + w]);
        for (mut dst, src) in region.outer_iter_mut().zip(prediction.outer_iter()) {
            Zip::from(&mut dst)
                .and(&src)
                .and(wv)
                .for_each(|acc, &p, &wt| *acc += p * wt);
        }

        let mut total = self.weight_total.slice_mut(s![z..z + d, y..y + h, x..x + w]);
        total += wv;
        Ok(())
    }

    /// Divide the weighted sum by the accumulated weight.
    /// Fails on the first voxel whose weight is not positive.
    pub fn finalize(self) -> SegResult<Volume> {
        let Self { mut weighted_sum, weight_total } = self;

        if let Some(((z, y, x), _)) = weight_total.indexed_iter().find(|&(_, &w)| w <= 0.0) {
            return Err(SegError::UncoveredVoxel { position: [z, y, x] });
        }

        for mut channel in weighted_sum.outer_iter_mut() {
            Zip::from(&mut channel)
                .and(&weight_total)
                .for_each(|v, &t| *v /= t);
        }
        Ok(weighted_sum)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blend_mode() {
        assert_eq!("gaussian".parse::<BlendMode>().unwrap(), BlendMode::Gaussian);
        assert_eq!("Constant".parse::<BlendMode>().unwrap(), BlendMode::Constant);
        assert!("median".parse::<BlendMode>().is_err());
    }

    #[test]
    fn test_gaussian_is_positive_symmetric_and_peaks_centrally() {
        let w = BlendWeights::new(BlendMode::Gaussian, [9, 6, 5]);
        let v = w.values();
        assert!(v.iter().all(|&x| x > 0.0));
        let max = v.iter().copied().fold(0.0f32, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
        assert!((v[[4, 2, 2]] - max).abs() < 1e-3);
        // mirror symmetry on every axis
        assert!((v[[0, 0, 0]] - v[[8, 5, 4]]).abs() < 1e-7);
        assert!((v[[1, 2, 3]] - v[[7, 3, 1]]).abs() < 1e-7);
        // centre outweighs the boundary
        assert!(v[[4, 2, 2]] > v[[0, 2, 2]]);
    }

    #[test]
    fn test_gaussian_large_patch_never_underflows() {
        let w = BlendWeights::new(BlendMode::Gaussian, [128, 128, 128]);
        assert!(w.values().iter().all(|&x| x > 0.0));
    }

    #[test]
    fn test_accumulate_and_finalize_averages_overlap() {
        let weights = BlendWeights::new(BlendMode::Constant, [2, 2, 2]);
        let mut acc = Accumulator::new(1, [2, 2, 3]);
        acc.accumulate(&Volume::from_elem((1, 2, 2, 2), 1.0), [0, 0, 0], &weights).unwrap();
        acc.accumulate(&Volume::from_elem((1, 2, 2, 2), 3.0), [0, 0, 1], &weights).unwrap();

        assert_eq!(acc.weight_total()[[0, 0, 1]], 2.0);
        assert_eq!(acc.weight_total()[[0, 0, 2]], 1.0);

        let out = acc.finalize().unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 1.0);
        assert_eq!(out[[0, 1, 1, 1]], 2.0);
        assert_eq!(out[[0, 1, 1, 2]], 3.0);
    }

    #[test]
    fn test_finalize_rejects_uncovered_voxel() {
        let weights = BlendWeights::new(BlendMode::Constant, [1, 1, 1]);
        let mut acc = Accumulator::new(1, [1, 1, 2]);
        acc.accumulate(&Volume::ones((1, 1, 1, 1)), [0, 0, 0], &weights).unwrap();
        match acc.finalize() {
            Err(SegError::UncoveredVoxel { position }) => assert_eq!(position, [0, 0, 1]),
            other => panic!("expected UncoveredVoxel, got {other:?}"),
        }
    }

    #[test]
    fn test_accumulate_rejects_mismatched_prediction() {
        let weights = BlendWeights::new(BlendMode::Constant, [2, 2, 2]);
        let mut acc = Accumulator::new(2, [4, 4, 4]);
        let wrong_channels = Volume::zeros((3, 2, 2, 2));
        assert!(acc.accumulate(&wrong_channels, [0, 0, 0], &weights).is_err());
        let wrong_size = Volume::zeros((2, 2, 2, 1));
        assert!(acc.accumulate(&wrong_size, [0, 0, 0], &weights).is_err());
        let outside = Volume::zeros((2, 2, 2, 2));
        assert!(acc.accumulate(&outside, [3, 0, 0], &weights).is_err());
    }
}
