// ============================================================
// Layer 5 — Sliding-Window Inferencer
// ============================================================
// Reconstructs a full-volume prediction from a model that only
// accepts fixed-size patches.
//
//   1. Per axis, patch origins start at 0 and advance by
//      step = max(1, floor(patch * (1 - overlap))); the last
//      origin is always volume - patch, so the far edge is
//      covered even when the step does not divide the volume.
//   2. The grid of origins is the cartesian product of the
//      per-axis origins.
//   3. For every origin, every model and (with TTA) every flip
//      variant: flip the patch, run the model, flip the output
//      back and hand it to the blender.
//   4. Finalize the blender: one averaged prediction whose
//      channel order is the model's output order.
//
// The same call path serves validation (one model, no TTA),
// end-of-fold test evaluation (best checkpoint) and final
// test-set prediction (all folds, TTA).
//
// No randomness anywhere: same inputs, same output.

use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::SegmentationModel;
use crate::domain::volume::{extract_patch, spatial_dims, FlipVariant, Shape3, Volume};
use crate::ml::blender::{Accumulator, BlendMode, BlendWeights};

/// Everything that shapes one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSettings {
    pub patch:   Shape3,
    /// Fraction of the patch shared by neighbouring windows, in [0, 1)
    pub overlap: f64,
    pub blend:   BlendMode,
    /// Run every flip variant and average
    pub tta:     bool,
}

impl InferenceSettings {
    pub fn new(patch: Shape3, overlap: f64, blend: BlendMode, tta: bool) -> SegResult<Self> {
        if !(0.0..1.0).contains(&overlap) {
            return Err(SegError::config(format!(
                "sliding-window overlap must be in [0, 1), got {overlap}"
            )));
        }
        if patch.iter().any(|&p| p == 0) {
            return Err(SegError::config(format!("patch size {patch:?} has a zero axis")));
        }
        Ok(Self { patch, overlap, blend, tta })
    }

    /// Same window and blending, single orientation.
    pub fn without_tta(&self) -> Self {
        Self { tta: false, ..self.clone() }
    }

    /// Window advance per axis.
    pub fn step(&self) -> Shape3 {
        let mut step = [1; 3];
        for axis in 0..3 {
            let s = (self.patch[axis] as f64 * (1.0 - self.overlap)).floor() as usize;
            step[axis] = s.max(1);
        }
        step
    }

    fn flips(&self) -> &'static [FlipVariant] {
        if self.tta {
            &FlipVariant::ALL
        } else {
            std::slice::from_ref(&FlipVariant::IDENTITY)
        }
    }
}

/// Origins along one axis: 0, step, 2·step, … and finally `len - patch`.
pub fn axis_origins(len: usize, patch: usize, step: usize) -> Vec<usize> {
    let last = len.saturating_sub(patch);
    let step = step.max(1);
    let mut origins: Vec<usize> = (0..=last).step_by(step).collect();
    if origins.last() != Some(&last) {
        origins.push(last);
    }
    origins
}

/// Every patch origin needed to cover `dims`, in z-major order.
pub fn patch_origins(dims: Shape3, settings: &InferenceSettings) -> SegResult<Vec<Shape3>> {
    check_fits(dims, settings.patch)?;
    let step = settings.step();
    let zs = axis_origins(dims[0], settings.patch[0], step[0]);
    let ys = axis_origins(dims[1], settings.patch[1], step[1]);
    let xs = axis_origins(dims[2], settings.patch[2], step[2]);

    let mut origins = Vec::with_capacity(zs.len() * ys.len() * xs.len());
    for &z in &zs {
        for &y in &ys {
            for &x in &xs {
                origins.push([z, y, x]);
            }
        }
    }
    Ok(origins)
}

fn check_fits(dims: Shape3, patch: Shape3) -> SegResult<()> {
    for axis in 0..3 {
        if dims[axis] < patch[axis] {
            return Err(SegError::shape(format!(
                "volume {dims:?} is smaller than patch {patch:?} on axis {axis}"
            )));
        }
    }
    Ok(())
}

// ─── SlidingWindowInferer ─────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct SlidingWindowInferer {
    settings: InferenceSettings,
    weights:  BlendWeights,
}

impl SlidingWindowInferer {
    pub fn new(settings: InferenceSettings) -> Self {
        let weights = BlendWeights::new(settings.blend, settings.patch);
        Self { settings, weights }
    }

    pub fn settings(&self) -> &InferenceSettings {
        &self.settings
    }

    /// Predict `volume` [modality, z, y, x] with an ensemble of `models`.
    pub fn predict(
        &self,
        volume: &Volume,
        models: &[&dyn SegmentationModel],
    ) -> SegResult<Volume> {
        if models.is_empty() {
            return Err(SegError::EmptyEnsemble);
        }
        let dims    = spatial_dims(volume);
        let origins = patch_origins(dims, &self.settings)?;
        let patch   = self.settings.patch;

        tracing::debug!(
            "Sliding window over {:?}: {} patches × {} models × {} flips",
            dims,
            origins.len(),
            models.len(),
            self.settings.flips().len()
        );

        // The channel count is only known once the first model has answered
        let mut slot: Option<Accumulator> = None;

        for origin in origins {
            let input = extract_patch(volume, origin, patch)?;
            for model in models {
                for flip in self.settings.flips() {
                    let output = model.forward(&flip.apply(&input))?;
                    let output = flip.invert(&output);
                    let acc = slot.get_or_insert_with(|| Accumulator::new(output.shape()[0], dims));
                    acc.accumulate(&output, origin, &self.weights)?;
                }
            }
        }

        match slot {
            Some(acc) => acc.finalize(),
            None => Err(SegError::shape(format!("no patches generated for volume {dims:?}"))),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// Every output voxel equals `value`, `channels` times.
    struct ConstantModel {
        channels: usize,
        value:    f32,
    }

    impl SegmentationModel for ConstantModel {
        fn forward(&self, patch: &Volume) -> SegResult<Volume> {
            let (_, d, h, w) = patch.dim();
            Ok(Volume::from_elem((self.channels, d, h, w), self.value))
        }
    }

    /// Returns its input unchanged.
    struct IdentityModel;

    impl SegmentationModel for IdentityModel {
        fn forward(&self, patch: &Volume) -> SegResult<Volume> {
            Ok(patch.clone())
        }
    }

    /// Output depends on position within the patch, not on content.
    struct PositionalModel;

    impl SegmentationModel for PositionalModel {
        fn forward(&self, patch: &Volume) -> SegResult<Volume> {
            let (_, d, h, w) = patch.dim();
            Ok(Volume::from_shape_fn((1, d, h, w), |(_, z, y, x)| (z * 7 + y * 3 + x) as f32))
        }
    }

    fn ramp(dims: Shape3) -> Volume {
        Volume::from_shape_fn((1, dims[0], dims[1], dims[2]), |(_, z, y, x)| {
            (z * 100 + y * 10 + x) as f32 * 0.01
        })
    }

    fn settings(patch: Shape3, overlap: f64, blend: BlendMode, tta: bool) -> InferenceSettings {
        InferenceSettings::new(patch, overlap, blend, tta).unwrap()
    }

    #[test]
    fn test_axis_origins_end_flush() {
        assert_eq!(axis_origins(10, 4, 2), vec![0, 2, 4, 6]);
        assert_eq!(axis_origins(11, 4, 2), vec![0, 2, 4, 6, 7]);
        assert_eq!(axis_origins(4, 4, 2), vec![0]);
        assert_eq!(axis_origins(5, 4, 4), vec![0, 1]);
    }

    #[test]
    fn test_origins_cover_every_voxel() {
        let cases = [
            ([7, 9, 5], [3, 4, 5], 0.5),
            ([16, 16, 16], [8, 8, 8], 0.0),
            ([13, 6, 11], [4, 6, 3], 0.25),
            ([5, 5, 5], [2, 3, 4], 0.9),
        ];
        for (dims, patch, overlap) in cases {
            let s = settings(patch, overlap, BlendMode::Constant, false);
            let mut hit = Array3::<u32>::zeros((dims[0], dims[1], dims[2]));
            for [z, y, x] in patch_origins(dims, &s).unwrap() {
                assert!(z + patch[0] <= dims[0]);
                assert!(y + patch[1] <= dims[1]);
                assert!(x + patch[2] <= dims[2]);
                hit.slice_mut(ndarray::s![z..z + patch[0], y..y + patch[1], x..x + patch[2]])
                    .mapv_inplace(|v| v + 1);
            }
            assert!(hit.iter().all(|&v| v > 0), "uncovered voxel for {dims:?}/{patch:?}");
        }
    }

    #[test]
    fn test_weight_total_positive_after_full_pass() {
        let dims = [9, 7, 10];
        for blend in [BlendMode::Constant, BlendMode::Gaussian] {
            let s = settings([4, 4, 4], 0.5, blend, false);
            let weights = BlendWeights::new(blend, s.patch);
            let mut acc = Accumulator::new(1, dims);
            for origin in patch_origins(dims, &s).unwrap() {
                acc.accumulate(&Volume::ones((1, 4, 4, 4)), origin, &weights).unwrap();
            }
            assert!(acc.weight_total().iter().all(|&w| w > 0.0));
        }
    }

    #[test]
    fn test_constant_model_yields_constant_prediction() {
        let model = ConstantModel { channels: 2, value: 0.3 };
        let volume = ramp([10, 9, 7]);
        for overlap in [0.0, 0.25, 0.5, 0.75] {
            for blend in [BlendMode::Constant, BlendMode::Gaussian] {
                let inferer = SlidingWindowInferer::new(settings([4, 4, 4], overlap, blend, false));
                let out = inferer.predict(&volume, &[&model]).unwrap();
                assert_eq!(out.dim(), (2, 10, 9, 7));
                assert!(out.iter().all(|&v| (v - 0.3).abs() < 1e-5), "{overlap} {blend}");
            }
        }
    }

    #[test]
    fn test_identity_model_reconstructs_input_with_tta() {
        let volume = ramp([6, 7, 5]);
        for blend in [BlendMode::Constant, BlendMode::Gaussian] {
            let inferer = SlidingWindowInferer::new(settings([3, 4, 5], 0.5, blend, true));
            let out = inferer.predict(&volume, &[&IdentityModel]).unwrap();
            for (a, b) in out.iter().zip(volume.iter()) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_flips_are_inverted_before_blending() {
        // With TTA the positional model's output is mirrored and mirrored back,
        // so a single-patch volume must see the plain output.
        let volume = Volume::zeros((1, 3, 3, 3));
        let inferer = SlidingWindowInferer::new(settings([3, 3, 3], 0.0, BlendMode::Constant, true));
        let out = inferer.predict(&volume, &[&PositionalModel]).unwrap();
        let plain = PositionalModel.forward(&volume).unwrap();
        let mirrored_mean = FlipVariant::ALL
            .iter()
            .map(|f| f.invert(&plain))
            .fold(Volume::zeros((1, 3, 3, 3)), |acc, v| acc + v)
            / 8.0;
        for (a, b) in out.iter().zip(mirrored_mean.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_ensemble_averages_models() {
        let low  = ConstantModel { channels: 1, value: 0.2 };
        let high = ConstantModel { channels: 1, value: 0.6 };
        let inferer = SlidingWindowInferer::new(settings([2, 2, 2], 0.5, BlendMode::Gaussian, false));
        let out = inferer.predict(&Volume::zeros((1, 5, 4, 3)), &[&low, &high]).unwrap();
        assert!(out.iter().all(|&v| (v - 0.4).abs() < 1e-5));
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let volume = ramp([8, 8, 8]);
        for blend in [BlendMode::Constant, BlendMode::Gaussian] {
            let inferer = SlidingWindowInferer::new(settings([5, 3, 4], 0.5, blend, true));
            let a = inferer.predict(&volume, &[&IdentityModel, &PositionalModel]).unwrap();
            let b = inferer.predict(&volume, &[&IdentityModel, &PositionalModel]).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_model_channel_mismatch_is_shape_error() {
        let one = ConstantModel { channels: 1, value: 0.5 };
        let two = ConstantModel { channels: 2, value: 0.5 };
        let inferer = SlidingWindowInferer::new(settings([2, 2, 2], 0.0, BlendMode::Constant, false));
        let err = inferer.predict(&Volume::zeros((1, 2, 2, 2)), &[&one, &two]).unwrap_err();
        assert!(matches!(err, SegError::Shape { .. }));
    }

    #[test]
    fn test_volume_smaller_than_patch_is_shape_error() {
        let inferer = SlidingWindowInferer::new(settings([4, 4, 4], 0.5, BlendMode::Constant, false));
        let err = inferer.predict(&Volume::zeros((1, 4, 3, 4)), &[&IdentityModel]).unwrap_err();
        assert!(matches!(err, SegError::Shape { .. }));
    }

    #[test]
    fn test_empty_ensemble_is_rejected() {
        let inferer = SlidingWindowInferer::new(settings([2, 2, 2], 0.5, BlendMode::Constant, false));
        let err = inferer.predict(&Volume::zeros((1, 4, 4, 4)), &[]).unwrap_err();
        assert!(matches!(err, SegError::EmptyEnsemble));
    }

    #[test]
    fn test_overlap_out_of_range_is_config_error() {
        assert!(InferenceSettings::new([2, 2, 2], 1.0, BlendMode::Constant, false).is_err());
        assert!(InferenceSettings::new([2, 2, 2], -0.1, BlendMode::Constant, false).is_err());
        assert!(InferenceSettings::new([0, 2, 2], 0.5, BlendMode::Constant, false).is_err());
    }
}
