// ============================================================
// Layer 3 — Volume Types
// ============================================================
// Volumes are channel-first 4D arrays: [channel, z, y, x].
// Label maps are 3D integer arrays: [z, y, x].
//
// This file also declares the closed set of flip variants
// used for test-time augmentation. Every flip is its own
// inverse, so applying the same variant to the model output
// brings it back into the input orientation.
//
// Reference: ndarray crate documentation (slicing, views)

use ndarray::{s, Array3, Array4, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::domain::error::{SegError, SegResult};

/// A multi-channel volume: [channel, z, y, x].
pub type Volume = Array4<f32>;

/// An integer label map: [z, y, x].
pub type LabelMap = Array3<i32>;

/// Spatial extent or offset along (z, y, x).
pub type Shape3 = [usize; 3];

/// Spatial dimensions of a volume, dropping the channel axis.
pub fn spatial_dims(volume: &Volume) -> Shape3 {
    let (_, d, h, w) = volume.dim();
    [d, h, w]
}

/// Copy the sub-volume `[origin, origin + size)` out of `volume`.
pub fn extract_patch(volume: &Volume, origin: Shape3, size: Shape3) -> SegResult<Volume> {
    let dims = spatial_dims(volume);
    for axis in 0..3 {
        if origin[axis] + size[axis] > dims[axis] {
            return Err(SegError::shape(format!(
                "patch [{:?} + {:?}) exceeds volume {:?} on axis {axis}",
                origin, size, dims
            )));
        }
    }
    let [z, y, x] = origin;
    let [d, h, w] = size;
    Ok(volume
        .slice(s![.., z..z + d, y..y + h, x..x + w])
        .to_owned())
}

/// Zero-pad `volume` at the far end of each axis until it is at least `min`.
/// Volumes already large enough are returned unchanged.
pub fn pad_to(volume: &Volume, min: Shape3) -> Volume {
    let (c, d, h, w) = volume.dim();
    let target = (c, d.max(min[0]), h.max(min[1]), w.max(min[2]));
    if target == (c, d, h, w) {
        return volume.clone();
    }
    let mut padded = Volume::zeros(target);
    padded.slice_mut(s![.., ..d, ..h, ..w]).assign(volume);
    padded
}

/// Same as [`pad_to`] for label maps; padding voxels are background (0).
pub fn pad_labels_to(labels: &LabelMap, min: Shape3) -> LabelMap {
    let (d, h, w) = labels.dim();
    let target = (d.max(min[0]), h.max(min[1]), w.max(min[2]));
    if target == (d, h, w) {
        return labels.clone();
    }
    let mut padded = LabelMap::zeros(target);
    padded.slice_mut(s![..d, ..h, ..w]).assign(labels);
    padded
}

/// Expand a label map into one channel per declared label value.
/// Channel `i` is 1.0 where the map equals `label_values[i]`.
pub fn one_hot(labels: &LabelMap, label_values: &[i32]) -> Volume {
    let (d, h, w) = labels.dim();
    let mut out = Volume::zeros((label_values.len(), d, h, w));
    for (channel, &value) in label_values.iter().enumerate() {
        out.index_axis_mut(Axis(0), channel)
            .zip_mut_with(labels, |o, &l| *o = if l == value { 1.0 } else { 0.0 });
    }
    out
}

/// Collapse per-class scores into a label map by taking the arg-max channel.
/// Ties resolve to the lowest channel index.
pub fn argmax_labels(prediction: &Volume, label_values: &[i32]) -> SegResult<LabelMap> {
    let (c, d, h, w) = prediction.dim();
    if c != label_values.len() {
        return Err(SegError::shape(format!(
            "prediction has {c} channels but {} labels are declared",
            label_values.len()
        )));
    }
    let mut out = LabelMap::zeros((d, h, w));
    for ((z, y, x), label) in out.indexed_iter_mut() {
        let mut best = 0;
        for channel in 1..c {
            if prediction[[channel, z, y, x]] > prediction[[best, z, y, x]] {
                best = channel;
            }
        }
        *label = label_values[best];
    }
    Ok(out)
}

// ─── Batch ────────────────────────────────────────────────────────────────────
/// One cropped, augmented training patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchSample {
    /// [modality, z, y, x]
    pub image: Volume,
    /// One-hot [class, z, y, x], declared label order
    pub mask:  Volume,
}

/// A non-empty group of equally shaped training patches.
/// Device tensors are built from it by the learner's batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    samples: Vec<PatchSample>,
}

impl Batch {
    pub fn new(samples: Vec<PatchSample>) -> SegResult<Self> {
        let first = samples
            .first()
            .ok_or_else(|| SegError::shape("cannot build a batch from zero samples"))?;
        if let Some(bad) = samples
            .iter()
            .find(|s| s.image.shape() != first.image.shape() || s.mask.shape() != first.mask.shape())
        {
            return Err(SegError::shape(format!(
                "ragged batch: image {:?} / mask {:?} next to image {:?} / mask {:?}",
                bad.image.shape(),
                bad.mask.shape(),
                first.image.shape(),
                first.mask.shape()
            )));
        }
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[PatchSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Modalities of every image in the batch.
    pub fn modalities(&self) -> usize {
        self.samples[0].image.len_of(Axis(0))
    }
}

// ─── Flip Variants ────────────────────────────────────────────────────────────
/// One member of the fixed test-time augmentation set:
/// a mirror along any combination of the three spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlipVariant {
    /// Mirror flags for (z, y, x)
    pub axes: [bool; 3],
}

impl FlipVariant {
    pub const IDENTITY: FlipVariant = FlipVariant { axes: [false, false, false] };

    /// Identity plus all seven non-empty axis combinations.
    pub const ALL: [FlipVariant; 8] = [
        FlipVariant { axes: [false, false, false] },
        FlipVariant { axes: [true, false, false] },
        FlipVariant { axes: [false, true, false] },
        FlipVariant { axes: [false, false, true] },
        FlipVariant { axes: [true, true, false] },
        FlipVariant { axes: [true, false, true] },
        FlipVariant { axes: [false, true, true] },
        FlipVariant { axes: [true, true, true] },
    ];

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Mirror `volume` along the flagged spatial axes.
    /// Applying the same variant twice returns the original volume.
    pub fn apply(&self, volume: &Volume) -> Volume {
        if self.is_identity() {
            return volume.clone();
        }
        let mut view: ArrayView4<f32> = volume.view();
        for (axis, &flip) in self.axes.iter().enumerate() {
            if flip {
                view.invert_axis(Axis(axis + 1));
            }
        }
        view.as_standard_layout().into_owned()
    }

    /// Label-map counterpart of [`FlipVariant::apply`].
    pub fn apply_labels(&self, labels: &LabelMap) -> LabelMap {
        let mut view = labels.view();
        for (axis, &flip) in self.axes.iter().enumerate() {
            if flip {
                view.invert_axis(Axis(axis));
            }
        }
        view.as_standard_layout().into_owned()
    }

    /// Inverse transform. Mirrors are involutions.
    pub fn invert(&self, volume: &Volume) -> Volume {
        self.apply(volume)
    }
}
