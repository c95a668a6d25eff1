// ============================================================
// Layer 4 — Patch Batcher
// ============================================================
// Implements Burn's Batcher trait to turn a Vec<PatchSample>
// into device tensors for the forward pass.
//
// How batching works here:
//   Input:  N samples, image [modality, z, y, x]
//                      mask  [class,    z, y, x]
//   Output: PatchBatch { images: [N, modality, z, y, x],
//                        masks:  [N, class,    z, y, x] }
//
//   Each volume becomes one 4D tensor, then Tensor::stack adds
//   the leading batch dimension.
//
// Every sample must have the same shape; Batch::new checks
// this before anything reaches the batcher, because Burn's
// batch() cannot report an error.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::TensorData,
};

use crate::domain::volume::{PatchSample, Volume};

/// A batch of training patches on a Burn device.
#[derive(Debug, Clone)]
pub struct PatchBatch<B: Backend> {
    /// [batch, modality, z, y, x]
    pub images: Tensor<B, 5>,
    /// One-hot [batch, class, z, y, x]
    pub masks:  Tensor<B, 5>,
}

/// Copy one volume onto `device` as a [channel, z, y, x] tensor.
pub fn volume_tensor<B: Backend>(volume: &Volume, device: &B::Device) -> Tensor<B, 4> {
    let values: Vec<f32> = volume.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, volume.shape().to_vec()), device)
}

#[derive(Clone, Debug, Default)]
pub struct PatchBatcher;

impl<B: Backend> Batcher<B, PatchSample, PatchBatch<B>> for PatchBatcher {
    fn batch(&self, items: Vec<PatchSample>, device: &B::Device) -> PatchBatch<B> {
        let images = items.iter().map(|s| volume_tensor::<B>(&s.image, device)).collect();
        let masks  = items.iter().map(|s| volume_tensor::<B>(&s.mask, device)).collect();

        PatchBatch {
            images: Tensor::stack(images, 0),
            masks:  Tensor::stack(masks, 0),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn sample(value: f32) -> PatchSample {
        PatchSample {
            image: Volume::from_shape_fn((1, 2, 2, 2), |(_, z, y, x)| value + (z * 4 + y * 2 + x) as f32),
            mask:  Volume::from_elem((2, 2, 2, 2), value),
        }
    }

    #[test]
    fn test_stacks_samples_in_order() {
        let device = Default::default();
        let batch: PatchBatch<TestBackend> = PatchBatcher.batch(vec![sample(0.0), sample(10.0)], &device);

        assert_eq!(batch.images.dims(), [2, 1, 2, 2, 2]);
        assert_eq!(batch.masks.dims(), [2, 2, 2, 2, 2]);

        let images = batch.images.into_data().to_vec::<f32>().unwrap();
        assert_eq!(images[..8], [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(images[8], 10.0);
        let masks = batch.masks.into_data().to_vec::<f32>().unwrap();
        assert!(masks[16..].iter().all(|&v| v == 10.0));
    }

    #[test]
    fn test_volume_tensor_keeps_layout() {
        let device = Default::default();
        let v = Volume::from_shape_fn((2, 1, 1, 3), |(c, _, _, x)| (c * 10 + x) as f32);
        let t = volume_tensor::<TestBackend>(&v, &device);
        assert_eq!(t.dims(), [2, 1, 1, 3]);
        assert_eq!(t.into_data().to_vec::<f32>().unwrap(), vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
    }
}
