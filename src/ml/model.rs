// ============================================================
// Layer 5 — Segmentation Network (Burn)
// ============================================================
// A small fully-convolutional 3D network:
//
//   stem   : 3×3×3 conv, in_channels → init_filters, ReLU
//   blocks : depth × (3×3×3 dilated conv + residual, ReLU),
//            dilation 1, 2, 4, ... widens the receptive field
//            without downsampling, so any patch size works
//   head   : 1×1×1 conv, init_filters → n_classes (logits)
//
// Input  [batch, modality, z, y, x]
// Output [batch, class,    z, y, x]

use burn::{
    nn::{
        conv::{Conv3d, Conv3dConfig},
        PaddingConfig3d,
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::domain::volume::Shape3;

const MAX_DEPTH: usize = 5;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct SegNetConfig {
    pub in_channels:  usize,
    pub n_classes:    usize,
    #[config(default = 8)]
    pub init_filters: usize,
    #[config(default = 3)]
    pub depth:        usize,
}

impl SegNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegNet<B> {
        let f = self.init_filters;
        let stem = Conv3dConfig::new([self.in_channels, f], [3, 3, 3])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .init(device);
        let blocks = (0..self.depth.max(1))
            .map(|i| {
                let d = 1usize << i;
                Conv3dConfig::new([f, f], [3, 3, 3])
                    .with_dilation([d, d, d])
                    .with_padding(PaddingConfig3d::Explicit(d, d, d))
                    .init(device)
            })
            .collect();
        let head = Conv3dConfig::new([f, self.n_classes], [1, 1, 1]).init(device);
        SegNet { stem, blocks, head }
    }
}

#[derive(Module, Debug)]
pub struct SegNet<B: Backend> {
    pub stem:   Conv3d<B>,
    pub blocks: Vec<Conv3d<B>>,
    pub head:   Conv3d<B>,
}

impl<B: Backend> SegNet<B> {
    /// [batch, modality, z, y, x] → logits [batch, class, z, y, x]
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut x = relu(self.stem.forward(x));
        for block in &self.blocks {
            x = relu(block.forward(x.clone()) + x);
        }
        self.head.forward(x)
    }
}

/// Depth derived from the smallest patch axis:
/// min(floor(log2(min(patch) / 4)), 5), at least 1.
pub fn default_depth(patch: Shape3) -> usize {
    let smallest = patch.iter().copied().min().unwrap_or(0);
    let ratio = smallest / 4;
    if ratio < 2 {
        return 1;
    }
    (ratio.ilog2() as usize).clamp(1, MAX_DEPTH)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_keeps_spatial_shape() {
        let device = Default::default();
        let net: SegNet<TestBackend> = SegNetConfig::new(2, 3)
            .with_init_filters(4)
            .with_depth(2)
            .init(&device);
        let x = Tensor::<TestBackend, 5>::zeros([1, 2, 6, 5, 4], &device);
        assert_eq!(net.forward(x).dims(), [1, 3, 6, 5, 4]);
        assert_eq!(net.blocks.len(), 2);
    }

    #[test]
    fn test_default_depth() {
        assert_eq!(default_depth([64, 64, 64]), 4);
        assert_eq!(default_depth([128, 160, 112]), 4);
        assert_eq!(default_depth([256, 256, 256]), 5);
        assert_eq!(default_depth([8, 8, 8]), 1);
        assert_eq!(default_depth([4, 64, 64]), 1);
    }
}
