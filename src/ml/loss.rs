// ============================================================
// Layer 5 — Dice Loss
// ============================================================
// Soft Dice loss, averaged over classes:
//
//   dice_c = (2 · Σ p·g + ε) / (Σ p + Σ g + ε)
//   loss   = Σ_c w_c · (1 - dice_c) / Σ_c w_c
//
// Two renditions of the same formula:
//   DiceLoss        — on ndarray volumes, used for validation
//                     on full sliding-window predictions
//   soft_dice_loss  — on Burn tensors, used for training so
//                     gradients flow through it
//
// Reference: Milletari et al. (2016) V-Net

use burn::prelude::*;
use burn::tensor::activation::softmax;
use ndarray::Axis;

use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::LossFunction;
use crate::domain::volume::Volume;

const SMOOTH: f64 = 1e-6;

/// Class-weighted soft Dice loss on [class, z, y, x] volumes.
#[derive(Debug, Clone, Default)]
pub struct DiceLoss {
    class_weights: Option<Vec<f32>>,
}

impl DiceLoss {
    pub fn new(class_weights: Option<Vec<f32>>) -> Self {
        Self { class_weights }
    }

    fn weight(&self, class: usize) -> f64 {
        self.class_weights
            .as_ref()
            .and_then(|w| w.get(class))
            .map_or(1.0, |&w| w as f64)
    }
}

impl LossFunction for DiceLoss {
    fn loss(&self, mask: &Volume, prediction: &Volume) -> SegResult<f64> {
        if mask.shape() != prediction.shape() {
            return Err(SegError::shape(format!(
                "mask {:?} and prediction {:?} differ",
                mask.shape(),
                prediction.shape()
            )));
        }
        if let Some(w) = &self.class_weights {
            if w.len() != mask.len_of(Axis(0)) {
                return Err(SegError::config(format!(
                    "{} class weights for {} classes",
                    w.len(),
                    mask.len_of(Axis(0))
                )));
            }
        }

        let mut weighted = 0.0;
        let mut total_w  = 0.0;
        for (class, (g, p)) in mask.outer_iter().zip(prediction.outer_iter()).enumerate() {
            let intersection: f64 = g.iter().zip(p.iter()).map(|(&g, &p)| (g * p) as f64).sum();
            let denom: f64 = g.iter().map(|&v| v as f64).sum::<f64>()
                           + p.iter().map(|&v| v as f64).sum::<f64>();
            let dice = (2.0 * intersection + SMOOTH) / (denom + SMOOTH);
            let w = self.weight(class);
            weighted += w * (1.0 - dice);
            total_w  += w;
        }
        if total_w <= 0.0 {
            return Err(SegError::config("class weights sum to zero"));
        }
        Ok(weighted / total_w)
    }
}

/// Soft Dice on logits [n, class, z, y, x] against one-hot targets of the same shape.
/// Softmax runs over the class axis; sums run over batch and space.
pub fn soft_dice_loss<B: Backend>(
    logits:        Tensor<B, 5>,
    targets:       Tensor<B, 5>,
    class_weights: Option<&[f32]>,
) -> Tensor<B, 1> {
    let [_, classes, _, _, _] = logits.dims();
    let device = logits.device();
    let probs  = softmax(logits, 1);

    let reduce = |t: Tensor<B, 5>| -> Tensor<B, 1> {
        t.sum_dim(0).sum_dim(2).sum_dim(3).sum_dim(4).reshape([classes])
    };

    let intersection = reduce(probs.clone() * targets.clone());
    let denom        = reduce(probs) + reduce(targets);
    let dice         = intersection.mul_scalar(2.0).add_scalar(SMOOTH) / denom.add_scalar(SMOOTH);
    let per_class    = dice.neg().add_scalar(1.0);

    match class_weights {
        Some(w) => {
            let total: f32 = w.iter().sum();
            let weights = Tensor::<B, 1>::from_floats(w, &device);
            (per_class * weights).sum().div_scalar(total)
        }
        None => per_class.mean(),
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn two_class_mask() -> Volume {
        Volume::from_shape_fn((2, 2, 2, 2), |(c, z, _, _)| {
            let fg = z == 1;
            if (c == 1) == fg { 1.0 } else { 0.0 }
        })
    }

    #[test]
    fn test_perfect_prediction_has_zero_loss() {
        let mask = two_class_mask();
        let loss = DiceLoss::default().loss(&mask, &mask).unwrap();
        assert!(loss.abs() < 1e-6);
    }

    #[test]
    fn test_inverted_prediction_has_unit_loss() {
        let mask = two_class_mask();
        let inverted = mask.mapv(|v| 1.0 - v);
        let loss = DiceLoss::default().loss(&mask, &inverted).unwrap();
        assert!((loss - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_class_weights_shift_the_average() {
        let mask = two_class_mask();
        // class 0 right, class 1 empty
        let mut pred = mask.clone();
        pred.index_axis_mut(Axis(0), 1).fill(0.0);

        let uniform  = DiceLoss::default().loss(&mask, &pred).unwrap();
        let fg_heavy = DiceLoss::new(Some(vec![0.0, 1.0])).loss(&mask, &pred).unwrap();
        assert!((uniform - 0.5).abs() < 1e-6);
        assert!((fg_heavy - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_shape_and_weight_mismatch_are_rejected() {
        let mask = two_class_mask();
        let small = Volume::zeros((2, 1, 2, 2));
        assert!(matches!(
            DiceLoss::default().loss(&mask, &small),
            Err(SegError::Shape { .. })
        ));
        assert!(matches!(
            DiceLoss::new(Some(vec![1.0])).loss(&mask, &mask),
            Err(SegError::Configuration { .. })
        ));
    }

    #[test]
    fn test_tensor_dice_matches_confident_logits() {
        let device = Default::default();
        let mask = two_class_mask();
        let values: Vec<f32> = mask.iter().copied().collect();

        let targets: Tensor<TestBackend, 5> = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device)
            .reshape([1, 2, 2, 2, 2]);
        // large logits on the right class → softmax ≈ one-hot
        let logits = targets.clone().mul_scalar(40.0);

        let loss: f64 = soft_dice_loss(logits, targets, None).into_scalar().elem::<f64>();
        assert!(loss < 1e-4, "loss = {loss}");
    }

    #[test]
    fn test_tensor_dice_is_bounded() {
        let device = Default::default();
        let logits  = Tensor::<TestBackend, 5>::zeros([2, 3, 2, 2, 2], &device);
        let targets = Tensor::<TestBackend, 5>::ones([2, 3, 2, 2, 2], &device);
        let loss: f64 = soft_dice_loss(logits, targets, Some(&[1.0, 2.0, 1.0]))
            .into_scalar()
            .elem::<f64>();
        assert!(loss > 0.0 && loss < 1.0);
    }
}
