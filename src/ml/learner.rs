// ============================================================
// Layer 5 — Burn Learner
// ============================================================
// Concrete Learner / LearnerFactory / SegmentationModel on top
// of Burn.
//
// Key Burn 0.20 insight:
//   - Training uses an AutodiffBackend for gradients
//   - net.valid() returns the network on B::InnerBackend, which
//     is what inference and validation run on
//   - optim.step consumes the module and returns the updated one
//   - CompactRecorder appends its own file extension to "model"
//
// The optimiser type differs per OptimizerKind, so the learner
// is built inside `scoped` where the concrete type is known and
// is dropped when the fold body returns.
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use std::f64::consts::PI;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::{
    data::dataloader::batcher::Batcher,
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::{activation::softmax, backend::AutodiffBackend},
};
use serde::{Deserialize, Serialize};

use crate::data::batcher::{volume_tensor, PatchBatch, PatchBatcher};
use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::{Learner, LearnerFactory, Persist, SegmentationModel};
use crate::domain::volume::{Batch, Volume};
use crate::ml::loss::soft_dice_loss;
use crate::ml::model::{SegNet, SegNetConfig, SegNetRecord};

/// File stem of a snapshot inside its slot directory.
pub const SNAPSHOT_STEM: &str = "model";

// ─── Optimiser settings ───────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "sgd"  => Ok(Self::Sgd),
            other  => Err(format!("unknown optimizer '{other}' (expected adam|sgd)")),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adam => write!(f, "adam"),
            Self::Sgd  => write!(f, "sgd"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedule {
    Constant,
    Cosine,
}

impl FromStr for LrSchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "cosine"   => Ok(Self::Cosine),
            other      => Err(format!("unknown schedule '{other}' (expected constant|cosine)")),
        }
    }
}

impl fmt::Display for LrSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant => write!(f, "constant"),
            Self::Cosine   => write!(f, "cosine"),
        }
    }
}

impl LrSchedule {
    /// Rate for update number `step` (0-based) of `total` updates.
    ///   cosine: lr · ½ · (1 + cos(π · step / total))
    pub fn rate(&self, base: f64, step: usize, total: usize) -> f64 {
        match self {
            Self::Constant => base,
            Self::Cosine => {
                let progress = if total == 0 { 0.0 } else { (step.min(total)) as f64 / total as f64 };
                base * 0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub kind:          OptimizerKind,
    pub learning_rate: f64,
    pub schedule:      LrSchedule,
    /// Gradient L2-norm ceiling
    pub grad_clip:     Option<f32>,
}

// ─── BurnLearnerFactory ───────────────────────────────────────────────────────
pub struct BurnLearnerFactory<B: AutodiffBackend> {
    net:           SegNetConfig,
    optim:         OptimizerSettings,
    class_weights: Option<Vec<f32>>,
    total_steps:   usize,
    device:        B::Device,
}

impl<B: AutodiffBackend> BurnLearnerFactory<B> {
    pub fn new(
        net:           SegNetConfig,
        optim:         OptimizerSettings,
        class_weights: Option<Vec<f32>>,
        total_steps:   usize,
        device:        B::Device,
    ) -> Self {
        Self { net, optim, class_weights, total_steps, device }
    }

    fn run<O, R, F>(&self, optim: O, body: F) -> SegResult<R>
    where
        O: Optimizer<SegNet<B>, B>,
        F: FnOnce(&mut dyn Learner) -> SegResult<R>,
    {
        let mut learner = BurnLearner {
            net:           self.net.init::<B>(&self.device),
            optim,
            settings:      self.optim.clone(),
            class_weights: self.class_weights.clone(),
            total_steps:   self.total_steps,
            step:          0,
            in_channels:   self.net.in_channels,
            device:        self.device.clone(),
        };
        body(&mut learner)
    }
}

impl<B: AutodiffBackend> LearnerFactory for BurnLearnerFactory<B> {
    fn scoped<R, F>(&self, fold: usize, body: F) -> SegResult<R>
    where
        F: FnOnce(&mut dyn Learner) -> SegResult<R>,
    {
        tracing::info!(
            "Fold {fold}: fresh network ({} filters, depth {}), {} lr={} schedule={}",
            self.net.init_filters, self.net.depth,
            self.optim.kind, self.optim.learning_rate, self.optim.schedule,
        );
        let clip = self.optim.grad_clip.map(GradientClippingConfig::Norm);

        match self.optim.kind {
            // m = β1*m + (1-β1)*g        (mean)
            // v = β2*v + (1-β2)*g²       (variance)
            // θ = θ - lr * m / (√v + ε)  (update)
            OptimizerKind::Adam => {
                let optim = AdamConfig::new()
                    .with_epsilon(1e-8)
                    .with_grad_clipping(clip)
                    .init::<B, SegNet<B>>();
                self.run(optim, body)
            }
            OptimizerKind::Sgd => {
                let optim = SgdConfig::new()
                    .with_gradient_clipping(clip)
                    .init::<B, SegNet<B>>();
                self.run(optim, body)
            }
        }
    }

    fn load_predictor(&self, dir: &Path) -> SegResult<Box<dyn SegmentationModel>> {
        let path = dir.join(SNAPSHOT_STEM);
        let record: SegNetRecord<B::InnerBackend> = CompactRecorder::new()
            .load(path.clone(), &self.device)
            .map_err(|e| SegError::checkpoint(&path, format!("{e:?}")))?;
        let net = self.net.init::<B::InnerBackend>(&self.device).load_record(record);
        Ok(Box::new(BurnPredictor::new(net, self.net.in_channels, self.device.clone())))
    }
}

// ─── BurnLearner ──────────────────────────────────────────────────────────────
pub struct BurnLearner<B: AutodiffBackend, O: Optimizer<SegNet<B>, B>> {
    net:           SegNet<B>,
    optim:         O,
    settings:      OptimizerSettings,
    class_weights: Option<Vec<f32>>,
    total_steps:   usize,
    step:          usize,
    in_channels:   usize,
    device:        B::Device,
}

impl<B: AutodiffBackend, O: Optimizer<SegNet<B>, B>> BurnLearner<B, O> {
    fn current_lr(&self) -> f64 {
        self.settings.schedule.rate(self.settings.learning_rate, self.step, self.total_steps)
    }
}

impl<B: AutodiffBackend, O: Optimizer<SegNet<B>, B>> Persist for BurnLearner<B, O> {
    fn save_snapshot(&self, dir: &Path) -> SegResult<()> {
        let path = dir.join(SNAPSHOT_STEM);
        CompactRecorder::new()
            .record(self.net.clone().into_record(), path.clone())
            .map_err(|e| SegError::checkpoint(&path, format!("{e:?}")))
    }
}

impl<B: AutodiffBackend, O: Optimizer<SegNet<B>, B>> Learner for BurnLearner<B, O> {
    fn fit_batch(&mut self, batch: &Batch) -> SegResult<f64> {
        let channels = batch.modalities();
        if channels != self.in_channels {
            return Err(SegError::shape(format!(
                "batch has {channels} modalities, network expects {}",
                self.in_channels
            )));
        }
        let PatchBatch { images, masks }: PatchBatch<B> =
            PatchBatcher.batch(batch.samples().to_vec(), &self.device);

        let logits = self.net.forward(images);
        let loss   = soft_dice_loss(logits, masks, self.class_weights.as_deref());
        let value: f64 = loss.clone().into_scalar().elem::<f64>();
        // a broken loss must not reach the parameters
        if !value.is_finite() {
            return Ok(value);
        }

        let grads = GradientsParams::from_grads(loss.backward(), &self.net);
        let lr    = self.current_lr();
        self.net  = self.optim.step(lr, self.net.clone(), grads);
        self.step += 1;
        Ok(value)
    }

    fn eval_model(&self) -> Box<dyn SegmentationModel> {
        Box::new(BurnPredictor::new(self.net.valid(), self.in_channels, self.device.clone()))
    }

    fn learning_rate(&self) -> Option<f64> {
        Some(self.current_lr())
    }
}

// ─── BurnPredictor ────────────────────────────────────────────────────────────
/// Inference-only network. Outputs softmax probabilities.
pub struct BurnPredictor<B: Backend> {
    net:         SegNet<B>,
    in_channels: usize,
    device:      B::Device,
}

impl<B: Backend> BurnPredictor<B> {
    pub fn new(net: SegNet<B>, in_channels: usize, device: B::Device) -> Self {
        Self { net, in_channels, device }
    }
}

impl<B: Backend> SegmentationModel for BurnPredictor<B> {
    fn forward(&self, patch: &Volume) -> SegResult<Volume> {
        let (c, d, h, w) = patch.dim();
        if c != self.in_channels {
            return Err(SegError::shape(format!(
                "image has {c} modalities, network expects {}",
                self.in_channels
            )));
        }
        let input = volume_tensor::<B>(patch, &self.device);
        let probs = softmax(self.net.forward(input.unsqueeze::<5>()), 1);
        let [_, classes, _, _, _] = probs.dims();

        let values = probs
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| SegError::model(format!("{e:?}")))?;
        Volume::from_shape_vec((classes, d, h, w), values)
            .map_err(|e| SegError::model(e.to_string()))
    }
}

// ─── Runtime backend ──────────────────────────────────────────────────────────
// Training differentiates through Autodiff<Wgpu>; predictors
// reloaded from snapshots run on plain Wgpu.
pub type TrainBackend = burn::backend::Autodiff<burn::backend::Wgpu>;

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::PatchSample;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn factory(kind: OptimizerKind, schedule: LrSchedule) -> BurnLearnerFactory<TestBackend> {
        BurnLearnerFactory::new(
            SegNetConfig::new(1, 2).with_init_filters(2).with_depth(1),
            OptimizerSettings { kind, learning_rate: 1e-2, schedule, grad_clip: Some(1.0) },
            None,
            4,
            Default::default(),
        )
    }

    fn batch() -> Batch {
        let sample = PatchSample {
            image: Volume::from_shape_fn((1, 4, 4, 4), |(_, z, _, _)| z as f32),
            mask:  Volume::from_shape_fn((2, 4, 4, 4), |(c, z, _, _)| {
                if (c == 1) == (z >= 2) { 1.0 } else { 0.0 }
            }),
        };
        Batch::new(vec![sample.clone(), sample]).unwrap()
    }

    #[test]
    fn test_cosine_schedule() {
        let s = LrSchedule::Cosine;
        assert!((s.rate(1.0, 0, 10) - 1.0).abs() < 1e-12);
        assert!((s.rate(1.0, 5, 10) - 0.5).abs() < 1e-12);
        assert!(s.rate(1.0, 10, 10).abs() < 1e-12);
        assert_eq!(LrSchedule::Constant.rate(0.3, 7, 10), 0.3);
    }

    #[test]
    fn test_parse_settings() {
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert!("rmsprop".parse::<OptimizerKind>().is_err());
        assert_eq!("cosine".parse::<LrSchedule>().unwrap(), LrSchedule::Cosine);
    }

    #[test]
    fn test_fit_batch_returns_finite_loss_and_advances_lr() {
        for kind in [OptimizerKind::Adam, OptimizerKind::Sgd] {
            let f = factory(kind, LrSchedule::Cosine);
            f.scoped(0, |learner| {
                let before = learner.learning_rate().unwrap();
                let loss = learner.fit_batch(&batch())?;
                assert!(loss.is_finite() && (0.0..=1.0).contains(&loss));
                assert!(learner.learning_rate().unwrap() < before);
                Ok(())
            })
            .unwrap();
        }
    }

    #[test]
    fn test_eval_model_outputs_probabilities() {
        let f = factory(OptimizerKind::Adam, LrSchedule::Constant);
        let out = f
            .scoped(0, |learner| learner.eval_model().forward(&Volume::zeros((1, 3, 4, 5))))
            .unwrap();
        assert_eq!(out.shape(), &[2, 3, 4, 5]);
        let sum = out[[0, 1, 2, 3]] + out[[1, 1, 2, 3]];
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_modality_mismatch_is_shape_error() {
        let f = factory(OptimizerKind::Adam, LrSchedule::Constant);
        let err = f
            .scoped(0, |learner| learner.eval_model().forward(&Volume::zeros((3, 4, 4, 4))))
            .unwrap_err();
        assert!(matches!(err, SegError::Shape { .. }));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(OptimizerKind::Adam, LrSchedule::Constant);
        let patch = Volume::from_shape_fn((1, 4, 4, 4), |(_, z, y, x)| (z + y + x) as f32);

        let expected = f
            .scoped(0, |learner| {
                learner.fit_batch(&batch())?;
                learner.save_snapshot(dir.path())?;
                learner.eval_model().forward(&patch)
            })
            .unwrap();

        let reloaded = f.load_predictor(dir.path()).unwrap().forward(&patch).unwrap();
        for (a, b) in expected.iter().zip(reloaded.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_missing_snapshot_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(OptimizerKind::Adam, LrSchedule::Constant);
        assert!(matches!(
            f.load_predictor(dir.path()),
            Err(SegError::CheckpointIo { .. })
        ));
    }
}
