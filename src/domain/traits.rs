// ============================================================
// Layer 3 — Core Traits (Collaborator Seams)
// ============================================================
// The orchestration core never names a concrete network,
// optimizer, data pipeline or metric. It talks to these
// traits instead:
//
//   SegmentationModel  — forward pass on one patch
//   Persist            — write a snapshot into a directory
//   Learner            — model + optimizer owned by one fold
//   LearnerFactory     — builds a Learner inside a fold scope,
//                        reloads snapshots for inference
//   CaseSource         — eval-mode access to whole cases
//   BatchStreamFactory — train-mode infinite batch iterator
//   LossFunction       — loss(mask, prediction) → scalar
//   CaseEvaluator      — prediction vs truth → metric row
//
// Implementations:
//   - ml::learner::BurnLearnerFactory  → Burn network + Adam/SGD
//   - data::dataset::CaseDataset       → JSON volumes on disk
//   - data::sampler::PatchSampler      → random patch batches
//   - ml::loss::DiceLoss               → soft Dice on volumes
//   - infra::evaluator::DiceEvaluator  → per-label Dice
//
// Reference: Rust Book §10 (Traits), §17 (Trait Objects)

use std::path::Path;

use crate::domain::case::LabeledCase;
use crate::domain::error::SegResult;
use crate::domain::volume::{Batch, LabelMap, Volume};

// ─── SegmentationModel ────────────────────────────────────────────────────────
/// A trained model that maps one patch [modality, z, y, x]
/// to per-class scores [class, z, y, x] of the same spatial size.
/// Inference must be deterministic.
pub trait SegmentationModel {
    fn forward(&self, patch: &Volume) -> SegResult<Volume>;
}

// ─── Persist ──────────────────────────────────────────────────────────────────
/// Anything whose state can be written as a snapshot.
/// `dir` exists and is empty when this is called.
pub trait Persist {
    fn save_snapshot(&self, dir: &Path) -> SegResult<()>;
}

// ─── Learner ──────────────────────────────────────────────────────────────────
/// A model together with its optimizer state.
/// Exclusively owned by the fold that created it.
pub trait Learner: Persist {
    /// Forward pass, loss, gradients and one optimizer update.
    /// Returns the unscaled loss of the batch. Not idempotent.
    fn fit_batch(&mut self, batch: &Batch) -> SegResult<f64>;

    /// An inference view of the current parameters.
    fn eval_model(&self) -> Box<dyn SegmentationModel>;

    /// The learning rate that the next update will use, if the
    /// optimizer exposes one.
    fn learning_rate(&self) -> Option<f64>;
}

// ─── LearnerFactory ───────────────────────────────────────────────────────────
/// Builds fresh learners and reloads persisted ones.
pub trait LearnerFactory {
    /// Construct a brand-new learner for `fold`, hand it to `body`,
    /// and drop it when `body` returns. Nothing built here
    /// outlives the call.
    fn scoped<R, F>(&self, fold: usize, body: F) -> SegResult<R>
    where
        F: FnOnce(&mut dyn Learner) -> SegResult<R>;

    /// Rebuild an inference model from a snapshot directory.
    fn load_predictor(&self, dir: &Path) -> SegResult<Box<dyn SegmentationModel>>;
}

// ─── Data ─────────────────────────────────────────────────────────────────────
/// Eval-mode access to whole labelled cases, addressed by index.
pub trait CaseSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn case_id(&self, index: usize) -> SegResult<String>;

    /// May block on I/O.
    fn load(&self, index: usize) -> SegResult<LabeledCase>;
}

/// An infinite stream of training batches.
pub type BatchStream<'a> = Box<dyn Iterator<Item = SegResult<Batch>> + 'a>;

/// Train-mode data pipeline. The returned stream cycles forever;
/// the caller decides when to stop pulling.
pub trait BatchStreamFactory {
    fn train_stream<'a>(&'a self, indices: &[usize], seed: u64) -> SegResult<BatchStream<'a>>;
}

// ─── Loss and Evaluation ──────────────────────────────────────────────────────
pub trait LossFunction {
    /// `mask` and `prediction` are both [class, z, y, x].
    fn loss(&self, mask: &Volume, prediction: &Volume) -> SegResult<f64>;
}

pub trait CaseEvaluator {
    /// Metric column names, in the order `evaluate` returns them.
    fn columns(&self) -> Vec<String>;

    fn evaluate(
        &self,
        prediction: &Volume,
        truth:      &LabelMap,
        case_id:    &str,
    ) -> SegResult<Vec<(String, f64)>>;
}
