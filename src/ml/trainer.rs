// ============================================================
// Layer 5 — Training Step Engine
// ============================================================
// One optimisation step and one validation step, plus the
// per-fold bookkeeping they update.
//
// Counters:
//   global_step       — monotonic, advanced by every train_step
//   epoch_index       = global_step / steps_per_epoch
//   step_in_epoch     = global_step % steps_per_epoch
//
// Both loop checks are pure predicates over global_step:
//   at_epoch_boundary — global_step > 0 && step_in_epoch == 0
//   budget_exhausted  — global_step >= epochs * steps_per_epoch
//
// Validation goes through the same SlidingWindowInferer used
// for test evaluation, with one model and no flips.

use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::{Learner, LossFunction, SegmentationModel};
use crate::domain::volume::{Batch, Volume};
use crate::ml::inferencer::{InferenceSettings, SlidingWindowInferer};

// ─── MeanAccumulator ──────────────────────────────────────────────────────────
/// Running mean of scalar losses.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanAccumulator {
    sum:   f64,
    count: usize,
}

impl MeanAccumulator {
    pub fn update(&mut self, value: f64) {
        self.sum   += value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// NaN when nothing was recorded.
    pub fn result(&self) -> f64 {
        if self.count > 0 { self.sum / self.count as f64 } else { f64::NAN }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ─── TrainingState ────────────────────────────────────────────────────────────
/// Mutable state of one fold's training run. Built fresh per fold.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub global_step:     usize,
    pub steps_per_epoch: usize,
    pub total_steps:     usize,
    pub train_loss:      MeanAccumulator,
    pub val_loss:        MeanAccumulator,
}

impl TrainingState {
    pub fn new(epochs: usize, steps_per_epoch: usize) -> SegResult<Self> {
        if epochs == 0 || steps_per_epoch == 0 {
            return Err(SegError::config(format!(
                "epochs ({epochs}) and steps_per_epoch ({steps_per_epoch}) must both be >= 1"
            )));
        }
        Ok(Self {
            global_step:     0,
            steps_per_epoch,
            total_steps:     epochs * steps_per_epoch,
            train_loss:      MeanAccumulator::default(),
            val_loss:        MeanAccumulator::default(),
        })
    }

    pub fn budget_exhausted(&self) -> bool {
        self.global_step >= self.total_steps
    }

    pub fn at_epoch_boundary(&self) -> bool {
        self.global_step > 0 && self.step_in_epoch() == 0
    }

    /// Completed epochs.
    pub fn epoch_index(&self) -> usize {
        self.global_step / self.steps_per_epoch
    }

    pub fn step_in_epoch(&self) -> usize {
        self.global_step % self.steps_per_epoch
    }

    pub fn epochs(&self) -> usize {
        self.total_steps / self.steps_per_epoch
    }

    /// Zero the validation accumulator at the top of a validation round.
    pub fn begin_validation(&mut self) {
        self.val_loss.reset();
    }

    /// Read both epoch means and zero the training accumulator.
    pub fn close_epoch(&mut self) -> (f64, f64) {
        let means = (self.train_loss.result(), self.val_loss.result());
        self.train_loss.reset();
        means
    }
}

// ─── StepEngine ───────────────────────────────────────────────────────────────
pub struct StepEngine<'a> {
    inferer: SlidingWindowInferer,
    loss:    &'a dyn LossFunction,
}

impl<'a> StepEngine<'a> {
    /// Validation always runs without test-time flips.
    pub fn new(settings: &InferenceSettings, loss: &'a dyn LossFunction) -> Self {
        Self {
            inferer: SlidingWindowInferer::new(settings.without_tta()),
            loss,
        }
    }

    /// One optimisation step. Fails with NumericInstability on a
    /// non-finite loss; the step counter still advances so the error
    /// carries the step that produced it.
    pub fn train_step(
        &self,
        state:   &mut TrainingState,
        learner: &mut dyn Learner,
        batch:   &Batch,
    ) -> SegResult<f64> {
        let loss = learner.fit_batch(batch)?;
        state.global_step += 1;
        if !loss.is_finite() {
            return Err(SegError::NumericInstability { step: state.global_step, loss });
        }
        state.train_loss.update(loss);
        Ok(loss)
    }

    /// Full-volume validation of one case. `mask` is one-hot
    /// [class, z, y, x]. Never touches model parameters.
    pub fn val_step(
        &self,
        state: &mut TrainingState,
        model: &dyn SegmentationModel,
        image: &Volume,
        mask:  &Volume,
    ) -> SegResult<f64> {
        let prediction = self.inferer.predict(image, &[model])?;
        let loss = self.loss.loss(mask, &prediction)?;
        if !loss.is_finite() {
            return Err(SegError::NumericInstability { step: state.global_step, loss });
        }
        state.val_loss.update(loss);
        Ok(loss)
    }
}
