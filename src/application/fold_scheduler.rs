// ============================================================
// Layer 2 — Fold Scheduler
// ============================================================
// Drives every selected fold through a fixed state machine:
//
//   INIT            — partition, fresh TrainingState and
//                     CheckpointManager, metrics fold opened
//   TRAIN_VAL_CYCLE — train_step until the step budget is
//                     used up; at each epoch boundary:
//                       val_step over every validation case
//                       → CheckpointManager::update
//                       → MetricsAggregator::on_epoch_end
//   FOLD_TEST_EVAL  — reload the best snapshot, sliding-window
//                     predict every test case, evaluate it,
//                     MetricsAggregator::on_kfold_end
//   FOLD_DONE       — nothing from this fold is still alive
//
// The learner and the batch stream exist only inside
// LearnerFactory::scoped, so they are dropped before test
// evaluation starts and long before the next fold's INIT.
//
// Failure handling:
//   case-local (Shape, Data)  → skip the case (degraded)
//                               or abort the run (strict)
//   anything else in a fold   → fold failed; next fold
//                               (degraded) or abort (strict)
//   Configuration, Lifecycle,
//   EmptyEnsemble             → always abort the run
//   Report (log / CSV write)  → warn and carry on (degraded)
//                               or as any other error (strict)
//
// A validation round in which every case was skipped fails the
// fold with EmptyValidation rather than scoring a NaN loss.
//
// After the last fold, on_training_end fires exactly once.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::loader::write_json;
use crate::data::splitter::build_folds;
use crate::domain::case::{EpochRecord, ResultRecord};
use crate::domain::error::{SegError, SegResult};
use crate::domain::fold::Fold;
use crate::domain::traits::{
    BatchStreamFactory, CaseEvaluator, CaseSource, Learner, LearnerFactory, LossFunction,
    SegmentationModel,
};
use crate::domain::volume::one_hot;
use crate::infra::checkpoint::CheckpointManager;
use crate::infra::metrics::{CrossFoldSummary, MetricsAggregator};
use crate::ml::inferencer::{InferenceSettings, SlidingWindowInferer};
use crate::ml::trainer::{StepEngine, TrainingState};

// ─── Phases and policy ────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldPhase {
    Init,
    TrainValCycle,
    FoldTestEval,
    FoldDone,
}

impl fmt::Display for FoldPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init          => "INIT",
            Self::TrainValCycle => "TRAIN_VAL_CYCLE",
            Self::FoldTestEval  => "FOLD_TEST_EVAL",
            Self::FoldDone      => "FOLD_DONE",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Degraded,
    Strict,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "degraded" => Ok(Self::Degraded),
            "strict"   => Ok(Self::Strict),
            other      => Err(format!("unknown failure policy '{other}' (expected degraded|strict)")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Degraded => write!(f, "degraded"),
            Self::Strict   => write!(f, "strict"),
        }
    }
}

fn run_fatal(e: &SegError) -> bool {
    matches!(
        e,
        SegError::Configuration { .. } | SegError::Lifecycle { .. } | SegError::EmptyEnsemble
    )
}

// ─── Settings and results ─────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub task:            String,
    pub nfolds:          usize,
    /// Fold indices to run, in order
    pub folds:           Vec<usize>,
    pub val_fraction:    f64,
    pub epochs:          usize,
    pub steps_per_epoch: usize,
    pub seed:            u64,
    pub inference:       InferenceSettings,
    /// Declared label order; also the one-hot channel order
    pub label_values:    Vec<i32>,
    pub policy:          FailurePolicy,
    pub models_dir:      PathBuf,
    /// Where fold test predictions are written, if anywhere
    pub raw_predictions: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct FoldOutcome {
    pub fold:          usize,
    pub records:       Vec<ResultRecord>,
    pub skipped_cases: Vec<String>,
    pub best_epoch:    Option<usize>,
    pub best_val_loss: f64,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub completed: Vec<FoldOutcome>,
    pub failed:    Vec<(usize, String)>,
    pub summary:   CrossFoldSummary,
}

impl RunReport {
    pub fn records(&self) -> impl Iterator<Item = &ResultRecord> {
        self.completed.iter().flat_map(|f| f.records.iter())
    }
}

// ─── FoldScheduler ────────────────────────────────────────────────────────────
pub struct FoldScheduler<'a, F: LearnerFactory> {
    settings:  SchedulerSettings,
    factory:   &'a F,
    cases:     &'a dyn CaseSource,
    batches:   &'a dyn BatchStreamFactory,
    loss:      &'a dyn LossFunction,
    evaluator: &'a dyn CaseEvaluator,
}

impl<'a, F: LearnerFactory> FoldScheduler<'a, F> {
    pub fn new(
        settings:  SchedulerSettings,
        factory:   &'a F,
        cases:     &'a dyn CaseSource,
        batches:   &'a dyn BatchStreamFactory,
        loss:      &'a dyn LossFunction,
        evaluator: &'a dyn CaseEvaluator,
    ) -> Self {
        Self { settings, factory, cases, batches, loss, evaluator }
    }

    /// Partition the dataset, run every selected fold, then close the run.
    pub fn run(&self, metrics: &mut MetricsAggregator) -> SegResult<RunReport> {
        let s = &self.settings;
        let folds = build_folds(self.cases.len(), s.nfolds, s.val_fraction, s.seed)?;
        if let Some(bad) = s.folds.iter().find(|&&f| f >= folds.len()) {
            return Err(SegError::config(format!("fold {bad} requested but nfolds is {}", s.nfolds)));
        }
        if let Some(dup) = s.folds.iter().enumerate().find_map(|(i, f)| s.folds[..i].contains(f).then_some(f)) {
            return Err(SegError::config(format!("fold {dup} requested more than once")));
        }

        let mut completed = Vec::new();
        let mut failed    = Vec::new();

        for &index in &s.folds {
            let fold = &folds[index];
            self.tolerate_report(metrics.on_fold_start(index))?;

            match self.run_fold(fold, metrics) {
                Ok(outcome) => completed.push(outcome),
                Err(e) => {
                    tracing::error!("Fold {index} failed: {e}");
                    if matches!(e, SegError::Lifecycle { .. }) {
                        return Err(e);
                    }
                    metrics.on_fold_failed(index, &e.to_string())?;
                    if run_fatal(&e) || s.policy == FailurePolicy::Strict {
                        return Err(e);
                    }
                    failed.push((index, e.to_string()));
                }
            }
        }

        let summary = metrics.on_training_end()?;
        tracing::info!(
            "Training finished: {} fold(s) completed, {} failed",
            completed.len(),
            failed.len()
        );
        Ok(RunReport { completed, failed, summary })
    }

    fn enter(&self, fold: usize, phase: FoldPhase) {
        tracing::info!("Fold {fold}: {phase}");
    }

    /// Report write failures are logged and dropped under the
    /// degraded policy.
    fn tolerate_report(&self, result: SegResult<()>) -> SegResult<()> {
        match result {
            Err(e @ SegError::Report { .. }) if self.settings.policy == FailurePolicy::Degraded => {
                tracing::warn!("Continuing without report output: {e}");
                Ok(())
            }
            other => other,
        }
    }

    /// Case-local errors are swallowed under the degraded policy.
    fn isolate(&self, case: &str, e: SegError) -> SegResult<()> {
        if e.is_case_local() && self.settings.policy == FailurePolicy::Degraded {
            tracing::warn!("Skipping case '{case}': {e}");
            Ok(())
        } else {
            Err(e)
        }
    }

    fn case_label(&self, index: usize) -> String {
        self.cases.case_id(index).unwrap_or_else(|_| format!("#{index}"))
    }

    fn run_fold(&self, fold: &Fold, metrics: &mut MetricsAggregator) -> SegResult<FoldOutcome> {
        let s = &self.settings;

        // ── INIT ──────────────────────────────────────────────────────────────
        self.enter(fold.index, FoldPhase::Init);
        tracing::info!(
            "Fold {}: {} train, {} val, {} test cases",
            fold.index, fold.train.len(), fold.val.len(), fold.test.len()
        );
        let mut state  = TrainingState::new(s.epochs, s.steps_per_epoch)?;
        let mut ckpt   = CheckpointManager::new(&s.models_dir, &s.task, fold.index);
        let engine     = StepEngine::new(&s.inference, self.loss);
        let fold_seed  = s.seed.wrapping_add(fold.index as u64);

        // ── TRAIN_VAL_CYCLE ───────────────────────────────────────────────────
        self.factory.scoped(fold.index, |learner| {
            self.enter(fold.index, FoldPhase::TrainValCycle);
            let mut stream = self.batches.train_stream(&fold.train, fold_seed)?;

            while !state.budget_exhausted() {
                let batch = stream
                    .next()
                    .ok_or_else(|| SegError::model("training batch stream ended"))??;
                engine.train_step(&mut state, learner, &batch)?;

                if state.at_epoch_boundary() {
                    self.validate(&engine, &mut state, &*learner, &fold.val)?;
                    let (train_loss, val_loss) = state.close_epoch();
                    let epoch  = state.epoch_index();
                    let update = ckpt.update(&*learner, val_loss, epoch)?;
                    self.tolerate_report(metrics.on_epoch_end(EpochRecord {
                        fold:          fold.index,
                        epoch,
                        train_loss,
                        val_loss,
                        best_val_loss: update.best_loss,
                        learning_rate: learner.learning_rate(),
                        improved:      update.improved,
                    }))?;
                }
            }
            Ok(())
        })?;

        // ── FOLD_TEST_EVAL ────────────────────────────────────────────────────
        self.enter(fold.index, FoldPhase::FoldTestEval);
        let predictor = self.factory.load_predictor(ckpt.best_dir())?;
        let inferer   = SlidingWindowInferer::new(s.inference.clone());

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        for &index in &fold.test {
            match self.evaluate_case(index, fold.index, &inferer, predictor.as_ref()) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let case = self.case_label(index);
                    self.isolate(&case, e)?;
                    skipped.push(case);
                }
            }
        }
        drop(predictor);

        let summary = metrics.on_kfold_end(fold.index, &records, ckpt.best_epoch())?;

        // ── FOLD_DONE ─────────────────────────────────────────────────────────
        self.enter(fold.index, FoldPhase::FoldDone);
        tracing::info!(
            "Fold {}: best epoch {:?} (val_loss={:.4}), {} evaluated, {} skipped",
            fold.index,
            summary.best_epoch,
            ckpt.best_loss(),
            records.len(),
            skipped.len()
        );
        Ok(FoldOutcome {
            fold:          fold.index,
            records,
            skipped_cases: skipped,
            best_epoch:    ckpt.best_epoch(),
            best_val_loss: ckpt.best_loss(),
        })
    }

    /// One validation round over the full held-out set.
    fn validate(
        &self,
        engine:  &StepEngine<'_>,
        state:   &mut TrainingState,
        learner: &dyn Learner,
        val:     &[usize],
    ) -> SegResult<()> {
        state.begin_validation();
        let model = learner.eval_model();
        for &index in val {
            let result = self.cases.load(index).and_then(|case| {
                let mask = one_hot(&case.labels, &self.settings.label_values);
                engine.val_step(state, model.as_ref(), &case.image, &mask)
            });
            if let Err(e) = result {
                self.isolate(&self.case_label(index), e)?;
            }
        }
        if state.val_loss.count() == 0 {
            return Err(SegError::EmptyValidation { step: state.global_step });
        }
        Ok(())
    }

    fn evaluate_case(
        &self,
        index:   usize,
        fold:    usize,
        inferer: &SlidingWindowInferer,
        model:   &dyn SegmentationModel,
    ) -> SegResult<ResultRecord> {
        let case       = self.cases.load(index)?;
        let prediction = inferer.predict(&case.image, &[model])?;
        let values     = self.evaluator.evaluate(&prediction, &case.labels, &case.id)?;

        if let Some(dir) = &self.settings.raw_predictions {
            write_json(&dir.join(format!("{}.json", case.id)), &prediction)
                .map_err(|e| SegError::data(&case.id, format!("raw prediction not saved: {e}")))?;
        }
        tracing::debug!("Fold {fold}: evaluated '{}' {:?}", case.id, values);
        Ok(ResultRecord { case_id: case.id, fold, values })
    }
}
