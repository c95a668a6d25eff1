// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates a full k-fold training run in order:
//
//   Step 1: Load the dataset manifest       (Layer 4 - data)
//   Step 2: Load the run config             (Layer 6 - infra)
//   Step 3: Resolve patch, depth, weights   (Layer 5 - ml)
//   Step 4: Partition and check the folds   (Layer 4 - data)
//   Step 5: Build dataset and sampler       (Layer 4 - data)
//   Step 6: Build loss, evaluator, learners (Layer 5 - ml)
//   Step 7: Persist the patch size          (Layer 6 - infra)
//   Step 8: Run the fold scheduler          (Layer 2)
//   Step 9: Write results and summary       (Layer 6 - infra)
//
// Step 2 only reads. Every configuration problem surfaces
// before Step 7, so a bad run never creates or changes the
// shared config file.
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::application::fold_scheduler::{FailurePolicy, FoldScheduler, RunReport, SchedulerSettings};
use crate::data::{
    dataset::CaseDataset,
    loader::{load_manifest, write_json, VolumeLoader},
    sampler::{PatchSampler, SamplerSettings},
    splitter::build_folds,
};
use crate::domain::traits::CaseEvaluator;
use crate::domain::volume::Shape3;
use crate::infra::{
    config_store::ConfigStore,
    evaluator::{DiceEvaluator, ResultsTable},
    metrics::{write_summary, MetricsAggregator},
};
use crate::ml::{
    blender::BlendMode,
    inferencer::InferenceSettings,
    learner::{BurnLearnerFactory, LrSchedule, OptimizerKind, OptimizerSettings, TrainBackend},
    loss::DiceLoss,
    model::{default_depth, SegNetConfig},
};

pub const DEFAULT_PATCH: Shape3 = [64, 64, 64];

/// Name of the resolved training config inside the results directory.
pub const TRAIN_CONFIG_FILE: &str = "train_config.json";

// ─── Training Configuration ──────────────────────────────────────────────────
// All settings of a run. Saved next to the results with every
// optional value resolved, so `predict` can rebuild the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub manifest:                PathBuf,
    pub results_dir:             PathBuf,
    /// Shared run config; defaults to <results_dir>/config.json
    pub config:                  Option<PathBuf>,
    pub nfolds:                  usize,
    /// Empty means every fold
    pub folds:                   Vec<usize>,
    pub epochs:                  usize,
    pub steps_per_epoch:         Option<usize>,
    pub batch_size:              usize,
    pub patch:                   Option<Shape3>,
    pub overlap:                 f64,
    pub blend:                   BlendMode,
    pub tta:                     bool,
    pub val_fraction:            f64,
    pub seed:                    u64,
    pub optimizer:               OptimizerKind,
    pub lr:                      f64,
    pub schedule:                LrSchedule,
    pub grad_clip:               Option<f32>,
    pub init_filters:            usize,
    pub depth:                   Option<usize>,
    pub use_precomputed_weights: bool,
    pub oversample_foreground:   f64,
    pub mirror:                  bool,
    pub policy:                  FailurePolicy,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            manifest:                PathBuf::from("data/dataset.json"),
            results_dir:             PathBuf::from("results"),
            config:                  None,
            nfolds:                  5,
            folds:                   Vec::new(),
            epochs:                  100,
            steps_per_epoch:         None,
            batch_size:              2,
            patch:                   None,
            overlap:                 0.5,
            blend:                   BlendMode::Gaussian,
            tta:                     true,
            val_fraction:            0.1,
            seed:                    42,
            optimizer:               OptimizerKind::Adam,
            lr:                      3e-4,
            schedule:                LrSchedule::Cosine,
            grad_clip:               Some(1.0),
            init_filters:            8,
            depth:                   None,
            use_precomputed_weights: false,
            oversample_foreground:   0.33,
            mirror:                  true,
            policy:                  FailurePolicy::Degraded,
        }
    }
}

impl TrainConfig {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.results_dir.join("config.json"))
    }

    /// Requested folds, or every fold when none were named.
    pub fn selected_folds(&self) -> Vec<usize> {
        if self.folds.is_empty() {
            (0..self.nfolds).collect()
        } else {
            self.folds.clone()
        }
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Execute the full k-fold run end to end on the default GPU
    pub fn execute(&self) -> Result<RunReport> {
        self.execute_on::<TrainBackend>(Default::default())
    }

    pub fn execute_on<B: AutodiffBackend>(&self, device: B::Device) -> Result<RunReport> {
        let cfg = &self.config;

        // ── Step 1: Dataset manifest ─────────────────────────────────────────
        let manifest = load_manifest(&cfg.manifest)
            .with_context(|| format!("Failed to load manifest '{}'", cfg.manifest.display()))?;
        let label_values = manifest.label_values();
        tracing::info!(
            "Task '{}': {} training cases, {} test cases, labels {:?}",
            manifest.task,
            manifest.training.len(),
            manifest.test.len(),
            label_values
        );

        // ── Step 2: Shared run config ────────────────────────────────────────
        let store = ConfigStore::new(cfg.config_path());
        let mut run_cfg = store
            .load_or_default(&manifest)
            .with_context(|| format!("Failed to load run config '{}'", store.path().display()))?;

        // ── Step 3: Resolve derived settings ─────────────────────────────────
        let patch = cfg.patch.or(run_cfg.patch_size).unwrap_or(DEFAULT_PATCH);
        if patch.contains(&0) {
            bail!("Patch size {patch:?} has an empty axis");
        }
        let depth = cfg.depth.unwrap_or_else(|| default_depth(patch));

        let class_weights = if cfg.use_precomputed_weights {
            let weights = run_cfg.class_weights.clone().with_context(|| {
                format!("use_precomputed_weights is set but '{}' has no class_weights", store.path().display())
            })?;
            Some(weights)
        } else {
            None
        };
        let inference = InferenceSettings::new(patch, cfg.overlap, cfg.blend, cfg.tta)
            .context("Invalid inference settings")?;

        // ── Step 4: Folds ────────────────────────────────────────────────────
        // The scheduler partitions again with the same seed; doing it here
        // rejects bad fold settings and sizes the step budget.
        let selected = cfg.selected_folds();
        let folds = build_folds(manifest.training.len(), cfg.nfolds, cfg.val_fraction, cfg.seed)
            .context("Invalid fold settings")?;
        if let Some(bad) = selected.iter().find(|&&f| f >= folds.len()) {
            bail!("Fold {bad} requested but nfolds is {}", cfg.nfolds);
        }
        if let Some(dup) = selected.iter().enumerate().find_map(|(i, f)| selected[..i].contains(f).then_some(f)) {
            bail!("Fold {dup} requested more than once");
        }
        if cfg.batch_size == 0 || cfg.epochs == 0 {
            bail!("batch_size and epochs must both be >= 1");
        }
        let steps_per_epoch = match cfg.steps_per_epoch {
            Some(0)     => bail!("steps_per_epoch must be >= 1"),
            Some(steps) => steps,
            None => {
                let train_len = folds[selected[0]].train.len();
                (train_len / cfg.batch_size).max(1)
            }
        };
        tracing::info!(
            "Patch {:?}, depth {}, {} epochs × {} steps, folds {:?}",
            patch, depth, cfg.epochs, steps_per_epoch, selected
        );

        // ── Step 5: Data pipeline ────────────────────────────────────────────
        let loader  = VolumeLoader::for_manifest(&cfg.manifest);
        let dataset = CaseDataset::new(loader, manifest.training.clone(), label_values.clone());
        let sampler = PatchSampler::new(
            &dataset,
            label_values.clone(),
            SamplerSettings {
                patch,
                batch_size:            cfg.batch_size,
                oversample_foreground: cfg.oversample_foreground,
                mirror:                cfg.mirror,
                skip_bad_cases:        cfg.policy == FailurePolicy::Degraded,
            },
        )
        .context("Invalid sampler settings")?;

        // ── Step 6: Loss, evaluator, learners ────────────────────────────────
        let loss      = DiceLoss::new(class_weights.clone());
        let evaluator = DiceEvaluator::new(manifest.labels.clone());
        let network   = SegNetConfig::new(manifest.modalities.len(), label_values.len())
            .with_init_filters(cfg.init_filters)
            .with_depth(depth);
        let optim = OptimizerSettings {
            kind:          cfg.optimizer,
            learning_rate: cfg.lr,
            schedule:      cfg.schedule,
            grad_clip:     cfg.grad_clip,
        };
        let factory = BurnLearnerFactory::<B>::new(
            network,
            optim,
            class_weights,
            cfg.epochs * steps_per_epoch,
            device,
        );

        // ── Step 7: Persist patch size (once, before any fold) ───────────────
        store
            .persist_patch_size(&mut run_cfg, patch)
            .context("Failed to persist patch size")?;
        let resolved = TrainConfig {
            patch:           Some(patch),
            depth:           Some(depth),
            steps_per_epoch: Some(steps_per_epoch),
            folds:           selected.clone(),
            ..cfg.clone()
        };
        write_json(&cfg.results_dir.join(TRAIN_CONFIG_FILE), &resolved)
            .context("Failed to save training config")?;

        // ── Step 8: K-fold run ───────────────────────────────────────────────
        let settings = SchedulerSettings {
            task:            manifest.task.clone(),
            nfolds:          cfg.nfolds,
            folds:           selected,
            val_fraction:    cfg.val_fraction,
            epochs:          cfg.epochs,
            steps_per_epoch,
            seed:            cfg.seed,
            inference,
            label_values,
            policy:          cfg.policy,
            models_dir:      cfg.results_dir.join("models"),
            raw_predictions: Some(cfg.results_dir.join("predictions").join("train").join("raw")),
        };
        let columns = evaluator.columns();
        let mut metrics = MetricsAggregator::new(columns.clone(), Some(cfg.results_dir.join("logs")));
        let scheduler = FoldScheduler::new(settings, &factory, &dataset, &sampler, &loss, &evaluator);
        let report = scheduler.run(&mut metrics).context("K-fold training aborted")?;

        // ── Step 9: Reported outputs ─────────────────────────────────────────
        let mut table = ResultsTable::new(columns);
        table.extend(report.records().cloned());
        table
            .write_csv(&cfg.results_dir.join("results_run.csv"))
            .context("Failed to write results table")?;
        write_summary(&cfg.results_dir.join("kfold_summary.json"), &report.summary)
            .context("Failed to write cross-fold summary")?;

        for (fold, error) in &report.failed {
            tracing::warn!("Fold {fold} did not complete: {error}");
        }
        Ok(report)
    }
}
