// ============================================================
// Layer 2 — PredictUseCase
// ============================================================
// Test-set inference with the whole cross-validation ensemble:
//
//   Step 1: Reload the resolved training config   (Layer 4)
//   Step 2: Load the manifest's test cases        (Layer 4)
//   Step 3: Reload every fold's best snapshot     (Layer 5)
//   Step 4: Sliding-window predict each case with
//           all folds at once (TTA on by default) (Layer 5)
//   Step 5: Argmax → label map in declared label
//           order → predictions/test/<case>.json  (Layer 4)
//
// Folds without a best snapshot are left out of the ensemble;
// no snapshot at all is an EmptyEnsemble error.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::application::fold_scheduler::FailurePolicy;
use crate::application::train_use_case::{TrainConfig, TRAIN_CONFIG_FILE};
use crate::data::loader::{load_manifest, read_json, write_json, VolumeLoader};
use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::{LearnerFactory, SegmentationModel};
use crate::domain::volume::argmax_labels;
use crate::infra::checkpoint::slot_dir;
use crate::ml::{
    inferencer::{InferenceSettings, SlidingWindowInferer},
    learner::{BurnLearnerFactory, OptimizerSettings, TrainBackend},
    model::SegNetConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictConfig {
    pub results_dir: PathBuf,
    /// Overrides the manifest the model was trained on
    pub manifest:    Option<PathBuf>,
    pub tta:         bool,
    pub policy:      FailurePolicy,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            manifest:    None,
            tta:         true,
            policy:      FailurePolicy::Degraded,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PredictReport {
    pub folds:   Vec<usize>,
    pub written: Vec<PathBuf>,
    pub skipped: Vec<String>,
}

pub struct PredictUseCase {
    config: PredictConfig,
}

impl PredictUseCase {
    pub fn new(config: PredictConfig) -> Self {
        Self { config }
    }

    /// Predict every test case on the default GPU
    pub fn execute(&self) -> Result<PredictReport> {
        self.execute_on::<TrainBackend>(Default::default())
    }

    pub fn execute_on<B: AutodiffBackend>(&self, device: B::Device) -> Result<PredictReport> {
        let cfg = &self.config;

        // ── Step 1: Training config ──────────────────────────────────────────
        let train_path = cfg.results_dir.join(TRAIN_CONFIG_FILE);
        let train: TrainConfig = read_json(&train_path)
            .with_context(|| format!("Failed to read '{}' (has this run been trained?)", train_path.display()))?;

        // ── Step 2: Manifest ─────────────────────────────────────────────────
        let manifest_path = cfg.manifest.clone().unwrap_or_else(|| train.manifest.clone());
        let manifest = load_manifest(&manifest_path)
            .with_context(|| format!("Failed to load manifest '{}'", manifest_path.display()))?;
        let label_values = manifest.label_values();

        let patch = train.patch.context("Training config has no resolved patch size")?;
        let depth = train.depth.context("Training config has no resolved depth")?;
        let settings = InferenceSettings::new(patch, train.overlap, train.blend, cfg.tta)
            .context("Invalid inference settings")?;

        // ── Step 3: Ensemble ─────────────────────────────────────────────────
        let network = SegNetConfig::new(manifest.modalities.len(), label_values.len())
            .with_init_filters(train.init_filters)
            .with_depth(depth);
        let optim = OptimizerSettings {
            kind:          train.optimizer,
            learning_rate: train.lr,
            schedule:      train.schedule,
            grad_clip:     train.grad_clip,
        };
        let factory = BurnLearnerFactory::<B>::new(network, optim, None, 1, device);

        let models_dir = cfg.results_dir.join("models");
        let mut folds  = Vec::new();
        let mut models: Vec<Box<dyn SegmentationModel>> = Vec::new();
        for fold in 0..train.nfolds {
            let dir = slot_dir(&models_dir, "best", &manifest.task, fold);
            if !dir.exists() {
                tracing::warn!("Fold {fold}: no best snapshot at '{}', left out", dir.display());
                continue;
            }
            let model = factory
                .load_predictor(&dir)
                .with_context(|| format!("Failed to load fold {fold} snapshot"))?;
            models.push(model);
            folds.push(fold);
        }
        if models.is_empty() {
            return Err(SegError::EmptyEnsemble).context("No fold has a best snapshot");
        }
        let ensemble: Vec<&dyn SegmentationModel> = models.iter().map(|m| m.as_ref()).collect();
        tracing::info!("Predicting {} test cases with folds {:?}", manifest.test.len(), folds);

        // ── Step 4/5: Predict and write label maps ───────────────────────────
        let inferer = SlidingWindowInferer::new(settings);
        let loader  = VolumeLoader::for_manifest(&manifest_path);
        let out_dir = cfg.results_dir.join("predictions").join("test");

        let mut report = PredictReport { folds, ..Default::default() };
        for case in &manifest.test {
            let path = out_dir.join(format!("{}.json", case.id));
            let result: SegResult<()> = loader.load_image(case).and_then(|image| {
                let prediction = inferer.predict(&image, &ensemble)?;
                let labels     = argmax_labels(&prediction, &label_values)?;
                write_json(&path, &labels)
            });

            match result {
                Ok(()) => {
                    tracing::info!("Wrote '{}'", path.display());
                    report.written.push(path);
                }
                Err(e) if e.is_case_local() && cfg.policy == FailurePolicy::Degraded => {
                    tracing::warn!("Skipping test case '{}': {e}", case.id);
                    report.skipped.push(case.id.clone());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Prediction failed for '{}'", case.id));
                }
            }
        }
        Ok(report)
    }
}
