// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands, `train` and `predict`, and all
// their configurable flags.
//
// clap's derive macros generate:
//   - help text (--help)
//   - error messages for missing args
//   - type conversion (string → usize, f64, enums via FromStr)
//
// Reference: Rust Book §12 (Building a CLI Program)

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::application::fold_scheduler::FailurePolicy;
use crate::application::predict_use_case::PredictConfig;
use crate::application::train_use_case::TrainConfig;
use crate::domain::volume::Shape3;
use crate::ml::blender::BlendMode;
use crate::ml::learner::{LrSchedule, OptimizerKind};

/// "z,y,x" → [z, y, x]
fn parse_shape(s: &str) -> Result<Shape3, String> {
    let axes = s
        .split(',')
        .map(|v| v.trim().parse::<usize>().map_err(|e| format!("'{v}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match axes[..] {
        [z, y, x] => Ok([z, y, x]),
        _ => Err(format!("expected three comma-separated sizes, got {}", axes.len())),
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train one model per fold with k-fold cross-validation
    Train(TrainArgs),

    /// Predict the manifest's test cases with every fold's best model
    Predict(PredictArgs),
}

/// All arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Dataset manifest (JSON); image paths are relative to it
    #[arg(long, default_value = "data/dataset.json")]
    pub manifest: PathBuf,

    /// Where models, logs, predictions and reports are written
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,

    /// Shared run config file [default: <results-dir>/config.json]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of folds the training cases are split into
    #[arg(long, default_value_t = 5)]
    pub nfolds: usize,

    /// Run only these folds (comma separated), e.g. --folds 0,2
    #[arg(long, value_delimiter = ',')]
    pub folds: Vec<usize>,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    /// Optimizer steps per epoch [default: training cases / batch size]
    #[arg(long)]
    pub steps_per_epoch: Option<usize>,

    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,

    /// Patch size z,y,x [default: from config, else 64,64,64]
    #[arg(long, value_parser = parse_shape)]
    pub patch: Option<Shape3>,

    /// Fraction of a patch shared by neighbouring windows, in [0, 1)
    #[arg(long, default_value_t = 0.5)]
    pub overlap: f64,

    /// Patch weighting when blending: constant | gaussian
    #[arg(long, default_value_t = BlendMode::Gaussian)]
    pub blend: BlendMode,

    /// Disable mirrored test-time augmentation for fold test evaluation
    #[arg(long)]
    pub no_tta: bool,

    /// Fraction of each fold's training cases held out for validation
    #[arg(long, default_value_t = 0.1)]
    pub val_fraction: f64,

    /// Seed for fold partitioning, validation split and patch sampling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// adam | sgd
    #[arg(long, default_value_t = OptimizerKind::Adam)]
    pub optimizer: OptimizerKind,

    #[arg(long, default_value_t = 3e-4)]
    pub lr: f64,

    /// Learning-rate schedule over a fold's steps: constant | cosine
    #[arg(long, default_value_t = LrSchedule::Cosine)]
    pub schedule: LrSchedule,

    /// Clip gradients to this L2 norm (0 disables clipping)
    #[arg(long, default_value_t = 1.0)]
    pub grad_clip: f32,

    /// Feature maps of every convolution
    #[arg(long, default_value_t = 8)]
    pub init_filters: usize,

    /// Dilated blocks [default: derived from the patch size]
    #[arg(long)]
    pub depth: Option<usize>,

    /// Weight the loss with the class_weights of the run config
    #[arg(long)]
    pub use_precomputed_weights: bool,

    /// Probability that a training patch is centred on foreground
    #[arg(long, default_value_t = 0.33)]
    pub oversample_foreground: f64,

    /// Disable random mirroring of training patches
    #[arg(long)]
    pub no_mirror: bool,

    /// degraded: skip bad cases and failed folds; strict: abort the run
    #[arg(long, default_value_t = FailurePolicy::Degraded)]
    pub policy: FailurePolicy,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            manifest:                a.manifest,
            results_dir:             a.results_dir,
            config:                  a.config,
            nfolds:                  a.nfolds,
            folds:                   a.folds,
            epochs:                  a.epochs,
            steps_per_epoch:         a.steps_per_epoch,
            batch_size:              a.batch_size,
            patch:                   a.patch,
            overlap:                 a.overlap,
            blend:                   a.blend,
            tta:                     !a.no_tta,
            val_fraction:            a.val_fraction,
            seed:                    a.seed,
            optimizer:               a.optimizer,
            lr:                      a.lr,
            schedule:                a.schedule,
            grad_clip:               (a.grad_clip > 0.0).then_some(a.grad_clip),
            init_filters:            a.init_filters,
            depth:                   a.depth,
            use_precomputed_weights: a.use_precomputed_weights,
            oversample_foreground:   a.oversample_foreground,
            mirror:                  !a.no_mirror,
            policy:                  a.policy,
        }
    }
}

/// All arguments for the `predict` command
#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Results directory of a finished training run
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,

    /// Manifest whose test cases are predicted [default: the training manifest]
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Disable mirrored test-time augmentation
    #[arg(long)]
    pub no_tta: bool,

    /// degraded: skip unreadable cases; strict: abort
    #[arg(long, default_value_t = FailurePolicy::Degraded)]
    pub policy: FailurePolicy,
}

impl From<PredictArgs> for PredictConfig {
    fn from(a: PredictArgs) -> Self {
        PredictConfig {
            results_dir: a.results_dir,
            manifest:    a.manifest,
            tta:         !a.no_tta,
            policy:      a.policy,
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(subcommand)]
        command: Commands,
    }

    fn train(args: &[&str]) -> TrainConfig {
        let argv = ["seg-kfold", "train"].iter().chain(args).copied();
        match Harness::parse_from(argv).command {
            Commands::Train(a) => a.into(),
            other => panic!("expected train, got {other:?}"),
        }
    }

    #[test]
    fn test_train_defaults() {
        let cfg = train(&[]);
        assert_eq!(cfg.nfolds, 5);
        assert!(cfg.folds.is_empty());
        assert_eq!(cfg.patch, None);
        assert_eq!(cfg.val_fraction, 0.1);
        assert_eq!(cfg.grad_clip, Some(1.0));
        assert!(cfg.tta && cfg.mirror);
        assert_eq!(cfg.policy, FailurePolicy::Degraded);
        assert_eq!(cfg.config_path(), PathBuf::from("results/config.json"));
    }

    #[test]
    fn test_train_flags() {
        let cfg = train(&[
            "--folds", "0,2", "--patch", "32,48,64", "--optimizer", "sgd",
            "--schedule", "constant", "--blend", "constant", "--grad-clip", "0",
            "--policy", "strict", "--no-tta",
        ]);
        assert_eq!(cfg.selected_folds(), vec![0, 2]);
        assert_eq!(cfg.patch, Some([32, 48, 64]));
        assert_eq!(cfg.optimizer, OptimizerKind::Sgd);
        assert_eq!(cfg.schedule, LrSchedule::Constant);
        assert_eq!(cfg.blend, BlendMode::Constant);
        assert_eq!(cfg.grad_clip, None);
        assert_eq!(cfg.policy, FailurePolicy::Strict);
        assert!(!cfg.tta);
    }

    #[test]
    fn test_patch_needs_three_axes() {
        let argv = ["seg-kfold", "train", "--patch", "32,48"];
        assert!(Harness::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_predict_args() {
        let argv = ["seg-kfold", "predict", "--results-dir", "out", "--no-tta"];
        let Commands::Predict(a) = Harness::parse_from(argv).command else {
            panic!("expected predict");
        };
        let cfg: PredictConfig = a.into();
        assert_eq!(cfg.results_dir, PathBuf::from("out"));
        assert!(!cfg.tta);
        assert_eq!(cfg.manifest, None);
    }
}
