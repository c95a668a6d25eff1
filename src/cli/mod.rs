// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction, parsed with `clap`.
// All work is delegated to Layer 2 (application).
//
// Two commands are supported:
//   1. `train`   — k-fold training, fold test evaluation,
//                  results table and cross-fold summary
//   2. `predict` — ensemble of every fold's best model over
//                  the manifest's test cases
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, PredictArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "seg-kfold",
    version = "0.1.0",
    about = "K-fold training and sliding-window inference for volumetric segmentation."
)]
pub struct Cli {
    /// The subcommand to run (train or predict)
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Route the subcommand to its use case; nothing is computed here.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)   => run_train(args),
            Commands::Predict(args) => run_predict(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!("Starting k-fold training from manifest: {}", args.manifest.display());
    let results_dir = args.results_dir.clone();

    let report = TrainUseCase::new(args.into()).execute()?;

    println!(
        "Training complete: {} fold(s) finished, {} failed, {} cases evaluated.",
        report.completed.len(),
        report.failed.len(),
        report.records().count()
    );
    if let Some(loss) = report.summary.mean_best_val_loss {
        println!("Mean best validation loss: {loss:.4}");
    }
    println!("Results written to {}", results_dir.display());
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    use crate::application::predict_use_case::PredictUseCase;

    let report = PredictUseCase::new(args.into()).execute()?;

    println!(
        "Predicted {} case(s) with folds {:?}; {} skipped.",
        report.written.len(),
        report.folds,
        report.skipped.len()
    );
    Ok(())
}
