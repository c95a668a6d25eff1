// ============================================================
// Layer 6 — K-Fold Metrics Aggregator
// ============================================================
// Observational bookkeeping for a k-fold run. Owns no training
// decision; the scheduler calls its hooks at fixed lifecycle
// points and it records what happened:
//
//   on_fold_start(k)        — opens fold k, truncates its CSV log
//   on_epoch_end(record)    — one row per epoch, in memory + CSV
//   on_fold_failed(k, why)  — closes fold k without a summary
//   on_kfold_end(k, rows)   — closes fold k with per-case stats
//   on_training_end()       — cross-fold summary, exactly once
//
// Hooks fired out of order (an epoch outside an open fold, a
// fold closed twice, anything after training end) are
// Lifecycle errors. A CSV write failure is a Report error and
// comes after the in-memory state has already advanced, so the
// caller may carry on without the file.
//
// Per-fold CSV log: logs/fold_<k>_metrics.csv
//   epoch,train_loss,val_loss,best_val_loss,learning_rate
//   1,0.912345,0.870000,0.870000,0.000300
//   2,0.801200,0.880000,0.870000,0.000300
//
// Reference: Rust Book §12 (I/O and File Handling)

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::case::{EpochRecord, ResultRecord};
use crate::domain::error::{SegError, SegResult};
use crate::infra::evaluator::{column_stats, Stats};

/// Statistics of one metric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub column: String,
    pub stats:  Option<Stats>,
}

fn summarize(columns: &[String], records: &[ResultRecord]) -> Vec<ColumnSummary> {
    column_stats(columns, records)
        .into_iter()
        .map(|(column, stats)| ColumnSummary { column, stats })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldSummary {
    pub fold:          usize,
    pub epochs:        usize,
    pub best_val_loss: f64,
    pub best_epoch:    Option<usize>,
    pub evaluated:     usize,
    pub metrics:       Vec<ColumnSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldFailure {
    pub fold:  usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossFoldSummary {
    pub folds:    Vec<FoldSummary>,
    pub failed:   Vec<FoldFailure>,
    /// Statistics over every evaluated case of every fold
    pub overall:  Vec<ColumnSummary>,
    /// Mean of the per-fold best validation losses
    pub mean_best_val_loss: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    InFold(usize),
    Finished,
}

// ─── MetricsAggregator ────────────────────────────────────────────────────────
pub struct MetricsAggregator {
    columns:   Vec<String>,
    log_dir:   Option<PathBuf>,
    stage:     Stage,
    epochs:    BTreeMap<usize, Vec<EpochRecord>>,
    summaries: Vec<FoldSummary>,
    failures:  Vec<FoldFailure>,
    records:   Vec<ResultRecord>,
}

impl MetricsAggregator {
    /// `columns` are the per-case metric names; `log_dir` receives
    /// the per-fold CSV logs (None keeps everything in memory).
    pub fn new(columns: Vec<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            columns,
            log_dir,
            stage:     Stage::Idle,
            epochs:    BTreeMap::new(),
            summaries: Vec::new(),
            failures:  Vec::new(),
            records:   Vec::new(),
        }
    }

    fn lifecycle(message: String) -> SegError {
        SegError::Lifecycle { message }
    }

    fn expect_fold(&self, fold: usize, hook: &str) -> SegResult<()> {
        match self.stage {
            Stage::InFold(open) if open == fold => Ok(()),
            other => Err(Self::lifecycle(format!("{hook} for fold {fold} while {other:?}"))),
        }
    }

    fn csv_path(&self, fold: usize) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|d| d.join(format!("fold_{fold}_metrics.csv")))
    }

    pub fn on_fold_start(&mut self, fold: usize) -> SegResult<()> {
        if self.stage != Stage::Idle {
            return Err(Self::lifecycle(format!("fold {fold} started while {:?}", self.stage)));
        }
        if self.epochs.contains_key(&fold) {
            return Err(Self::lifecycle(format!("fold {fold} started twice")));
        }
        self.epochs.insert(fold, Vec::new());
        self.stage = Stage::InFold(fold);
        match self.csv_path(fold) {
            Some(path) => write_header(&path),
            None => Ok(()),
        }
    }

    pub fn on_epoch_end(&mut self, record: EpochRecord) -> SegResult<()> {
        self.expect_fold(record.fold, "on_epoch_end")?;
        tracing::info!(
            "Fold {} epoch {:>3} | train_loss={:.4} | val_loss={:.4} | best={:.4}{}",
            record.fold,
            record.epoch,
            record.train_loss,
            record.val_loss,
            record.best_val_loss,
            if record.improved { " *" } else { "" },
        );
        let path = self.csv_path(record.fold);
        self.epochs.entry(record.fold).or_default().push(record.clone());
        match path {
            Some(path) => append_row(&path, &record),
            None => Ok(()),
        }
    }

    pub fn on_fold_failed(&mut self, fold: usize, error: &str) -> SegResult<()> {
        self.expect_fold(fold, "on_fold_failed")?;
        self.failures.push(FoldFailure { fold, error: error.to_string() });
        self.stage = Stage::Idle;
        Ok(())
    }

    pub fn on_kfold_end(
        &mut self,
        fold:       usize,
        records:    &[ResultRecord],
        best_epoch: Option<usize>,
    ) -> SegResult<FoldSummary> {
        self.expect_fold(fold, "on_kfold_end")?;
        let epochs = self.epochs.get(&fold).map(Vec::as_slice).unwrap_or_default();

        let summary = FoldSummary {
            fold,
            epochs:        epochs.len(),
            best_val_loss: epochs.last().map_or(f64::INFINITY, |e| e.best_val_loss),
            best_epoch,
            evaluated:     records.len(),
            metrics:       summarize(&self.columns, records),
        };
        self.records.extend_from_slice(records);
        self.summaries.push(summary.clone());
        self.stage = Stage::Idle;
        Ok(summary)
    }

    pub fn on_training_end(&mut self) -> SegResult<CrossFoldSummary> {
        if self.stage != Stage::Idle {
            return Err(Self::lifecycle(format!("training ended while {:?}", self.stage)));
        }
        self.stage = Stage::Finished;

        let finite: Vec<f64> = self
            .summaries
            .iter()
            .map(|s| s.best_val_loss)
            .filter(|v| v.is_finite())
            .collect();
        let mean_best_val_loss = (!finite.is_empty()).then(|| finite.iter().sum::<f64>() / finite.len() as f64);

        Ok(CrossFoldSummary {
            folds:    self.summaries.clone(),
            failed:   self.failures.clone(),
            overall:  summarize(&self.columns, &self.records),
            mean_best_val_loss,
        })
    }

    pub fn epoch_log(&self, fold: usize) -> &[EpochRecord] {
        self.epochs.get(&fold).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }
}

fn write_header(path: &Path) -> SegResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SegError::report(parent, e))?;
    }
    let mut f = fs::File::create(path).map_err(|e| SegError::report(path, e))?;
    writeln!(f, "epoch,train_loss,val_loss,best_val_loss,learning_rate")
        .map_err(|e| SegError::report(path, e))
}

fn append_row(path: &Path, r: &EpochRecord) -> SegResult<()> {
    let mut f = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| SegError::report(path, e))?;
    let lr = r.learning_rate.map(|v| format!("{v:.6}")).unwrap_or_default();
    writeln!(f, "{},{:.6},{:.6},{:.6},{}", r.epoch, r.train_loss, r.val_loss, r.best_val_loss, lr)
        .map_err(|e| SegError::report(path, e))
}

/// Write the cross-fold summary as pretty JSON.
pub fn write_summary(path: &Path, summary: &CrossFoldSummary) -> SegResult<()> {
    let json = serde_json::to_string_pretty(summary).map_err(|e| SegError::report(path, e))?;
    fs::write(path, json).map_err(|e| SegError::report(path, e))?;
    tracing::info!("Cross-fold summary written to '{}'", path.display());
    Ok(())
}
