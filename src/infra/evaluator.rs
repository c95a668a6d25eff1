// ============================================================
// Layer 6 — Case Evaluation and Results Table
// ============================================================
// DiceEvaluator turns one full-volume prediction into a row of
// per-label Dice scores:
//
//   labels = argmax over class channels (declared order)
//   dice_l = 2 · |P_l ∩ T_l| / (|P_l| + |T_l|)
//   both P_l and T_l empty → 1.0
//
// ResultsTable collects those rows across every fold and
// writes them as CSV, followed by one summary row per
// statistic:
//
//   case_id,fold,liver,tumour
//   case_003,0,0.912000,0.640000
//   ...
//   mean,,0.905000,0.611000
//   std,,...
//   median,,...
//   25pct,,...
//   75pct,,...
//
// Percentiles interpolate linearly between order statistics;
// std is the population standard deviation.
//
// Reference: Rust Book §12 (I/O and File Handling)

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::case::{LabelSpec, ResultRecord};
use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::CaseEvaluator;
use crate::domain::volume::{argmax_labels, LabelMap, Volume};

// ─── DiceEvaluator ────────────────────────────────────────────────────────────
pub struct DiceEvaluator {
    labels: Vec<LabelSpec>,
}

impl DiceEvaluator {
    /// `labels` in declared channel order, background included.
    pub fn new(labels: Vec<LabelSpec>) -> Self {
        Self { labels }
    }

    fn label_values(&self) -> Vec<i32> {
        self.labels.iter().map(|l| l.value).collect()
    }
}

fn dice(prediction: &LabelMap, truth: &LabelMap, label: i32) -> f64 {
    let mut both  = 0usize;
    let mut total = 0usize;
    for (&p, &t) in prediction.iter().zip(truth.iter()) {
        let (p, t) = (p == label, t == label);
        both  += usize::from(p && t);
        total += usize::from(p) + usize::from(t);
    }
    if total == 0 { 1.0 } else { 2.0 * both as f64 / total as f64 }
}

impl CaseEvaluator for DiceEvaluator {
    fn columns(&self) -> Vec<String> {
        self.labels
            .iter()
            .filter(|l| l.value != 0)
            .map(|l| l.name.clone())
            .collect()
    }

    fn evaluate(
        &self,
        prediction: &Volume,
        truth:      &LabelMap,
        case_id:    &str,
    ) -> SegResult<Vec<(String, f64)>> {
        let predicted = argmax_labels(prediction, &self.label_values())?;
        if predicted.dim() != truth.dim() {
            return Err(SegError::shape(format!(
                "case '{case_id}': prediction {:?} and truth {:?} differ",
                predicted.dim(),
                truth.dim()
            )));
        }
        Ok(self
            .labels
            .iter()
            .filter(|l| l.value != 0)
            .map(|l| (l.name.clone(), dice(&predicted, truth, l.value)))
            .collect())
    }
}

// ─── Summary statistics ───────────────────────────────────────────────────────
/// Names of the summary rows appended to the results table.
pub const STAT_ROWS: [&str; 5] = ["mean", "std", "median", "25pct", "75pct"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub mean:   f64,
    pub std:    f64,
    pub median: f64,
    pub p25:    f64,
    pub p75:    f64,
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos  = q * (sorted.len() - 1) as f64;
    let lo   = pos.floor() as usize;
    let hi   = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

impl Stats {
    /// Statistics over the finite entries of `values`; None if there are none.
    pub fn of(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);
        let n    = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let var  = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std:    var.sqrt(),
            median: percentile(&sorted, 0.5),
            p25:    percentile(&sorted, 0.25),
            p75:    percentile(&sorted, 0.75),
        })
    }

    /// Values in `STAT_ROWS` order.
    fn rows(&self) -> [f64; 5] {
        [self.mean, self.std, self.median, self.p25, self.p75]
    }
}

/// Per-column statistics over `records`, in `columns` order.
pub fn column_stats(columns: &[String], records: &[ResultRecord]) -> Vec<(String, Option<Stats>)> {
    columns
        .iter()
        .map(|col| {
            let values: Vec<f64> = records.iter().filter_map(|r| r.value(col)).collect();
            (col.clone(), Stats::of(&values))
        })
        .collect()
}

// ─── ResultsTable ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct ResultsTable {
    columns: Vec<String>,
    records: Vec<ResultRecord>,
}

impl ResultsTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, records: Vec::new() }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = ResultRecord>) {
        self.records.extend(records);
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn stats(&self) -> Vec<(String, Option<Stats>)> {
        column_stats(&self.columns, &self.records)
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "case_id,fold,{}", self.columns.join(","));

        for r in &self.records {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|c| r.value(c).map(|v| format!("{v:.6}")).unwrap_or_default())
                .collect();
            let _ = writeln!(out, "{},{},{}", r.case_id, r.fold, cells.join(","));
        }

        let stats = self.stats();
        for (row, name) in STAT_ROWS.iter().enumerate() {
            let cells: Vec<String> = stats
                .iter()
                .map(|(_, s)| s.map(|s| format!("{:.6}", s.rows()[row])).unwrap_or_default())
                .collect();
            let _ = writeln!(out, "{name},,{}", cells.join(","));
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> SegResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SegError::report(parent, e))?;
        }
        fs::write(path, self.to_csv()).map_err(|e| SegError::report(path, e))?;
        tracing::info!("Results table ({} cases) written to '{}'", self.records.len(), path.display());
        Ok(())
    }
}
