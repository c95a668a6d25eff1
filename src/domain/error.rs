// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// Every failure the core can produce, as one typed enum.
// The application layer wraps these in anyhow with context;
// the fold scheduler matches on them to decide whether a
// failure is local to one case, fatal for a fold, or fatal
// for the whole run.
//
//   Configuration      → run-fatal, raised before any fold
//   Shape / Data       → case-local (skip or abort per policy)
//   EmptyEnsemble      → always fatal, orchestration bug
//   CheckpointIo       → fold-fatal
//   NumericInstability → fold-fatal
//   EmptyValidation    → fold-fatal, no val case survived
//   Report             → results/log file write, per policy
//   UncoveredVoxel     → blender invariant violation
//   Model              → collaborator failure, fold-fatal
//   Lifecycle          → metrics hooks fired out of order

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegError {
    /// Malformed or missing configuration values.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A volume smaller than the patch, or mismatched channels/shapes.
    #[error("shape error: {message}")]
    Shape { message: String },

    /// Inference was asked to run without any model.
    #[error("inference invoked with an empty model ensemble")]
    EmptyEnsemble,

    /// Snapshot save/load failure.
    #[error("checkpoint I/O failed at '{}': {message}", path.display())]
    CheckpointIo { path: PathBuf, message: String },

    /// Loss became NaN or infinite.
    #[error("non-finite loss {loss} at global step {step}")]
    NumericInstability { step: usize, loss: f64 },

    /// Every case of a validation round was skipped.
    #[error("validation round at step {step} produced no loss: every validation case was skipped")]
    EmptyValidation { step: usize },

    /// Writing a results, log or prediction file failed.
    #[error("report write failed at '{}': {message}", path.display())]
    Report { path: PathBuf, message: String },

    /// A voxel received zero accumulated blend weight.
    #[error("voxel {position:?} was not covered by any patch")]
    UncoveredVoxel { position: [usize; 3] },

    /// Case data could not be read or decoded.
    #[error("data error for '{case}': {message}")]
    Data { case: String, message: String },

    /// The model collaborator failed.
    #[error("model error: {message}")]
    Model { message: String },

    /// A metrics lifecycle hook fired out of order.
    #[error("lifecycle error: {message}")]
    Lifecycle { message: String },
}

pub type SegResult<T> = std::result::Result<T, SegError>;

impl SegError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape { message: message.into() }
    }

    pub fn data(case: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Data { case: case.into(), message: message.into() }
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::Model { message: message.into() }
    }

    pub fn checkpoint(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::CheckpointIo { path: path.into(), message: message.to_string() }
    }

    pub fn report(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Report { path: path.into(), message: message.to_string() }
    }

    /// True for failures confined to a single case.
    /// The scheduler may skip such a case and carry on.
    pub fn is_case_local(&self) -> bool {
        matches!(self, Self::Shape { .. } | Self::Data { .. })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_local_classification() {
        assert!(SegError::shape("too small").is_case_local());
        assert!(SegError::data("case_0", "truncated").is_case_local());
        assert!(!SegError::EmptyEnsemble.is_case_local());
        assert!(!SegError::NumericInstability { step: 3, loss: f64::NAN }.is_case_local());
        assert!(!SegError::checkpoint("/tmp/x", "disk full").is_case_local());
        assert!(!SegError::report("/tmp/x.csv", "disk full").is_case_local());
        assert!(!SegError::EmptyValidation { step: 10 }.is_case_local());
    }

    #[test]
    fn test_messages_name_the_problem() {
        let e = SegError::UncoveredVoxel { position: [1, 2, 3] };
        assert_eq!(e.to_string(), "voxel [1, 2, 3] was not covered by any patch");

        let e = SegError::checkpoint("models/best", "permission denied");
        assert!(e.to_string().contains("models/best"));

        let e = SegError::EmptyValidation { step: 20 };
        assert!(e.to_string().contains("validation round at step 20"));
    }
}
