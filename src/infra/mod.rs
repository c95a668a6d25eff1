// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything that persists or reports, kept out of the
// orchestration core:
//
//   checkpoint.rs   — best / last snapshot slots per fold,
//                     strict less-than best selection,
//                     write-then-rename slot directories
//
//   metrics.rs      — K-fold metrics aggregator: lifecycle
//                     hooks, per-fold epoch CSV logs and the
//                     cross-fold summary
//
//   evaluator.rs    — Per-label Dice evaluation and the
//                     aggregated results table with summary
//                     statistic rows
//
//   config_store.rs — The shared run configuration file
//                     (labels, patch size, class weights)
//
// Reference: Rust Book §7 (Modules)
//            Rust Book §9 (Error Handling)

/// Best / last checkpoint slots
pub mod checkpoint;

/// Shared run configuration file
pub mod config_store;

/// Per-case evaluation and results table
pub mod evaluator;

/// K-fold metrics lifecycle and CSV logs
pub mod metrics;
