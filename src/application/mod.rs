// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer wires the other layers together for one goal
// (train every fold, or predict the test set).
//
// Rules for this layer:
//   - No tensor math here; Burn only appears as the backend
//     type parameter the use cases are run on
//   - No argument parsing or printing (that's Layer 1)
//   - File formats belong to Layers 4 and 6
//   - Only workflow coordination
//
// fold_scheduler.rs is the per-fold state machine; the use
// cases build its collaborators and write the reports.
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// The per-fold INIT → TRAIN_VAL_CYCLE → FOLD_TEST_EVAL → FOLD_DONE machine
pub mod fold_scheduler;

// The k-fold training workflow
pub mod train_use_case;

// The test-set ensemble prediction workflow
pub mod predict_use_case;

// Toy on-disk dataset shared by the use case tests
#[cfg(test)]
pub(crate) mod fixtures;
