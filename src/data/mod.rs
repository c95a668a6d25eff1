// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// This layer handles everything from JSON volumes on disk
// to stacked training batches.
//
// The pipeline flows in this order:
//
//   dataset.json manifest
//       │
//       ▼
//   splitter          → k-fold test sets, train / val split
//       │
//       ▼
//   VolumeLoader      → reads modality + label JSON arrays
//       │
//       ▼
//   CaseDataset       → implements CaseSource (whole cases,
//       │               used for validation and fold tests)
//       ▼
//   PatchSampler      → implements BatchStreamFactory
//       │               (random patches, infinite, seeded,
//       │                checked into a Batch)
//       ▼
//   PatchBatcher      → Burn Batcher, stacks a Batch into
//                       device tensors for the learner
//
// Each module is responsible for exactly one step.
//
// Reference: Rust Book §13 (Iterators and Closures)

/// Burn Batcher from patch samples to device tensors
pub mod batcher;

/// Implements CaseSource over the manifest's cases
pub mod dataset;

/// Reads and writes JSON volumes and the manifest
pub mod loader;

/// Seeded random patch stream
pub mod sampler;

/// K-fold and train/validation splits
pub mod splitter;
