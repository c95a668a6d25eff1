// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types and traits that define what the system
// works with: volumes, folds, cases, result rows, the error
// taxonomy and the collaborator seams.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only structs, enums, traits and small pure helpers
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

/// Manifest entries, loaded cases, result and epoch rows
pub mod case;

/// SegError taxonomy and SegResult alias
pub mod error;

/// Fold partition type
pub mod fold;

/// Collaborator traits the core is written against
pub mod traits;

/// Volume aliases, patch helpers, batches and flip variants
pub mod volume;
