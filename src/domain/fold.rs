// ============================================================
// Layer 3 — Fold
// ============================================================
// One train / validation / test partition of k-fold
// cross-validation. Indices refer to positions in the
// manifest's training list.
//
//   train ∪ val  = training split of the fold
//   train ∩ test = ∅
//   ⋃ test over all folds = every case exactly once

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub index: usize,
    /// Indices used for gradient steps
    pub train: Vec<usize>,
    /// Held-out subset of the training split, used for checkpoint selection
    pub val:   Vec<usize>,
    /// Held-out cases evaluated with the best checkpoint at fold end
    pub test:  Vec<usize>,
}

impl Fold {
    /// The full training split (train + val), sorted.
    pub fn training_split(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self.train.iter().chain(&self.val).copied().collect();
        all.sort_unstable();
        all
    }
}
