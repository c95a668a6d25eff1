// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Keeps two snapshot slots per fold:
//
//   models/
//     best/<task>_fold_<k>/   ← lowest validation loss so far
//     last/<task>_fold_<k>/   ← most recent epoch boundary
//
// update() runs once per epoch boundary:
//   - always rewrites `last`
//   - rewrites `best` only when val_loss < best_loss
//     (strict: a tie keeps the earlier epoch)
//
// Every slot write goes through a sibling `<slot>.partial`
// directory:
//   1. fresh `<slot>.partial`
//   2. snapshot written into it
//   3. old `<slot>` removed
//   4. `<slot>.partial` renamed to `<slot>`
// A failed snapshot leaves the previous slot untouched and no
// partial directory behind.
//
// Reference: Burn Book §5 (Records and Checkpointing)
//            Rust Book §9 (Error Handling)

use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::Persist;

/// Slot directory for `fold` of `task` under `models/<kind>/`.
pub fn slot_dir(models_dir: &Path, kind: &str, task: &str, fold: usize) -> PathBuf {
    models_dir.join(kind).join(format!("{task}_fold_{fold}"))
}

/// Outcome of one epoch-boundary update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointUpdate {
    pub improved:  bool,
    pub best_loss: f64,
}

pub struct CheckpointManager {
    best_dir:   PathBuf,
    last_dir:   PathBuf,
    best_loss:  f64,
    best_epoch: Option<usize>,
}

impl CheckpointManager {
    pub fn new(models_dir: &Path, task: &str, fold: usize) -> Self {
        Self {
            best_dir:   slot_dir(models_dir, "best", task, fold),
            last_dir:   slot_dir(models_dir, "last", task, fold),
            best_loss:  f64::INFINITY,
            best_epoch: None,
        }
    }

    pub fn update<P: Persist + ?Sized>(
        &mut self,
        model:    &P,
        val_loss: f64,
        epoch:    usize,
    ) -> SegResult<CheckpointUpdate> {
        write_slot(&self.last_dir, model)?;

        let improved = val_loss < self.best_loss;
        if improved {
            write_slot(&self.best_dir, model)?;
            tracing::info!(
                "New best checkpoint at epoch {epoch}: {:.6} → {:.6}",
                self.best_loss, val_loss
            );
            self.best_loss  = val_loss;
            self.best_epoch = Some(epoch);
        }
        Ok(CheckpointUpdate { improved, best_loss: self.best_loss })
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn best_dir(&self) -> &Path {
        &self.best_dir
    }

    pub fn last_dir(&self) -> &Path {
        &self.last_dir
    }
}

fn partial_dir(slot: &Path) -> PathBuf {
    let mut name = slot.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    slot.with_file_name(name)
}

fn write_slot<P: Persist + ?Sized>(slot: &Path, model: &P) -> SegResult<()> {
    let partial = partial_dir(slot);
    if partial.exists() {
        fs::remove_dir_all(&partial).map_err(|e| SegError::checkpoint(&partial, e))?;
    }
    fs::create_dir_all(&partial).map_err(|e| SegError::checkpoint(&partial, e))?;

    if let Err(e) = model.save_snapshot(&partial) {
        // best effort: the save error is the one worth reporting
        let _ = fs::remove_dir_all(&partial);
        return Err(e);
    }

    if slot.exists() {
        fs::remove_dir_all(slot).map_err(|e| SegError::checkpoint(slot, e))?;
    }
    fs::rename(&partial, slot).map_err(|e| SegError::checkpoint(slot, e))?;
    tracing::debug!("Wrote checkpoint '{}'", slot.display());
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Writes the epoch it was given into `snapshot.txt`.
    struct Tagged {
        epoch: Cell<usize>,
        fail:  bool,
    }

    impl Persist for Tagged {
        fn save_snapshot(&self, dir: &Path) -> SegResult<()> {
            fs::write(dir.join("snapshot.txt"), self.epoch.get().to_string())
                .map_err(|e| SegError::checkpoint(dir, e))?;
            if self.fail {
                return Err(SegError::checkpoint(dir, "disk full"));
            }
            Ok(())
        }
    }

    fn read_tag(dir: &Path) -> String {
        fs::read_to_string(dir.join("snapshot.txt")).unwrap()
    }

    #[test]
    fn test_best_loss_sequence_and_best_epoch() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(tmp.path(), "Liver", 0);
        let model = Tagged { epoch: Cell::new(0), fail: false };

        let mut best = Vec::new();
        for (i, loss) in [0.9, 0.5, 0.7, 0.3, 0.6].into_iter().enumerate() {
            model.epoch.set(i + 1);
            best.push(mgr.update(&model, loss, i + 1).unwrap().best_loss);
        }
        assert_eq!(best, vec![0.9, 0.5, 0.5, 0.3, 0.3]);
        assert_eq!(mgr.best_epoch(), Some(4));
        assert_eq!(read_tag(mgr.best_dir()), "4");
        assert_eq!(read_tag(mgr.last_dir()), "5");
        assert!(mgr.best_dir().ends_with("best/Liver_fold_0"));
    }

    #[test]
    fn test_tie_keeps_first_best() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(tmp.path(), "T", 1);
        let model = Tagged { epoch: Cell::new(1), fail: false };

        assert!(mgr.update(&model, 0.5, 1).unwrap().improved);
        model.epoch.set(2);
        assert!(!mgr.update(&model, 0.5, 2).unwrap().improved);
        assert_eq!(read_tag(mgr.best_dir()), "1");
        assert_eq!(read_tag(mgr.last_dir()), "2");
        assert_eq!(mgr.best_epoch(), Some(1));
    }

    #[test]
    fn test_failed_save_leaves_previous_slot_and_no_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(tmp.path(), "T", 0);
        let good = Tagged { epoch: Cell::new(1), fail: false };
        mgr.update(&good, 0.8, 1).unwrap();

        let bad = Tagged { epoch: Cell::new(2), fail: true };
        let err = mgr.update(&bad, 0.1, 2).unwrap_err();
        assert!(matches!(err, SegError::CheckpointIo { .. }));

        assert_eq!(read_tag(mgr.best_dir()), "1");
        assert_eq!(read_tag(mgr.last_dir()), "1");
        assert!(!partial_dir(mgr.last_dir()).exists());
        assert_eq!(mgr.best_loss(), 0.8);
    }

    #[test]
    fn test_nan_loss_never_becomes_best() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(tmp.path(), "T", 0);
        let model = Tagged { epoch: Cell::new(1), fail: false };
        assert!(!mgr.update(&model, f64::NAN, 1).unwrap().improved);
        assert!(!mgr.best_dir().exists());
        assert!(mgr.last_dir().exists());
    }
}
