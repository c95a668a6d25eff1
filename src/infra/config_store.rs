// ============================================================
// Layer 6 — Run Configuration Store
// ============================================================
// The shared configuration file of a task:
//
//   {
//     "labels":        [{"value": 0, "name": "background"}, ...],
//     "patch_size":    [64, 64, 64],
//     "class_weights": [0.1, 0.9]
//   }
//
// When missing it is derived from the manifest in memory only;
// a stored one is checked against the manifest's label set. The
// file is first written when the patch size actually used is
// saved, once, before the first fold trains. Every write
// goes to `<file>.tmp` first and is then renamed over the
// original, so readers never see a half-written file.
//
// Reference: serde_json documentation
//            Rust Book §9 (Error Handling)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::case::{DatasetManifest, LabelSpec};
use crate::domain::error::{SegError, SegResult};
use crate::domain::volume::Shape3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub labels:        Vec<LabelSpec>,
    #[serde(default)]
    pub patch_size:    Option<Shape3>,
    #[serde(default)]
    pub class_weights: Option<Vec<f32>>,
}

impl RunConfig {
    pub fn from_manifest(manifest: &DatasetManifest) -> Self {
        Self {
            labels:        manifest.labels.clone(),
            patch_size:    None,
            class_weights: None,
        }
    }

    /// Same label values and names, in the same order.
    pub fn check_labels(&self, manifest: &DatasetManifest) -> SegResult<()> {
        if self.labels != manifest.labels {
            return Err(SegError::config(format!(
                "label set mismatch: config declares {:?}, manifest declares {:?}",
                self.labels.iter().map(|l| l.value).collect::<Vec<_>>(),
                manifest.label_values()
            )));
        }
        if let Some(w) = &self.class_weights {
            if w.len() != self.labels.len() {
                return Err(SegError::config(format!(
                    "{} class weights for {} labels",
                    w.len(),
                    self.labels.len()
                )));
            }
        }
        if let Some(p) = self.patch_size {
            if p.contains(&0) {
                return Err(SegError::config(format!("patch_size {p:?} has an empty axis")));
            }
        }
        Ok(())
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored config, or derive one from `manifest`
    /// without writing anything.
    pub fn load_or_default(&self, manifest: &DatasetManifest) -> SegResult<RunConfig> {
        if !self.path.exists() {
            tracing::info!("No config at '{}', starting from the manifest", self.path.display());
            return Ok(RunConfig::from_manifest(manifest));
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| SegError::config(format!("cannot read '{}': {e}", self.path.display())))?;
        let cfg: RunConfig = serde_json::from_str(&text)
            .map_err(|e| SegError::config(format!("cannot parse '{}': {e}", self.path.display())))?;
        cfg.check_labels(manifest)?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &RunConfig) -> SegResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SegError::checkpoint(parent, e))?;
        }
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let json = serde_json::to_string_pretty(cfg).map_err(|e| SegError::checkpoint(&tmp, e))?;
        fs::write(&tmp, json).map_err(|e| SegError::checkpoint(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| SegError::checkpoint(&self.path, e))
    }

    /// Record the patch size the run trains with.
    pub fn persist_patch_size(&self, cfg: &mut RunConfig, patch: Shape3) -> SegResult<()> {
        cfg.patch_size = Some(patch);
        self.save(cfg)?;
        tracing::info!("Patch size {:?} saved to '{}'", patch, self.path.display());
        Ok(())
    }
}
