// ============================================================
// Layer 4 — Volume Loader
// ============================================================
// Reads and writes volumes as serde_json-encoded ndarray
// arrays:
//
//   {"v": 1, "dim": [z, y, x], "data": [...]}
//
// Image modalities are stored one file per modality and
// stacked into a [modality, z, y, x] Volume on load. Label
// maps are stored as integer [z, y, x] arrays.
//
// Manifest paths are resolved relative to the manifest's own
// directory, so a dataset folder can be moved as a whole.
//
// Reference: serde_json / ndarray serde documentation
//            Rust Book §9 (Error Handling)

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{stack, Array3, ArrayView3, Axis};
use serde::{de::DeserializeOwned, Serialize};

use crate::domain::case::{CaseEntry, DatasetManifest};
use crate::domain::error::{SegError, SegResult};
use crate::domain::volume::{LabelMap, Volume};

/// Parse any JSON document from `path`. Failures are Data errors
/// keyed by the file path.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> SegResult<T> {
    let file = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| SegError::data(&file, format!("cannot read: {e}")))?;
    serde_json::from_str(&text).map_err(|e| SegError::data(&file, format!("cannot parse: {e}")))
}

/// Re-key a file-level Data error to the case it belongs to.
fn for_case(case: &str, e: SegError) -> SegError {
    match e {
        SegError::Data { case: file, message } => SegError::data(case, format!("'{file}' {message}")),
        other => other,
    }
}

/// Write `value` as JSON, creating parent directories as needed.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> SegResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SegError::report(parent, e))?;
    }
    let text = serde_json::to_string(value).map_err(|e| SegError::report(path, e))?;
    fs::write(path, text).map_err(|e| SegError::report(path, e))
}

/// Load a dataset manifest and check it declares labels and cases.
pub fn load_manifest(path: &Path) -> SegResult<DatasetManifest> {
    let manifest: DatasetManifest = read_json(path).map_err(|e| SegError::config(e.to_string()))?;
    if manifest.labels.is_empty() {
        return Err(SegError::config("manifest declares no labels"));
    }
    if manifest.modalities.is_empty() {
        return Err(SegError::config("manifest declares no modalities"));
    }
    for case in manifest.training.iter().chain(&manifest.test) {
        if case.images.len() != manifest.modalities.len() {
            return Err(SegError::config(format!(
                "case '{}' lists {} images for {} modalities",
                case.id,
                case.images.len(),
                manifest.modalities.len()
            )));
        }
    }
    tracing::info!(
        "Manifest '{}': {} training, {} test cases, {} labels",
        manifest.task,
        manifest.training.len(),
        manifest.test.len(),
        manifest.labels.len()
    );
    Ok(manifest)
}

// ─── VolumeLoader ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct VolumeLoader {
    /// Directory manifest paths are relative to
    root: PathBuf,
}

impl VolumeLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Loader rooted at the directory holding `manifest_path`.
    pub fn for_manifest(manifest_path: &Path) -> Self {
        Self::new(manifest_path.parent().unwrap_or(Path::new(".")))
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// All modalities of `case`, stacked to [modality, z, y, x].
    pub fn load_image(&self, case: &CaseEntry) -> SegResult<Volume> {
        let channels: Vec<Array3<f32>> = case
            .images
            .iter()
            .map(|p| read_json(&self.resolve(p)).map_err(|e| for_case(&case.id, e)))
            .collect::<SegResult<_>>()?;

        let first = channels
            .first()
            .ok_or_else(|| SegError::data(&case.id, "case lists no images"))?;
        if let Some(bad) = channels.iter().find(|c| c.dim() != first.dim()) {
            return Err(SegError::shape(format!(
                "case '{}': modality shapes {:?} and {:?} differ",
                case.id,
                first.dim(),
                bad.dim()
            )));
        }

        let views: Vec<ArrayView3<f32>> = channels.iter().map(|c| c.view()).collect();
        stack(Axis(0), &views).map_err(|e| SegError::data(&case.id, e.to_string()))
    }

    pub fn load_labels(&self, case: &CaseEntry) -> SegResult<LabelMap> {
        let path = case
            .mask
            .as_deref()
            .ok_or_else(|| SegError::data(&case.id, "case has no label mask"))?;
        read_json(&self.resolve(path)).map_err(|e| for_case(&case.id, e))
    }
}
