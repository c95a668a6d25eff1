// ============================================================
// Layer 4 — Case Dataset
// ============================================================
// Eval-mode access to whole labelled cases. Implements the
// CaseSource trait from Layer 3, so validation and fold test
// evaluation never see file paths.
//
// Every load checks that the label map matches the image's
// spatial shape and only holds declared label values.

use std::collections::BTreeSet;

use crate::data::loader::VolumeLoader;
use crate::domain::case::{CaseEntry, LabeledCase};
use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::CaseSource;
use crate::domain::volume::spatial_dims;

pub struct CaseDataset {
    loader:       VolumeLoader,
    cases:        Vec<CaseEntry>,
    label_values: Vec<i32>,
}

impl CaseDataset {
    pub fn new(loader: VolumeLoader, cases: Vec<CaseEntry>, label_values: Vec<i32>) -> Self {
        Self { loader, cases, label_values }
    }

    pub fn entry(&self, index: usize) -> SegResult<&CaseEntry> {
        self.cases
            .get(index)
            .ok_or_else(|| SegError::data(format!("#{index}"), "case index out of range"))
    }
}

impl CaseSource for CaseDataset {
    fn len(&self) -> usize {
        self.cases.len()
    }

    fn case_id(&self, index: usize) -> SegResult<String> {
        Ok(self.entry(index)?.id.clone())
    }

    fn load(&self, index: usize) -> SegResult<LabeledCase> {
        let entry  = self.entry(index)?;
        let image  = self.loader.load_image(entry)?;
        let labels = self.loader.load_labels(entry)?;

        let (d, h, w) = labels.dim();
        if spatial_dims(&image) != [d, h, w] {
            return Err(SegError::shape(format!(
                "case '{}': image {:?} and labels {:?} differ",
                entry.id,
                spatial_dims(&image),
                [d, h, w]
            )));
        }

        let declared: BTreeSet<i32> = self.label_values.iter().copied().collect();
        if let Some(v) = labels.iter().find(|&&v| !declared.contains(&v)) {
            return Err(SegError::data(&entry.id, format!("undeclared label value {v}")));
        }

        Ok(LabeledCase { id: entry.id.clone(), image, labels })
    }
}
