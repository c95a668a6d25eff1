// ============================================================
// Layer 3 — Cases, Labels and Result Records
// ============================================================
// The dataset manifest lists every case with the paths of its
// image modalities and (for training cases) its label mask.
// The declared label order is the channel order of every
// prediction the system produces.
//
// Example manifest:
//   {
//     "task": "Liver",
//     "modalities": ["ct"],
//     "labels": [{"value": 0, "name": "background"},
//                {"value": 1, "name": "liver"}],
//     "training": [{"id": "case_000", "images": ["..."], "mask": "..."}],
//     "test":     [{"id": "case_100", "images": ["..."]}]
//   }

use serde::{Deserialize, Serialize};

use crate::domain::volume::{LabelMap, Volume};

/// One label of the segmentation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub value: i32,
    pub name:  String,
}

/// One case on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseEntry {
    pub id:     String,
    /// One path per modality, in manifest modality order
    pub images: Vec<String>,
    /// Ground-truth label map; absent for unlabelled test cases
    #[serde(default)]
    pub mask:   Option<String>,
}

/// The dataset manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub task:       String,
    pub modalities: Vec<String>,
    pub labels:     Vec<LabelSpec>,
    pub training:   Vec<CaseEntry>,
    #[serde(default)]
    pub test:       Vec<CaseEntry>,
}

impl DatasetManifest {
    /// Label values in declared (channel) order.
    pub fn label_values(&self) -> Vec<i32> {
        self.labels.iter().map(|l| l.value).collect()
    }

    /// Labels that get a metric column (everything but background 0).
    pub fn foreground_labels(&self) -> Vec<LabelSpec> {
        self.labels.iter().filter(|l| l.value != 0).cloned().collect()
    }
}

/// A loaded, labelled case.
#[derive(Debug, Clone)]
pub struct LabeledCase {
    pub id:     String,
    /// [modality, z, y, x]
    pub image:  Volume,
    /// [z, y, x]
    pub labels: LabelMap,
}

/// One row of the results table: a case and its named metric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub case_id: String,
    pub fold:    usize,
    /// (column name, value) in column order
    pub values:  Vec<(String, f64)>,
}

impl ResultRecord {
    pub fn value(&self, column: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| *v)
    }
}

/// One row of the per-fold epoch log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub fold:          usize,
    /// 1-based epoch number
    pub epoch:         usize,
    pub train_loss:    f64,
    pub val_loss:      f64,
    pub best_val_loss: f64,
    /// None when the optimizer does not expose a learning rate
    pub learning_rate: Option<f64>,
    pub improved:      bool,
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parses_and_orders_labels() {
        let json = r#"{
            "task": "Liver",
            "modalities": ["ct"],
            "labels": [{"value": 0, "name": "background"},
                       {"value": 2, "name": "tumour"},
                       {"value": 1, "name": "liver"}],
            "training": [{"id": "a", "images": ["a.json"], "mask": "a_mask.json"}]
        }"#;
        let m: DatasetManifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.label_values(), vec![0, 2, 1]);
        assert_eq!(m.foreground_labels().len(), 2);
        assert!(m.test.is_empty());
        assert_eq!(m.training[0].mask.as_deref(), Some("a_mask.json"));
    }

    #[test]
    fn test_result_record_lookup() {
        let r = ResultRecord {
            case_id: "a".into(),
            fold:    0,
            values:  vec![("liver".into(), 0.9), ("tumour".into(), 0.4)],
        };
        assert_eq!(r.value("tumour"), Some(0.4));
        assert_eq!(r.value("spleen"), None);
    }
}
