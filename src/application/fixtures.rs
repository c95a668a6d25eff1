// ─── Test fixtures ────────────────────────────────────────────────────────────
// A task "Toy" of 4³ single-modality cases on disk: the lower
// half of every volume is foreground (image +1, label 1).

use std::path::{Path, PathBuf};

use crate::data::loader::write_json;
use crate::domain::case::{CaseEntry, DatasetManifest, LabelSpec};
use crate::domain::volume::LabelMap;

pub const TASK: &str = "Toy";

/// Write `training` labelled cases and the given test cases under
/// `dir`; test ids listed in `unreadable` get no image file.
/// Returns the manifest path.
pub fn write_toy_dataset(dir: &Path, training: usize, test: &[&str], unreadable: &[&str]) -> PathBuf {
    let image = ndarray::Array3::<f32>::from_shape_fn((4, 4, 4), |(z, _, _)| if z < 2 { 1.0 } else { -1.0 });
    let labels = LabelMap::from_shape_fn((4, 4, 4), |(z, _, _)| i32::from(z < 2));

    let mut entries = Vec::new();
    for i in 0..training {
        let id = format!("train_{i:03}");
        write_json(&dir.join(format!("{id}_ct.json")), &image).unwrap();
        write_json(&dir.join(format!("{id}_seg.json")), &labels).unwrap();
        entries.push(CaseEntry {
            id:     id.clone(),
            images: vec![format!("{id}_ct.json")],
            mask:   Some(format!("{id}_seg.json")),
        });
    }

    let mut tests = Vec::new();
    for &id in test {
        if !unreadable.contains(&id) {
            write_json(&dir.join(format!("{id}_ct.json")), &image).unwrap();
        }
        tests.push(CaseEntry { id: id.into(), images: vec![format!("{id}_ct.json")], mask: None });
    }

    let manifest = DatasetManifest {
        task:       TASK.into(),
        modalities: vec!["ct".into()],
        labels:     vec![
            LabelSpec { value: 0, name: "background".into() },
            LabelSpec { value: 1, name: "organ".into() },
        ],
        training:   entries,
        test:       tests,
    };
    let path = dir.join("dataset.json");
    write_json(&path, &manifest).unwrap();
    path
}
