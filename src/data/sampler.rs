// ============================================================
// Layer 4 — Patch Sampler
// ============================================================
// Train-mode data pipeline. Implements BatchStreamFactory:
// every call to train_stream returns a fresh, infinite,
// seeded iterator of batches over the given case indices.
//
// For each sample:
//   1. Take the next case of the current pass; when a pass is
//      used up, reshuffle the indices and start a new one
//   2. Zero-pad the case up to the patch size if it is smaller
//   3. Pick an origin: with probability oversample_foreground
//      centre the patch on a random foreground voxel, otherwise
//      draw it uniformly
//   4. Crop image and labels, one-hot the labels in declared
//      order
//   5. Optionally mirror along a random subset of axes
//
// With skip_bad_cases set, a case that fails to load or crop
// is logged and dropped from the stream for good, and the
// batch is filled from the remaining cases. The stream only
// fails once no usable case is left.
//
// The stream owns its RNG and its shuffled order; dropping the
// stream releases everything it holds.
//
// Reference: rand crate documentation (StdRng, SliceRandom)

use ndarray::s;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::domain::error::{SegError, SegResult};
use crate::domain::traits::{BatchStream, BatchStreamFactory, CaseSource};
use crate::domain::volume::{
    extract_patch, one_hot, pad_labels_to, pad_to, spatial_dims, Batch, FlipVariant, PatchSample,
    Shape3,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerSettings {
    pub patch:                 Shape3,
    pub batch_size:            usize,
    /// Probability that a patch is centred on foreground
    pub oversample_foreground: f64,
    /// Random axis mirroring
    pub mirror:                bool,
    /// Drop unreadable cases instead of failing the batch
    pub skip_bad_cases:        bool,
}

pub struct PatchSampler<'d> {
    source:       &'d dyn CaseSource,
    label_values: Vec<i32>,
    settings:     SamplerSettings,
}

impl<'d> PatchSampler<'d> {
    pub fn new(
        source:       &'d dyn CaseSource,
        label_values: Vec<i32>,
        settings:     SamplerSettings,
    ) -> SegResult<Self> {
        if settings.batch_size == 0 {
            return Err(SegError::config("batch_size must be >= 1"));
        }
        if settings.patch.contains(&0) {
            return Err(SegError::config(format!("patch size {:?} has an empty axis", settings.patch)));
        }
        if !(0.0..=1.0).contains(&settings.oversample_foreground) {
            return Err(SegError::config(format!(
                "oversample_foreground must be in [0, 1], got {}",
                settings.oversample_foreground
            )));
        }
        Ok(Self { source, label_values, settings })
    }
}

impl<'d> BatchStreamFactory for PatchSampler<'d> {
    fn train_stream<'a>(&'a self, indices: &[usize], seed: u64) -> SegResult<BatchStream<'a>> {
        if indices.is_empty() {
            return Err(SegError::config("cannot sample patches from zero training cases"));
        }
        Ok(Box::new(PatchStream {
            sampler: self,
            indices: indices.to_vec(),
            order:   Vec::new(),
            cursor:  0,
            rng:     StdRng::seed_from_u64(seed),
        }))
    }
}

// ─── PatchStream ──────────────────────────────────────────────────────────────
struct PatchStream<'a, 'd> {
    sampler: &'a PatchSampler<'d>,
    indices: Vec<usize>,
    order:   Vec<usize>,
    cursor:  usize,
    rng:     StdRng,
}

impl PatchStream<'_, '_> {
    fn next_case(&mut self) -> usize {
        if self.cursor >= self.order.len() {
            self.order = self.indices.clone();
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        index
    }

    fn drop_case(&mut self, index: usize) {
        self.indices.retain(|&i| i != index);
        if let Some(pos) = self.order.iter().position(|&i| i == index) {
            self.order.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
        }
    }

    fn sample(&mut self, index: usize) -> SegResult<PatchSample> {
        let settings = &self.sampler.settings;
        let patch    = settings.patch;
        let case     = self.sampler.source.load(index)?;
        let image    = pad_to(&case.image, patch);
        let labels   = pad_labels_to(&case.labels, patch);
        let dims     = spatial_dims(&image);

        let centred = settings.oversample_foreground > 0.0
            && self.rng.gen_bool(settings.oversample_foreground);
        let foreground: Vec<(usize, usize, usize)> = if centred {
            labels
                .indexed_iter()
                .filter(|&(_, &v)| v != 0)
                .map(|(idx, _)| idx)
                .collect()
        } else {
            Vec::new()
        };

        let origin: Shape3 = match foreground.choose(&mut self.rng) {
            Some(&(z, y, x)) => {
                let centre = [z, y, x];
                std::array::from_fn(|a| centre[a].saturating_sub(patch[a] / 2).min(dims[a] - patch[a]))
            }
            None => std::array::from_fn(|a| self.rng.gen_range(0..=dims[a] - patch[a])),
        };

        let image_patch = extract_patch(&image, origin, patch)?;
        let [z, y, x] = origin;
        let label_patch = labels
            .slice(s![z..z + patch[0], y..y + patch[1], x..x + patch[2]])
            .to_owned();
        let mask = one_hot(&label_patch, &self.sampler.label_values);

        let flip = if settings.mirror {
            FlipVariant { axes: std::array::from_fn(|_| self.rng.gen_bool(0.5)) }
        } else {
            FlipVariant::IDENTITY
        };

        Ok(PatchSample {
            image: flip.apply(&image_patch),
            mask:  flip.apply(&mask),
        })
    }

    fn next_batch(&mut self) -> SegResult<Batch> {
        let wanted  = self.sampler.settings.batch_size;
        let mut samples = Vec::with_capacity(wanted);
        while samples.len() < wanted {
            if self.indices.is_empty() {
                return Err(SegError::data("training split", "no usable training case left"));
            }
            let index = self.next_case();
            match self.sample(index) {
                Ok(sample) => samples.push(sample),
                Err(e) if self.sampler.settings.skip_bad_cases && e.is_case_local() => {
                    tracing::warn!("Dropping training case {index} from the stream: {e}");
                    self.drop_case(index);
                }
                Err(e) => return Err(e),
            }
        }
        Batch::new(samples)
    }
}

impl Iterator for PatchStream<'_, '_> {
    type Item = SegResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::case::LabeledCase;
    use crate::domain::volume::{LabelMap, Volume};

    /// Cases of shape 6³ (or 2³ for index 9) with one foreground voxel.
    /// Index 4 cannot be read.
    struct Synthetic;

    impl CaseSource for Synthetic {
        fn len(&self) -> usize {
            10
        }

        fn case_id(&self, index: usize) -> SegResult<String> {
            Ok(format!("case_{index}"))
        }

        fn load(&self, index: usize) -> SegResult<LabeledCase> {
            if index == 4 {
                return Err(SegError::data("case_4", "truncated volume"));
            }
            let n = if index == 9 { 2 } else { 6 };
            let mut labels = LabelMap::zeros((n, n, n));
            labels[[n - 1, n - 1, n - 1]] = 1;
            Ok(LabeledCase {
                id:     format!("case_{index}"),
                image:  Volume::from_elem((1, n, n, n), index as f32),
                labels,
            })
        }
    }

    fn settings(oversample: f64, mirror: bool) -> SamplerSettings {
        SamplerSettings {
            patch:                 [4, 4, 4],
            batch_size:            2,
            oversample_foreground: oversample,
            mirror,
            skip_bad_cases:        false,
        }
    }

    fn first_voxel(batch: &Batch, n: usize) -> f32 {
        batch.samples()[n].image[[0, 0, 0, 0]]
    }

    #[test]
    fn test_stream_is_infinite_and_shaped() {
        let src = Synthetic;
        let sampler = PatchSampler::new(&src, vec![0, 1], settings(0.3, true)).unwrap();
        let mut stream = sampler.train_stream(&[0, 1, 2], 1).unwrap();
        for _ in 0..20 {
            let batch = stream.next().unwrap().unwrap();
            assert_eq!(batch.len(), 2);
            for sample in batch.samples() {
                assert_eq!(sample.image.shape(), &[1, 4, 4, 4]);
                assert_eq!(sample.mask.shape(), &[2, 4, 4, 4]);
            }
        }
    }

    #[test]
    fn test_same_seed_same_batches() {
        let src = Synthetic;
        let sampler = PatchSampler::new(&src, vec![0, 1], settings(0.5, true)).unwrap();
        let a: Vec<Batch> = sampler.train_stream(&[0, 1, 2, 3], 9).unwrap().take(5).map(Result::unwrap).collect();
        let b: Vec<Batch> = sampler.train_stream(&[0, 1, 2, 3], 9).unwrap().take(5).map(Result::unwrap).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_each_pass_visits_every_case() {
        let src = Synthetic;
        let mut s = settings(0.0, false);
        s.batch_size = 1;
        let sampler = PatchSampler::new(&src, vec![0, 1], s).unwrap();
        let mut seen: Vec<f32> = sampler
            .train_stream(&[2, 5, 7], 4)
            .unwrap()
            .take(3)
            .map(|b| first_voxel(&b.unwrap(), 0))
            .collect();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, vec![2.0, 5.0, 7.0]);
    }

    #[test]
    fn test_foreground_oversampling_hits_foreground() {
        let src = Synthetic;
        let sampler = PatchSampler::new(&src, vec![0, 1], settings(1.0, false)).unwrap();
        let mut stream = sampler.train_stream(&[0, 1], 3).unwrap();
        for _ in 0..5 {
            let batch = stream.next().unwrap().unwrap();
            for sample in batch.samples() {
                let fg: f32 = sample.mask.slice(s![1, .., .., ..]).sum();
                assert_eq!(fg, 1.0);
            }
        }
    }

    #[test]
    fn test_small_case_is_padded() {
        let src = Synthetic;
        let mut s = settings(0.0, false);
        s.batch_size = 1;
        let sampler = PatchSampler::new(&src, vec![0, 1], s).unwrap();
        let batch = sampler.train_stream(&[9], 0).unwrap().next().unwrap().unwrap();
        assert_eq!(first_voxel(&batch, 0), 9.0);
        assert_eq!(batch.samples()[0].image[[0, 3, 3, 3]], 0.0);
    }

    #[test]
    fn test_bad_case_fails_the_batch_without_skipping() {
        let src = Synthetic;
        let mut s = settings(0.0, false);
        s.batch_size = 1;
        let sampler = PatchSampler::new(&src, vec![0, 1], s).unwrap();
        let err = sampler.train_stream(&[4], 0).unwrap().next().unwrap().unwrap_err();
        assert!(err.is_case_local());
    }

    #[test]
    fn test_bad_case_is_dropped_when_skipping() {
        let src = Synthetic;
        let mut s = settings(0.0, false);
        s.batch_size = 3;
        s.skip_bad_cases = true;
        let sampler = PatchSampler::new(&src, vec![0, 1], s).unwrap();
        let mut stream = sampler.train_stream(&[3, 4, 5], 2).unwrap();
        for _ in 0..6 {
            let batch = stream.next().unwrap().unwrap();
            assert_eq!(batch.len(), 3);
            assert!((0..3).all(|n| [3.0, 5.0].contains(&first_voxel(&batch, n))));
        }
    }

    #[test]
    fn test_stream_fails_once_every_case_is_dropped() {
        let src = Synthetic;
        let mut s = settings(0.0, false);
        s.skip_bad_cases = true;
        let sampler = PatchSampler::new(&src, vec![0, 1], s).unwrap();
        let err = sampler.train_stream(&[4], 0).unwrap().next().unwrap().unwrap_err();
        assert!(err.to_string().contains("no usable training case"));
    }

    #[test]
    fn test_invalid_settings() {
        let src = Synthetic;
        assert!(PatchSampler::new(&src, vec![0, 1], settings(1.5, false)).is_err());
        let sampler = PatchSampler::new(&src, vec![0, 1], settings(0.0, false)).unwrap();
        assert!(sampler.train_stream(&[], 0).is_err());
    }
}
