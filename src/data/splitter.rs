// ============================================================
// Layer 4 — K-Fold and Validation Splitter
// ============================================================
// Two seeded partitions of case indices:
//
//   kfold_split     — shuffles 0..n once and cuts it into k
//                     contiguous test folds; the first n % k
//                     folds get one extra case. Every index is
//                     tested exactly once across the folds.
//
//   split_train_val — carves a held-out validation subset out
//                     of one fold's training split:
//                     |val| = ceil(fraction · n), at least 1,
//                     leaving at least one training case.
//
// Both use StdRng seeded from the run seed, so the same seed
// always produces the same folds.
//
// Uses Fisher-Yates shuffle via rand::seq::SliceRandom
//
// Reference: rand crate documentation

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::domain::error::{SegError, SegResult};
use crate::domain::fold::Fold;

/// Test-index sets of a k-fold partition of `0..n`, each sorted.
pub fn kfold_split(n: usize, k: usize, seed: u64) -> SegResult<Vec<Vec<usize>>> {
    if k < 2 {
        return Err(SegError::config(format!("nfolds must be >= 2, got {k}")));
    }
    if k > n {
        return Err(SegError::config(format!("nfolds ({k}) exceeds the number of cases ({n})")));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    let base  = n / k;
    let extra = n % k;
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for f in 0..k {
        let size = base + usize::from(f < extra);
        let mut test = order[start..start + size].to_vec();
        test.sort_unstable();
        folds.push(test);
        start += size;
    }
    Ok(folds)
}

/// Shuffle `indices` and split off a validation subset.
/// Returns (train, val), both sorted.
pub fn split_train_val(
    indices:  &[usize],
    fraction: f64,
    seed:     u64,
) -> SegResult<(Vec<usize>, Vec<usize>)> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(SegError::config(format!("val_fraction must be in (0, 1), got {fraction}")));
    }
    let n = indices.len();
    if n < 2 {
        return Err(SegError::config(format!(
            "training split of {n} case(s) cannot hold both a training and a validation case"
        )));
    }

    let n_val = ((fraction * n as f64).ceil() as usize).clamp(1, n - 1);

    let mut shuffled = indices.to_vec();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut val   = shuffled.split_off(n - n_val);
    let mut train = shuffled;
    train.sort_unstable();
    val.sort_unstable();
    Ok((train, val))
}

/// Every fold of the run with its train / val / test indices.
pub fn build_folds(n: usize, k: usize, val_fraction: f64, seed: u64) -> SegResult<Vec<Fold>> {
    let tests = kfold_split(n, k, seed)?;
    tests
        .into_iter()
        .enumerate()
        .map(|(index, test)| {
            let training: Vec<usize> = (0..n).filter(|i| test.binary_search(i).is_err()).collect();
            let (train, val) = split_train_val(&training, val_fraction, seed.wrapping_add(index as u64))?;

            tracing::debug!(
                "Fold {}: {} train, {} val, {} test",
                index, train.len(), val.len(), test.len()
            );
            Ok(Fold { index, train, val, test })
        })
        .collect()
}
