//! Stratified k-fold splitting

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::warn;

use crate::error::{Error, Result};

/// Train/validation indices for one fold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSplit {
    /// Indices outside the fold
    pub train: Vec<usize>,
    /// Indices of the fold itself
    pub valid: Vec<usize>,
}

/// Stratified k-fold splitter.
///
/// Members of each class are shuffled with a seeded RNG and dealt round-robin
/// across folds, continuing the rotation from one class to the next. Every
/// index lands in exactly one validation fold; per-class and overall fold
/// sizes differ by at most one.
#[derive(Debug, Clone)]
pub struct StratifiedKFold {
    n_splits: usize,
    seed: u64,
}

impl StratifiedKFold {
    /// Create a splitter shuffling class members with `seed`
    pub fn new(n_splits: usize, seed: u64) -> Self {
        Self { n_splits, seed }
    }

    /// Number of folds
    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    /// Validation fold id for every index
    pub fn assign(&self, labels: &[u32]) -> Result<Vec<usize>> {
        if self.n_splits < 2 {
            return Err(Error::data("stratified split needs at least 2 folds"));
        }
        if labels.len() < self.n_splits {
            return Err(Error::data(format!(
                "cannot split {} samples into {} folds",
                labels.len(),
                self.n_splits
            )));
        }

        let mut by_class: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (idx, &label) in labels.iter().enumerate() {
            by_class.entry(label).or_default().push(idx);
        }

        let smallest = by_class.values().map(Vec::len).min().unwrap_or(0);
        if smallest < self.n_splits {
            warn!(
                "least populated class has {} members, fewer than n_splits={}",
                smallest, self.n_splits
            );
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut assignment = vec![0usize; labels.len()];
        let mut cursor = 0usize;

        for members in by_class.values_mut() {
            members.shuffle(&mut rng);
            for &idx in members.iter() {
                assignment[idx] = cursor % self.n_splits;
                cursor += 1;
            }
        }

        Ok(assignment)
    }

    /// All folds, in fold order
    pub fn split(&self, labels: &[u32]) -> Result<Vec<FoldSplit>> {
        let assignment = self.assign(labels)?;
        let mut folds: Vec<FoldSplit> = (0..self.n_splits)
            .map(|_| FoldSplit {
                train: Vec::new(),
                valid: Vec::new(),
            })
            .collect();

        for (idx, &fold) in assignment.iter().enumerate() {
            for (k, split) in folds.iter_mut().enumerate() {
                if k == fold {
                    split.valid.push(idx);
                } else {
                    split.train.push(idx);
                }
            }
        }

        Ok(folds)
    }

    /// A single fold
    pub fn fold(&self, labels: &[u32], fold: usize) -> Result<FoldSplit> {
        if fold >= self.n_splits {
            return Err(Error::data(format!(
                "fold {} out of range for {} splits",
                fold, self.n_splits
            )));
        }
        let mut folds = self.split(labels)?;
        Ok(folds.swap_remove(fold))
    }
}
