//! Batch loading with a tokenization worker pool

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Dataset, Sample};
use crate::encoder::{TokenBatch, TokenizedInput};
use crate::error::{Error, Result};

/// Order in which a loader visits the dataset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SamplingStrategy {
    /// Dataset order
    Sequential,
    /// Fresh permutation every epoch
    Shuffle,
    /// `len` draws with replacement, weighted by inverse class frequency
    Imbalanced,
}

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Sampling strategy
    pub sampling: SamplingStrategy,
    /// Number of worker threads for tokenization
    pub num_workers: usize,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            sampling: SamplingStrategy::Shuffle,
            num_workers: 4,
            drop_last: false,
        }
    }
}

/// A collated batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token tensors `[batch, max_length]`
    pub tokens: TokenBatch,
    /// Labels `[batch]` as `u32`
    pub labels: Tensor,
}

impl Batch {
    /// Collate samples onto `device`
    pub fn collate(samples: Vec<Sample>, device: &Device) -> Result<Self> {
        let (inputs, labels): (Vec<TokenizedInput>, Vec<u32>) =
            samples.into_iter().map(|s| (s.tokens, s.label)).unzip();
        let n = labels.len();
        Ok(Self {
            tokens: TokenBatch::from_inputs(&inputs, device)?,
            labels: Tensor::from_vec(labels, n, device)?,
        })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.tokens.batch_size()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Weighted sampler that over-draws rare classes
#[derive(Debug, Clone)]
pub struct ImbalancedSampler {
    index: WeightedIndex<f64>,
    num_samples: usize,
}

impl ImbalancedSampler {
    /// Weight each sample by the inverse of its class frequency
    pub fn new(labels: &[u32]) -> Result<Self> {
        let mut counts = std::collections::HashMap::new();
        for &label in labels {
            *counts.entry(label).or_insert(0usize) += 1;
        }
        let weights: Vec<f64> = labels.iter().map(|label| 1.0 / counts[label] as f64).collect();
        let index = WeightedIndex::new(&weights)
            .map_err(|e| Error::data(format!("invalid sampling weights: {}", e)))?;
        Ok(Self {
            index,
            num_samples: labels.len(),
        })
    }

    /// Draw one epoch of indices
    pub fn sample(&self, rng: &mut StdRng) -> Vec<usize> {
        (0..self.num_samples).map(|_| self.index.sample(rng)).collect()
    }
}

/// Data loader producing tokenized batches
pub struct DataLoader<D: Dataset + 'static> {
    dataset: Arc<D>,
    config: DataLoaderConfig,
    pool: Arc<ThreadPool>,
    sampler: Option<ImbalancedSampler>,
    rng: StdRng,
    device: Device,
    epoch: usize,
}

impl<D: Dataset + 'static> DataLoader<D> {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<D>, config: DataLoaderConfig, seed: u64, device: Device) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::data("batch_size must be > 0"));
        }
        // 0 workers means one per core
        let threads = match config.num_workers {
            0 => num_cpus::get(),
            n => n,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tokenize-{}", i))
            .build()
            .map_err(|e| Error::data(format!("cannot start worker pool: {}", e)))?;

        let sampler = match config.sampling {
            SamplingStrategy::Imbalanced => Some(ImbalancedSampler::new(&dataset.labels())?),
            _ => None,
        };

        info!(
            "Creating DataLoader with batch_size={}, num_workers={}, sampling={:?}",
            config.batch_size, config.num_workers, config.sampling
        );

        Ok(Self {
            dataset,
            config,
            pool: Arc::new(pool),
            sampler,
            rng: StdRng::seed_from_u64(seed),
            device,
            epoch: 0,
        })
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let dataset_size = self.dataset.len();
        if self.config.drop_last {
            dataset_size / self.config.batch_size
        } else {
            dataset_size.div_ceil(self.config.batch_size)
        }
    }

    /// Get dataset size
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Dataset reference
    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    /// Visit order for the next epoch
    fn epoch_indices(&mut self) -> Vec<usize> {
        match (&self.sampler, self.config.sampling) {
            (Some(sampler), _) => sampler.sample(&mut self.rng),
            (None, SamplingStrategy::Shuffle) => {
                let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
                indices.shuffle(&mut self.rng);
                indices
            }
            (None, _) => (0..self.dataset.len()).collect(),
        }
    }

    /// Start an epoch; the returned iterator owns everything it needs
    pub fn epoch(&mut self) -> EpochIter<D> {
        self.epoch += 1;
        let indices = self.epoch_indices();

        let mut batches: Vec<Vec<usize>> = indices
            .chunks(self.config.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        if self.config.drop_last
            && batches.last().map(|b| b.len() < self.config.batch_size).unwrap_or(false)
        {
            batches.pop();
        }

        debug!("Epoch {}: {} batches", self.epoch, batches.len());
        EpochIter {
            dataset: Arc::clone(&self.dataset),
            pool: Arc::clone(&self.pool),
            device: self.device.clone(),
            batches: batches.into_iter(),
        }
    }
}

/// Iterator over one epoch of batches
pub struct EpochIter<D: Dataset + 'static> {
    dataset: Arc<D>,
    pool: Arc<ThreadPool>,
    device: Device,
    batches: std::vec::IntoIter<Vec<usize>>,
}

impl<D: Dataset + 'static> Iterator for EpochIter<D> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batches.next()?;
        let dataset = &self.dataset;
        let samples: Result<Vec<Sample>> = self
            .pool
            .install(|| indices.par_iter().map(|&i| dataset.get(i)).collect());
        Some(samples.and_then(|samples| Batch::collate(samples, &self.device)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}
