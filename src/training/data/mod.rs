//! Dataset adapter: labeled file discovery, text join, fold splitting and
//! tokenized batch loading.

pub mod datasets;
pub mod folds;
pub mod loaders;

pub use datasets::{
    is_target_script, join_text, keep_target_script, read_text_table, scan_labeled_files,
    FoldData, LabeledFile, TextClassificationDataset,
};
pub use folds::{FoldSplit, StratifiedKFold};
pub use loaders::{
    Batch, DataLoader, DataLoaderConfig, EpochIter, ImbalancedSampler, SamplingStrategy,
};

use serde::{Deserialize, Serialize};

use crate::encoder::TokenizedInput;
use crate::error::Result;

/// One joined row: file identity, label and filtered text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledText {
    pub file_name: String,
    pub label: u32,
    pub text: String,
}

/// One tokenized training example
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub tokens: TokenizedInput,
    pub label: u32,
}

/// Indexable source of samples
pub trait Dataset: Send + Sync {
    /// Number of samples
    fn len(&self) -> usize;

    /// Sample at `index`
    fn get(&self, index: usize) -> Result<Sample>;

    /// Labels in index order
    fn labels(&self) -> Vec<u32>;

    /// Whether the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
