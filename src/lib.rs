//! SolverText - fold-aware fine-tuning of BERT text classifiers
//!
//! The crate scans a labeled file tree, joins it with a tab-separated text
//! table, keeps CJK ideographs only, splits the rows into stratified folds
//! and fine-tunes a pretrained BERT encoder with a fresh classification
//! head. Training uses label-smoothed cross-entropy, AdamW with a one-cycle
//! schedule, gradient clipping, optional loss scaling for half precision and
//! stochastic weight averaging, and reports validation accuracy per epoch.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod encoder;
pub mod error;
pub mod model;
pub mod progress;
pub mod training;
pub mod utils;

// Re-exports
pub use config::Config;
pub use encoder::{EncoderConfig, TextTokenizer};
pub use error::{Error, Result};
pub use model::TextClassifier;
pub use training::{ClassifierTrainer, TrainingEvent, TrainingResult};
