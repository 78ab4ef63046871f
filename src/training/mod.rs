//! Training infrastructure for the text classifier
//!
//! This module provides data preparation and loading, the fold training
//! loop, optimization, checkpointing and metrics tracking.
//!
//! # Main Components
//!
//! - **Data**: directory scan, side-table join, stratified folds and batch loading
//! - **Trainer**: epoch loop with validation, checkpointing and weight averaging
//! - **Loss**: label-smoothed cross-entropy and dynamic loss scaling
//! - **Optimizers**: AdamW construction, one-cycle schedule and gradient clipping
//! - **Checkpoints**: best and rolling checkpoints with JSON metadata
//! - **Metrics**: accuracy, validation reduction and offline run logging
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use solvertext::{Config, training::ClassifierTrainer};
//! use solvertext::utils::select_device;
//!
//! let config = Config::load(Some("run.yaml".as_ref()))?;
//! let device = select_device(&config.device.gpus)?;
//!
//! let mut trainer = ClassifierTrainer::from_config(&config, &device)?;
//! let result = trainer.fit()?;
//! println!("best checkpoint: {:?}", result.best_checkpoint_path);
//! ```

pub mod checkpoints;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Trainer re-exports
pub use trainer::{ClassifierTrainer, TrainingEvent, TrainingResult, TrainingState, TrainingStatus};

// Data re-exports
pub use data::{
    Batch, DataLoader, DataLoaderConfig, Dataset, FoldData, LabeledText, Sample,
    SamplingStrategy, StratifiedKFold, TextClassificationDataset,
};

// Checkpoint re-exports
pub use checkpoints::{CheckpointInfo, CheckpointManager, CheckpointMetadata};

// Metrics re-exports
pub use metrics::{accuracy, MetricRecord, MetricsTracker, ValidationOutputs, ValidationSummary};

// Loss and optimizer re-exports
pub use loss::{LabelSmoothingLoss, LossScaler};
pub use optimizers::{
    GradientClipper, OneCycleScheduler, Scheduler, StochasticWeightAveraging, SwaLrSchedule,
};
