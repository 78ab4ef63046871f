//! Metric computation and experiment tracking
//!
//! Validation predictions are collected batch by batch and reduced once per
//! epoch; scalar metrics go through a [`MetricsTracker`] to the offline run
//! directory.

pub mod exporters;
pub mod tracker;

pub use exporters::{MetricsExporter, OfflineRunExporter};
pub use tracker::MetricsTracker;

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fraction of positions where `predictions` equals `labels`
pub fn accuracy(labels: &[u32], predictions: &[u32]) -> Result<f64> {
    if labels.len() != predictions.len() {
        return Err(Error::training(format!(
            "accuracy over {} labels and {} predictions",
            labels.len(),
            predictions.len()
        )));
    }
    if labels.is_empty() {
        return Err(Error::training("accuracy over an empty set"));
    }
    let correct = labels
        .iter()
        .zip(predictions)
        .filter(|(label, prediction)| label == prediction)
        .count();
    Ok(correct as f64 / labels.len() as f64)
}

/// Row-wise arg-max of `[batch, classes]` logits
pub fn argmax_rows(logits: &Tensor) -> Result<Vec<u32>> {
    Ok(logits
        .to_dtype(DType::F32)?
        .argmax(D::Minus1)?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?)
}

/// Output of one validation step
#[derive(Debug, Clone)]
pub struct ValidationStepOutput {
    /// Labels `[batch]`
    pub labels: Tensor,
    /// Logits `[batch, classes]`
    pub logits: Tensor,
    /// Batch loss
    pub loss: f64,
}

/// Validation outputs of a whole epoch, held on the host
#[derive(Debug, Clone, Default)]
pub struct ValidationOutputs {
    labels: Vec<u32>,
    predictions: Vec<u32>,
    losses: Vec<f64>,
}

impl ValidationOutputs {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one step's output
    pub fn push(&mut self, output: &ValidationStepOutput) -> Result<()> {
        let labels = output.labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let predictions = argmax_rows(&output.logits)?;
        if labels.len() != predictions.len() {
            return Err(Error::training(format!(
                "validation step produced {} labels for {} predictions",
                labels.len(),
                predictions.len()
            )));
        }
        self.labels.extend(labels);
        self.predictions.extend(predictions);
        self.losses.push(output.loss);
        Ok(())
    }

    /// Number of samples seen
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether no samples were seen
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Accuracy over everything pushed
    pub fn accuracy(&self) -> Result<f64> {
        accuracy(&self.labels, &self.predictions)
    }

    /// Mean of the per-batch losses
    pub fn mean_loss(&self) -> f64 {
        if self.losses.is_empty() {
            return f64::NAN;
        }
        self.losses.iter().sum::<f64>() / self.losses.len() as f64
    }

    /// Reduce to epoch metrics
    pub fn summarize(&self) -> Result<ValidationSummary> {
        Ok(ValidationSummary {
            valid_loss: self.mean_loss(),
            valid_metric: self.accuracy()?,
            samples: self.len(),
        })
    }
}

/// Epoch-level validation metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    /// Mean validation loss over batches
    pub valid_loss: f64,
    /// Validation accuracy
    pub valid_metric: f64,
    /// Number of validation samples
    pub samples: usize,
}

/// One logged line of scalar metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Global optimizer step
    pub step: usize,
    /// Epoch (0-based)
    pub epoch: usize,
    /// Metric values by name
    pub metrics: BTreeMap<String, f64>,
    /// Time of logging
    pub timestamp: DateTime<Utc>,
}

impl MetricRecord {
    /// Create a record stamped now
    pub fn new(step: usize, epoch: usize) -> Self {
        Self {
            step,
            epoch,
            metrics: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a metric
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Metric value by name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}
