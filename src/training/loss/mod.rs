//! Loss functions for classifier training
//!
//! # Key Components
//!
//! - **LabelSmoothingLoss**: cross-entropy against a softened one-hot target
//! - **LossScaler**: dynamic loss scaling for float16 training

pub mod scaling;

pub use scaling::{LossScaler, LossScalingConfig};

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cross-entropy with label smoothing.
///
/// The target distribution puts `1 - smoothing` on the true class and
/// `smoothing / (classes - 1)` on every other class. With `smoothing = 0`
/// this is plain cross-entropy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSmoothingLoss {
    classes: usize,
    smoothing: f64,
}

impl LabelSmoothingLoss {
    /// Create a new loss for `classes` outputs
    pub fn new(classes: usize, smoothing: f64) -> Result<Self> {
        if classes == 0 {
            return Err(Error::config("label smoothing needs at least one class"));
        }
        if !(0.0..1.0).contains(&smoothing) {
            return Err(Error::config(format!(
                "smoothing must be in [0, 1), got {}",
                smoothing
            )));
        }
        Ok(Self { classes, smoothing })
    }

    /// Number of classes
    pub fn classes(&self) -> usize {
        self.classes
    }

    /// Smoothing factor
    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    /// Weight on the true class
    pub fn confidence(&self) -> f64 {
        1.0 - self.smoothing
    }

    /// Weight on each non-target class
    pub fn off_value(&self) -> f64 {
        if self.classes > 1 {
            self.smoothing / (self.classes - 1) as f64
        } else {
            0.0
        }
    }

    /// Mean loss over the batch as an f32 scalar.
    ///
    /// `logits` is `[batch, classes]` in any float dtype, `labels` is
    /// `[batch]` of integer class ids.
    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (_, classes) = logits.dims2()?;
        if classes != self.classes {
            return Err(Error::training(format!(
                "logits have {} classes, loss expects {}",
                classes, self.classes
            )));
        }

        let log_probs = log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
        let labels = labels.to_dtype(DType::U32)?.unsqueeze(1)?;
        let target_lp = log_probs.gather(&labels, 1)?.squeeze(1)?;
        let total_lp = log_probs.sum(D::Minus1)?;

        // -Σ q·lp with q = off everywhere plus (conf - off) on the target
        let off = self.off_value();
        let per_sample = ((target_lp * (self.confidence() - off))? + (total_lp * off)?)?.neg()?;
        Ok(per_sample.mean_all()?)
    }
}

/// Read a scalar loss tensor as `f64`
pub fn scalar_value(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn cross_entropy(logits: &[Vec<f32>], labels: &[u32]) -> f64 {
        let mut total = 0.0;
        for (row, &y) in logits.iter().zip(labels) {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max) as f64;
            let lse = row.iter().map(|&v| (v as f64 - max).exp()).sum::<f64>().ln() + max;
            total += lse - row[y as usize] as f64;
        }
        total / labels.len() as f64
    }

    fn tensors(logits: &[Vec<f32>], labels: &[u32]) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let cols = logits[0].len();
        let flat: Vec<f32> = logits.iter().flatten().copied().collect();
        (
            Tensor::from_vec(flat, (logits.len(), cols), &device).unwrap(),
            Tensor::new(labels, &device).unwrap(),
        )
    }

    #[test]
    fn test_zero_smoothing_is_cross_entropy() {
        let logits = vec![vec![2.0f32, 0.5, -1.0], vec![0.1, 0.2, 3.0]];
        let labels = [0u32, 1];
        let (l, y) = tensors(&logits, &labels);

        let loss = LabelSmoothingLoss::new(3, 0.0).unwrap();
        let value = scalar_value(&loss.forward(&l, &y).unwrap()).unwrap();
        assert_relative_eq!(value, cross_entropy(&logits, &labels), epsilon = 1e-5);
    }

    #[test]
    fn test_uniform_logits() {
        // Uniform prediction: loss is ln(C) whatever the smoothing
        let logits = vec![vec![0.0f32; 4]; 3];
        let labels = [0u32, 2, 3];
        let (l, y) = tensors(&logits, &labels);

        for smoothing in [0.0, 0.1, 0.5] {
            let loss = LabelSmoothingLoss::new(4, smoothing).unwrap();
            let value = scalar_value(&loss.forward(&l, &y).unwrap()).unwrap();
            assert_relative_eq!(value, (4.0f64).ln(), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_smoothed_target_minimises_loss() {
        let loss = LabelSmoothingLoss::new(3, 0.1).unwrap();
        let labels = [1u32];

        // log-probabilities equal to the smoothed target are optimal
        let optimal: Vec<f32> = vec![0.05f32.ln(), 0.9f32.ln(), 0.05f32.ln()];
        let sharper: Vec<f32> = vec![0.01f32.ln(), 0.98f32.ln(), 0.01f32.ln()];

        let (l, y) = tensors(&[optimal], &labels);
        let best = scalar_value(&loss.forward(&l, &y).unwrap()).unwrap();
        let (l, y) = tensors(&[sharper], &labels);
        let worse = scalar_value(&loss.forward(&l, &y).unwrap()).unwrap();
        assert!(best < worse);
    }

    #[test]
    fn test_half_precision_logits() {
        let logits = vec![vec![1.0f32, -1.0], vec![0.0, 2.0]];
        let labels = [0u32, 1];
        let (l, y) = tensors(&logits, &labels);
        let loss = LabelSmoothingLoss::new(2, 0.1).unwrap();

        let full = scalar_value(&loss.forward(&l, &y).unwrap()).unwrap();
        let half = scalar_value(&loss.forward(&l.to_dtype(DType::F16).unwrap(), &y).unwrap()).unwrap();
        assert_relative_eq!(full, half, epsilon = 1e-3);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(LabelSmoothingLoss::new(0, 0.1).is_err());
        assert!(LabelSmoothingLoss::new(3, 1.0).is_err());
        let loss = LabelSmoothingLoss::new(3, 0.1).unwrap();
        let (l, y) = tensors(&[vec![0.0f32, 1.0]], &[0]);
        assert!(loss.forward(&l, &y).is_err());
    }
}
