//! Metrics tracker coordinating step and epoch logging

use serde_json::Value;
use tracing::{debug, warn};

use super::{MetricRecord, MetricsExporter, ValidationSummary};
use crate::error::Result;

/// Routes metrics to exporters on a step cadence and keeps the history
pub struct MetricsTracker {
    exporters: Vec<Box<dyn MetricsExporter>>,
    history: Vec<MetricRecord>,
    log_every_n_steps: usize,
    loss_sum: f64,
    loss_count: usize,
}

impl MetricsTracker {
    /// Create a tracker logging step metrics every `log_every_n_steps`
    pub fn new(log_every_n_steps: usize) -> Self {
        Self {
            exporters: Vec::new(),
            history: Vec::new(),
            log_every_n_steps: log_every_n_steps.max(1),
            loss_sum: 0.0,
            loss_count: 0,
        }
    }

    /// Attach an exporter
    pub fn with_exporter(mut self, exporter: Box<dyn MetricsExporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    /// Record hyperparameters with every exporter
    pub fn log_hparams(&mut self, hparams: &Value) -> Result<()> {
        for exporter in &mut self.exporters {
            exporter.log_hparams(hparams)?;
        }
        Ok(())
    }

    fn emit(&mut self, record: MetricRecord) -> Result<()> {
        for exporter in &mut self.exporters {
            if let Err(e) = exporter.log_metrics(&record) {
                warn!("Exporter '{}' failed: {}", exporter.name(), e);
            }
        }
        self.history.push(record);
        Ok(())
    }

    /// Record a training step; written out every `log_every_n_steps` steps.
    /// Returns whether a line was logged.
    pub fn log_step(&mut self, step: usize, epoch: usize, train_loss: f64, learning_rate: f64) -> Result<bool> {
        self.loss_sum += train_loss;
        self.loss_count += 1;

        if step % self.log_every_n_steps != 0 {
            return Ok(false);
        }
        let record = MetricRecord::new(step, epoch)
            .with("train_loss", train_loss)
            .with("learning_rate", learning_rate);
        self.emit(record)?;
        Ok(true)
    }

    /// Mean training loss since the last epoch boundary
    pub fn epoch_train_loss(&self) -> Option<f64> {
        (self.loss_count > 0).then(|| self.loss_sum / self.loss_count as f64)
    }

    /// Record epoch-level validation metrics and reset the running loss
    pub fn log_epoch(&mut self, step: usize, epoch: usize, summary: &ValidationSummary) -> Result<()> {
        let mut record = MetricRecord::new(step, epoch)
            .with("valid_loss", summary.valid_loss)
            .with("valid_metric", summary.valid_metric);
        if let Some(train_loss) = self.epoch_train_loss() {
            record = record.with("train_loss_epoch", train_loss);
        }
        debug!(
            "Epoch {} metrics: valid_loss={:.4}, valid_metric={:.4}",
            epoch, summary.valid_loss, summary.valid_metric
        );
        self.emit(record)?;

        self.loss_sum = 0.0;
        self.loss_count = 0;
        self.flush()
    }

    /// Flush every exporter
    pub fn flush(&mut self) -> Result<()> {
        for exporter in &mut self.exporters {
            exporter.flush()?;
        }
        Ok(())
    }

    /// Every record logged so far
    pub fn history(&self) -> &[MetricRecord] {
        &self.history
    }

    /// Latest value of `metric`
    pub fn latest(&self, metric: &str) -> Option<f64> {
        self.history.iter().rev().find_map(|record| record.get(metric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemoryExporter {
        lines: Arc<Mutex<Vec<MetricRecord>>>,
    }

    impl MetricsExporter for MemoryExporter {
        fn name(&self) -> &str {
            "memory"
        }

        fn log_hparams(&mut self, _hparams: &Value) -> Result<()> {
            Ok(())
        }

        fn log_metrics(&mut self, record: &MetricRecord) -> Result<()> {
            self.lines.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[test]
    fn test_step_cadence() {
        let exporter = MemoryExporter::default();
        let mut tracker = MetricsTracker::new(50).with_exporter(Box::new(exporter.clone()));

        let logged: usize = (1..=120)
            .map(|step| tracker.log_step(step, 0, 1.0, 1e-5).unwrap() as usize)
            .sum();
        assert_eq!(logged, 2);
        assert_eq!(exporter.lines.lock().unwrap().len(), 2);
        assert_eq!(exporter.lines.lock().unwrap()[0].step, 50);
    }

    #[test]
    fn test_epoch_resets_running_loss() {
        let mut tracker = MetricsTracker::new(10);
        tracker.log_step(1, 0, 2.0, 1e-5).unwrap();
        tracker.log_step(2, 0, 4.0, 1e-5).unwrap();
        assert_eq!(tracker.epoch_train_loss(), Some(3.0));

        let summary = ValidationSummary {
            valid_loss: 0.5,
            valid_metric: 0.8,
            samples: 10,
        };
        tracker.log_epoch(2, 0, &summary).unwrap();
        assert_eq!(tracker.epoch_train_loss(), None);
        assert_eq!(tracker.latest("valid_metric"), Some(0.8));
        assert_eq!(tracker.latest("train_loss_epoch"), Some(3.0));
    }
}
