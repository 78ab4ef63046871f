//! Terminal progress reporting driven by trainer events

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::error::{Error, Result};
use crate::training::TrainingEvent;

fn bar_style(template: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(template)
        .map_err(|e| Error::config(format!("invalid progress template: {}", e)))?
        .progress_chars("█▇▆▅▄▃▂▁  "))
}

/// Epoch and batch bars for a training run
pub struct TrainingProgress {
    epoch_bar: ProgressBar,
    batch_bar: ProgressBar,
    refresh_rate: u64,
    pending: u64,
    _multi: MultiProgress,
}

impl TrainingProgress {
    /// Bars for `total_epochs` epochs of `batches_per_epoch` batches; the
    /// batch bar is redrawn every `refresh_rate` steps
    pub fn new(total_epochs: u64, batches_per_epoch: u64, refresh_rate: usize) -> Result<Self> {
        let multi = MultiProgress::new();

        let epoch_bar = multi.add(ProgressBar::new(total_epochs));
        epoch_bar.set_style(bar_style("Epochs:  [{bar:40.cyan/blue}] {pos}/{len} {msg}")?);

        let batch_bar = multi.add(ProgressBar::new(batches_per_epoch));
        batch_bar.set_style(bar_style(
            "Batches: [{bar:40.green/yellow}] {pos}/{len} [{elapsed_precise}<{eta}] {msg}",
        )?);

        Ok(Self {
            epoch_bar,
            batch_bar,
            refresh_rate: refresh_rate.max(1) as u64,
            pending: 0,
            _multi: multi,
        })
    }

    /// Update the bars for one trainer event
    pub fn handle(&mut self, event: &TrainingEvent) {
        match event {
            TrainingEvent::EpochStarted { epoch, num_batches } => {
                self.epoch_bar.set_position(*epoch as u64);
                self.batch_bar.reset();
                self.batch_bar.set_length(*num_batches as u64);
                self.pending = 0;
            }
            TrainingEvent::StepCompleted { loss, lr, .. } => {
                self.pending += 1;
                if self.pending >= self.refresh_rate {
                    self.batch_bar.inc(self.pending);
                    self.batch_bar
                        .set_message(format!("loss: {:.4}, lr: {:.2e}", loss, lr));
                    self.pending = 0;
                }
            }
            TrainingEvent::ValidationCompleted { summary, .. } => {
                self.batch_bar.inc(self.pending);
                self.pending = 0;
                self.epoch_bar.inc(1);
                self.epoch_bar.set_message(format!(
                    "valid_loss: {:.4}, valid_metric: {:.4}",
                    summary.valid_loss, summary.valid_metric
                ));
            }
            TrainingEvent::CheckpointSaved { path } => {
                self.batch_bar.println(format!("saved {}", path.display()));
            }
            TrainingEvent::SwaApplied { epochs } => {
                self.epoch_bar
                    .println(format!("averaged weights of the last {} epochs", epochs));
            }
            TrainingEvent::TrainingCompleted { total_steps } => {
                self.batch_bar.finish_and_clear();
                self.epoch_bar
                    .finish_with_message(format!("done after {} steps", total_steps));
            }
            TrainingEvent::Error { error } => {
                self.batch_bar.abandon();
                self.epoch_bar.abandon_with_message(error.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::ValidationSummary;

    #[test]
    fn test_refresh_rate_batches_updates() {
        let mut progress = TrainingProgress::new(2, 10, 4).unwrap();
        progress.handle(&TrainingEvent::EpochStarted {
            epoch: 0,
            num_batches: 10,
        });
        for step in 1..=6 {
            progress.handle(&TrainingEvent::StepCompleted {
                step,
                loss: 1.0,
                lr: 1e-3,
            });
        }
        assert_eq!(progress.batch_bar.position(), 4);

        progress.handle(&TrainingEvent::ValidationCompleted {
            epoch: 0,
            summary: ValidationSummary {
                valid_loss: 0.5,
                valid_metric: 0.9,
                samples: 8,
            },
        });
        assert_eq!(progress.batch_bar.position(), 6);
        assert_eq!(progress.epoch_bar.position(), 1);
    }
}
