//! One-cycle learning rate and momentum schedule
//!
//! The learning rate rises linearly from `max_lr / div_factor` to `max_lr`
//! over the first `pct_start` of the step budget, then falls linearly to
//! `max_lr / div_factor / final_div_factor` at the last step. When momentum
//! cycling is on, AdamW's beta1 moves inversely between `max_momentum` and
//! `base_momentum`.

use serde::{Deserialize, Serialize};

use super::{Scheduler, SchedulerStateDict};
use crate::config::OneCycleConfig;
use crate::error::{Error, Result};

/// One-cycle scheduler stepped once per optimizer step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneCycleScheduler {
    /// Peak learning rate
    max_lr: f64,

    /// Total optimizer steps in the cycle
    total_steps: usize,

    /// Shape of the cycle
    config: OneCycleConfig,

    /// Current step
    current_step: usize,
}

impl OneCycleScheduler {
    /// Create a scheduler over `epochs * steps_per_epoch` steps
    pub fn new(
        max_lr: f64,
        epochs: usize,
        steps_per_epoch: usize,
        config: OneCycleConfig,
    ) -> Result<Self> {
        let total_steps = epochs * steps_per_epoch;
        if total_steps == 0 {
            return Err(Error::config(
                "one-cycle schedule needs at least one step (empty training split?)",
            ));
        }
        if !(0.0..=1.0).contains(&config.pct_start) {
            return Err(Error::config(format!(
                "pct_start must be in [0, 1], got {}",
                config.pct_start
            )));
        }
        Ok(Self {
            max_lr,
            total_steps,
            config,
            current_step: 0,
        })
    }

    /// Starting learning rate
    pub fn initial_lr(&self) -> f64 {
        self.max_lr / self.config.div_factor
    }

    /// Final learning rate
    pub fn min_lr(&self) -> f64 {
        self.initial_lr() / self.config.final_div_factor
    }

    /// Total steps in the cycle
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Current step
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Phase position of `step`: `(warmup, fraction)` where `warmup` is true
    /// in the rising phase and `fraction` runs from 0 to 1 within the phase
    fn phase(&self, step: usize) -> (bool, f64) {
        let step = step.min(self.total_steps - 1) as f64;
        let warmup_end = self.config.pct_start * self.total_steps as f64 - 1.0;
        let last = (self.total_steps - 1) as f64;

        let fraction = |start: f64, end: f64| {
            if end > start {
                ((step - start) / (end - start)).clamp(0.0, 1.0)
            } else {
                1.0
            }
        };

        if step <= warmup_end {
            (true, fraction(0.0, warmup_end))
        } else {
            (false, fraction(warmup_end, last))
        }
    }

    /// Learning rate at `step`
    pub fn lr_at(&self, step: usize) -> f64 {
        let (warmup, pct) = self.phase(step);
        if warmup {
            anneal_linear(self.initial_lr(), self.max_lr, pct)
        } else {
            anneal_linear(self.max_lr, self.min_lr(), pct)
        }
    }

    /// AdamW beta1 at `step`, if momentum cycling is enabled
    pub fn momentum_at(&self, step: usize) -> Option<f64> {
        if !self.config.cycle_momentum {
            return None;
        }
        let (warmup, pct) = self.phase(step);
        Some(if warmup {
            anneal_linear(self.config.max_momentum, self.config.base_momentum, pct)
        } else {
            anneal_linear(self.config.base_momentum, self.config.max_momentum, pct)
        })
    }
}

fn anneal_linear(start: f64, end: f64, pct: f64) -> f64 {
    (end - start) * pct + start
}

impl Scheduler for OneCycleScheduler {
    fn name(&self) -> &str {
        "one_cycle"
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn get_lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    fn get_momentum(&self) -> Option<f64> {
        self.momentum_at(self.current_step)
    }

    fn state_dict(&self) -> SchedulerStateDict {
        SchedulerStateDict {
            scheduler_type: self.name().to_string(),
            step_count: self.current_step,
            current_lr: self.get_lr(),
            base_lr: self.max_lr,
            total_steps: self.total_steps,
        }
    }

    fn load_state_dict(&mut self, state: &SchedulerStateDict) -> Result<()> {
        if state.scheduler_type != self.name() {
            return Err(Error::checkpoint(format!(
                "cannot restore a '{}' schedule into '{}'",
                state.scheduler_type,
                self.name()
            )));
        }
        if state.total_steps != self.total_steps {
            return Err(Error::checkpoint(format!(
                "schedule length changed: checkpoint {} steps, current {}",
                state.total_steps, self.total_steps
            )));
        }
        self.current_step = state.step_count;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.current_step >= self.total_steps
    }

    fn reset(&mut self) {
        self.current_step = 0;
    }
}
