//! Optimizer construction, learning rate scheduling, gradient clipping and
//! stochastic weight averaging.

pub mod schedulers;
pub mod swa;

pub use schedulers::OneCycleScheduler;
pub use swa::{StochasticWeightAveraging, SwaLrSchedule};

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Trait for learning rate schedulers
pub trait Scheduler: Send {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance one optimizer step
    fn step(&mut self);

    /// Learning rate for the current step
    fn get_lr(&self) -> f64;

    /// First-moment coefficient for the current step, if scheduled
    fn get_momentum(&self) -> Option<f64> {
        None
    }

    /// Get scheduler state for checkpointing
    fn state_dict(&self) -> SchedulerStateDict;

    /// Load scheduler state from checkpoint
    fn load_state_dict(&mut self, state: &SchedulerStateDict) -> Result<()>;

    /// Check if scheduler is done (for finite schedules)
    fn is_done(&self) -> bool {
        false
    }

    /// Reset scheduler to initial state
    fn reset(&mut self);
}

/// Scheduler state dictionary for checkpointing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateDict {
    /// Scheduler type
    pub scheduler_type: String,

    /// Current step count
    pub step_count: usize,

    /// Current learning rate
    pub current_lr: f64,

    /// Base (peak) learning rate
    pub base_lr: f64,

    /// Length of the schedule
    pub total_steps: usize,
}

/// AdamW hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 2e-5,
        }
    }
}

/// AdamW over every variable in `var_map`
pub fn build_adamw(var_map: &VarMap, config: &AdamWConfig) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr: config.learning_rate,
        beta1: config.beta1,
        beta2: config.beta2,
        eps: config.eps,
        weight_decay: config.weight_decay,
    };
    debug!(
        "AdamW over {} variables: lr={}, weight_decay={}",
        var_map.all_vars().len(),
        config.learning_rate,
        config.weight_decay
    );
    Ok(AdamW::new(var_map.all_vars(), params)?)
}

/// Push the scheduler's learning rate (and beta1, when cycled) into AdamW
pub fn apply_schedule(optimizer: &mut AdamW, scheduler: &dyn Scheduler) {
    match scheduler.get_momentum() {
        Some(beta1) => {
            let mut params = optimizer.params().clone();
            params.lr = scheduler.get_lr();
            params.beta1 = beta1;
            optimizer.set_params(params);
        }
        None => optimizer.set_learning_rate(scheduler.get_lr()),
    }
}

/// Gradient clipping by global L2 norm
#[derive(Debug, Clone)]
pub struct GradientClipper {
    max_norm: f64,
}

impl GradientClipper {
    /// Create new gradient clipper
    pub fn new(max_norm: f64) -> Self {
        Self { max_norm }
    }

    /// Threshold
    pub fn max_norm(&self) -> f64 {
        self.max_norm
    }

    /// Global L2 norm over the gradients of `vars`, accumulated in f32
    pub fn global_norm(vars: &[Var], grads: &GradStore) -> Result<f64> {
        let mut total = 0.0f64;
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sq = grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
                total += sq as f64;
            }
        }
        Ok(total.sqrt())
    }

    /// Rescale gradients so their global norm is at most `max_norm`.
    /// Returns the norm before clipping; a non-finite norm leaves the
    /// gradients untouched.
    pub fn clip(&self, vars: &[Var], grads: &mut GradStore) -> Result<f64> {
        let norm = Self::global_norm(vars, grads)?;
        if !norm.is_finite() {
            return Ok(norm);
        }

        let coef = self.max_norm / (norm + 1e-6);
        if coef < 1.0 {
            for var in vars {
                if let Some(grad) = grads.remove(var.as_tensor()) {
                    grads.insert(var.as_tensor(), (grad * coef)?);
                }
            }
        }
        Ok(norm)
    }
}
