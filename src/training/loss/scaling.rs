//! Dynamic loss scaling for float16 training

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Loss scaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossScalingConfig {
    /// Whether scaling is active
    pub enabled: bool,
    /// Starting scale
    pub initial_scale: f64,
    /// Multiplier after `growth_interval` finite steps
    pub growth_factor: f64,
    /// Multiplier on overflow
    pub backoff_factor: f64,
    /// Consecutive finite steps before growing
    pub growth_interval: usize,
    /// Scale floor
    pub min_scale: f64,
}

impl Default for LossScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
        }
    }
}

impl LossScalingConfig {
    /// Scaling switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Dynamic loss scaler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossScaler {
    config: LossScalingConfig,
    current_scale: f64,
    consecutive_good_steps: usize,
    skipped_steps: usize,
}

impl LossScaler {
    /// Create new loss scaler
    pub fn new(config: LossScalingConfig) -> Self {
        Self {
            current_scale: config.initial_scale,
            config,
            consecutive_good_steps: 0,
            skipped_steps: 0,
        }
    }

    /// Whether scaling is active
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Scale loss tensor
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if self.config.enabled {
            Ok((loss * self.current_scale)?)
        } else {
            Ok(loss.clone())
        }
    }

    /// Divide the gradients of `vars` by the current scale
    pub fn unscale_gradients(&self, vars: &[Var], grads: &mut GradStore) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let inv = 1.0 / self.current_scale;
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * inv)?);
            }
        }
        Ok(())
    }

    /// Update loss scale based on gradient overflow
    pub fn update_scale(&mut self, has_overflow: bool) {
        if !self.config.enabled {
            return;
        }

        if has_overflow {
            self.current_scale = (self.current_scale * self.config.backoff_factor).max(self.config.min_scale);
            self.consecutive_good_steps = 0;
            self.skipped_steps += 1;
            debug!("Loss scale decreased to {:.1} due to overflow", self.current_scale);
        } else {
            self.consecutive_good_steps += 1;
            if self.consecutive_good_steps >= self.config.growth_interval {
                self.current_scale *= self.config.growth_factor;
                self.consecutive_good_steps = 0;
                debug!("Loss scale increased to {:.1}", self.current_scale);
            }
        }
    }

    /// Get current scale
    pub fn get_scale(&self) -> f64 {
        self.current_scale
    }

    /// Optimizer steps skipped because of overflow
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }
}
