//! Stochastic weight averaging

use std::collections::HashMap;
use std::f64::consts::PI;

use candle_core::{DType, Tensor};
use candle_nn::VarMap;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Equal-weight running average of model parameters, kept in f32
pub struct StochasticWeightAveraging {
    start_epoch: usize,
    averages: HashMap<String, Tensor>,
    n_averaged: usize,
}

impl StochasticWeightAveraging {
    /// Average the weights of every epoch from `start_epoch` (0-based) on
    pub fn new(start_epoch: usize) -> Self {
        Self {
            start_epoch,
            averages: HashMap::new(),
            n_averaged: 0,
        }
    }

    /// First averaged epoch
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Number of snapshots in the average
    pub fn n_averaged(&self) -> usize {
        self.n_averaged
    }

    /// Whether `epoch` contributes to the average
    pub fn is_active(&self, epoch: usize) -> bool {
        epoch >= self.start_epoch
    }

    /// Fold the current parameters into the average
    pub fn update(&mut self, var_map: &VarMap) -> Result<()> {
        let vars = var_map
            .data()
            .lock()
            .map_err(|_| Error::training("variable map lock poisoned"))?;

        let n = self.n_averaged as f64;
        for (name, var) in vars.iter() {
            let current = var.as_tensor().detach().to_dtype(DType::F32)?;
            let updated = match self.averages.get(name) {
                // avg + (x - avg) / (n + 1)
                Some(avg) => (avg + ((current - avg)? / (n + 1.0))?)?,
                None => current.copy()?,
            };
            self.averages.insert(name.clone(), updated.detach());
        }
        self.n_averaged += 1;

        debug!("SWA average now covers {} snapshots", self.n_averaged);
        Ok(())
    }

    /// Overwrite the parameters with the average
    pub fn apply(&self, var_map: &VarMap) -> Result<()> {
        if self.n_averaged == 0 {
            return Err(Error::training("no weights have been averaged yet"));
        }

        let vars = var_map
            .data()
            .lock()
            .map_err(|_| Error::training("variable map lock poisoned"))?;
        for (name, var) in vars.iter() {
            let avg = self
                .averages
                .get(name)
                .ok_or_else(|| Error::training(format!("no average for parameter {}", name)))?;
            var.set(&avg.to_dtype(var.dtype())?)?;
        }

        info!("Applied SWA weights averaged over {} epochs", self.n_averaged);
        Ok(())
    }
}

/// Learning rate during the averaged epochs. The one-cycle schedule stops
/// at the first averaged epoch; from there the rate anneals (cosine, per
/// epoch) from the rate reached so far to `swa_lr` and then stays flat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwaLrSchedule {
    start_lr: f64,
    swa_lr: f64,
    anneal_epochs: usize,
}

impl SwaLrSchedule {
    /// Anneal from `start_lr` to `swa_lr` (default `start_lr`)
    pub fn new(start_lr: f64, swa_lr: Option<f64>, anneal_epochs: usize) -> Self {
        Self {
            start_lr,
            swa_lr: swa_lr.unwrap_or(start_lr),
            anneal_epochs,
        }
    }

    /// Target rate
    pub fn swa_lr(&self) -> f64 {
        self.swa_lr
    }

    /// Rate for the `epochs_in`-th averaged epoch, 0 being the first
    pub fn lr_at(&self, epochs_in: usize) -> f64 {
        if self.anneal_epochs == 0 {
            return self.swa_lr;
        }
        let t = (epochs_in as f64 / self.anneal_epochs as f64).min(1.0);
        let alpha = (1.0 - (PI * t).cos()) / 2.0;
        self.swa_lr * alpha + self.start_lr * (1.0 - alpha)
    }
}
