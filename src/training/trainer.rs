//! Fold trainer for the text classifier
//!
//! Runs the epoch loop: shuffled training batches with optimizer and
//! schedule stepping, optional loss scaling and gradient clipping, then a
//! full validation pass, metric logging, checkpointing and stochastic weight
//! averaging.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::{Device, Var};
use candle_nn::{AdamW, Optimizer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::TextClassifier;
use crate::training::checkpoints::{CheckpointManager, CheckpointMetadata};
use crate::training::data::{
    DataLoader, DataLoaderConfig, FoldData, SamplingStrategy, TextClassificationDataset,
};
use crate::training::loss::{scalar_value, LossScaler, LossScalingConfig};
use crate::training::metrics::{
    MetricsTracker, OfflineRunExporter, ValidationOutputs, ValidationSummary,
};
use crate::training::optimizers::{
    apply_schedule, GradientClipper, OneCycleScheduler, Scheduler, StochasticWeightAveraging,
    SwaLrSchedule,
};

/// Trainer for one cross-validation fold
pub struct ClassifierTrainer {
    /// Model being trained
    model: TextClassifier,

    /// Training data loader
    train_loader: DataLoader<TextClassificationDataset>,

    /// Validation data loader
    valid_loader: DataLoader<TextClassificationDataset>,

    /// Checkpoint manager
    checkpoints: CheckpointManager,

    /// Metrics tracker
    metrics: MetricsTracker,

    /// Training state
    state: TrainingState,

    /// Event channel for monitoring
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch (0-based)
    pub epoch: usize,

    /// Current step within epoch
    pub step: usize,

    /// Global step across all epochs
    pub global_step: usize,

    /// Best validation score
    pub best_score: Option<f64>,

    /// Training start time
    pub start_time: DateTime<Utc>,

    /// Training status
    pub status: TrainingStatus,

    /// Current learning rate
    pub current_lr: f64,

    /// Current loss scale, when scaling is active
    pub loss_scale: Option<f64>,

    /// Optimizer steps skipped on gradient overflow
    pub skipped_steps: usize,
}

impl TrainingState {
    fn new() -> Self {
        Self {
            epoch: 0,
            step: 0,
            global_step: 0,
            best_score: None,
            start_time: Utc::now(),
            status: TrainingStatus::NotStarted,
            current_lr: 0.0,
            loss_scale: None,
            skipped_steps: 0,
        }
    }
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    /// `fit` not called yet
    NotStarted,
    /// Inside the epoch loop
    Running,
    /// Every epoch finished
    Completed,
    /// Stopped on an error
    Failed {
        /// Error message
        error: String,
    },
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize, num_batches: usize },
    StepCompleted { step: usize, loss: f64, lr: f64 },
    ValidationCompleted { epoch: usize, summary: ValidationSummary },
    CheckpointSaved { path: PathBuf },
    SwaApplied { epochs: usize },
    TrainingCompleted { total_steps: usize },
    Error { error: String },
}

/// Training result information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Training state at completion
    pub final_state: TrainingState,

    /// Validation summary of every epoch run
    pub history: Vec<ValidationSummary>,

    /// Path to best model checkpoint
    pub best_checkpoint_path: Option<PathBuf>,

    /// Path to the rolling checkpoint
    pub last_checkpoint_path: PathBuf,

    /// Training duration
    pub training_duration: Duration,

    /// Total training steps
    pub total_steps: usize,
}

/// Per-run optimisation state built at the start of `fit`
struct StepContext {
    optimizer: AdamW,
    scheduler: OneCycleScheduler,
    vars: Vec<Var>,
    clipper: Option<GradientClipper>,
    scaler: LossScaler,
    /// Fixed rate for the current epoch while averaging; the one-cycle
    /// schedule is not stepped while set
    held_lr: Option<f64>,
}

impl ClassifierTrainer {
    /// Prepare the fold, load the pretrained model and wire up loaders,
    /// checkpoints and logging
    #[instrument(skip(config, device))]
    pub fn from_config(config: &Config, device: &Device) -> Result<Self> {
        config.validate()?;
        let fold_data = FoldData::prepare(&config.data, config.training.seed)?;
        let model = TextClassifier::new(config, device)?;
        Self::new(model, fold_data)
    }

    /// Create a trainer for an already built model and prepared fold
    pub fn new(model: TextClassifier, fold_data: FoldData) -> Result<Self> {
        let config = model.config().clone();
        let tokenizer = model.tokenizer();
        let device = model.device().clone();

        let train_set = Arc::new(TextClassificationDataset::new(fold_data.train, Arc::clone(&tokenizer)));
        let valid_set = Arc::new(TextClassificationDataset::new(fold_data.valid, tokenizer));

        let sampling = if config.training.imbalance_sample {
            SamplingStrategy::Imbalanced
        } else {
            SamplingStrategy::Shuffle
        };
        let train_loader = DataLoader::new(
            train_set,
            DataLoaderConfig {
                batch_size: config.training.batch_size,
                sampling,
                num_workers: config.data.num_workers,
                drop_last: false,
            },
            config.training.seed,
            device.clone(),
        )?;
        let valid_loader = DataLoader::new(
            valid_set,
            DataLoaderConfig {
                batch_size: config.training.batch_size,
                sampling: SamplingStrategy::Sequential,
                num_workers: config.data.num_workers,
                drop_last: false,
            },
            config.training.seed,
            device,
        )?;

        let version = format!("{}_{}", config.logging.tag, fold_data.fold);
        // an earlier best only counts when continuing that run
        let checkpoints = CheckpointManager::new(
            &config.checkpoint,
            &config.logging.project,
            &version,
            config.training.resume_from.is_some(),
        )?;
        let exporter = OfflineRunExporter::create(
            &config.logging.log_dir,
            &config.logging.project,
            &config.logging.tag,
            &version,
        )?;
        let metrics = MetricsTracker::new(config.logging.log_every_n_steps).with_exporter(Box::new(exporter));

        info!(
            "Fold {}: {} training batches, {} validation batches per epoch",
            fold_data.fold,
            train_loader.num_batches(),
            valid_loader.num_batches()
        );

        Ok(Self {
            model,
            train_loader,
            valid_loader,
            checkpoints,
            metrics,
            state: TrainingState::new(),
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Training batches per epoch
    pub fn steps_per_epoch(&self) -> usize {
        self.train_loader.num_batches()
    }

    /// Current training state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Model being trained
    pub fn model(&self) -> &TextClassifier {
        &self.model
    }

    /// Metrics logged so far
    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    /// Train for the configured number of epochs
    pub fn fit(&mut self) -> Result<TrainingResult> {
        info!("Starting training");
        let training_start = Instant::now();
        self.state.status = TrainingStatus::Running;
        self.state.start_time = Utc::now();

        let outcome = self.run_training_loop();

        let result = match outcome {
            Ok(history) => {
                self.state.status = TrainingStatus::Completed;
                TrainingResult {
                    final_state: self.state.clone(),
                    history,
                    best_checkpoint_path: self.checkpoints.best_checkpoint_path(),
                    last_checkpoint_path: self.checkpoints.last_checkpoint_path(),
                    training_duration: training_start.elapsed(),
                    total_steps: self.state.global_step,
                }
            }
            Err(e) => {
                let error_msg = format!("Training failed: {}", e);
                error!("{}", error_msg);
                self.state.status = TrainingStatus::Failed {
                    error: error_msg.clone(),
                };
                self.send_event(TrainingEvent::Error { error: error_msg });
                return Err(e);
            }
        };

        self.metrics.flush()?;
        info!("Training completed in {:?}", result.training_duration);
        self.send_event(TrainingEvent::TrainingCompleted {
            total_steps: result.total_steps,
        });
        Ok(result)
    }

    fn run_training_loop(&mut self) -> Result<Vec<ValidationSummary>> {
        let mut ctx = self.initialize_training()?;
        let n_epochs = self.model.config().training.n_epochs;
        let swa_config = self.model.config().training.swa.clone();
        let mut swa = swa_config
            .enabled
            .then(|| StochasticWeightAveraging::new(swa_config.start_epoch(n_epochs)));
        let mut swa_lr: Option<SwaLrSchedule> = None;

        let start_epoch = self.state.epoch;
        let mut history = Vec::new();

        for epoch in start_epoch..n_epochs {
            self.state.epoch = epoch;
            if let Some(swa) = swa.as_ref().filter(|swa| swa.is_active(epoch)) {
                let schedule = *swa_lr.get_or_insert_with(|| {
                    let schedule = SwaLrSchedule::new(
                        ctx.scheduler.get_lr(),
                        swa_config.swa_lr,
                        swa_config.anneal_epochs,
                    );
                    info!(
                        "Averaging weights from epoch {}, learning rate to {:.3e}",
                        epoch,
                        schedule.swa_lr()
                    );
                    schedule
                });
                ctx.held_lr = Some(schedule.lr_at(epoch - swa.start_epoch()));
            }
            self.send_event(TrainingEvent::EpochStarted {
                epoch,
                num_batches: self.train_loader.num_batches(),
            });

            let train_loss = self.train_epoch(epoch, &mut ctx)?;
            let summary = self.validate()?;
            self.metrics.log_epoch(self.state.global_step, epoch, &summary)?;
            self.send_event(TrainingEvent::ValidationCompleted { epoch, summary });

            info!(
                "Epoch {}/{}: train_loss={:.4}, valid_loss={:.4}, valid_metric={:.4}",
                epoch + 1,
                n_epochs,
                train_loss,
                summary.valid_loss,
                summary.valid_metric
            );

            if let Some(swa) = swa.as_mut().filter(|swa| swa.is_active(epoch)) {
                swa.update(self.model.var_map())?;
            }

            let mut metadata = CheckpointMetadata::new(epoch, self.state.global_step);
            metadata.metrics.insert("train_loss".to_string(), train_loss);
            metadata.metrics.insert("valid_loss".to_string(), summary.valid_loss);
            metadata.metrics.insert("valid_metric".to_string(), summary.valid_metric);
            metadata.scheduler = Some(ctx.scheduler.state_dict());

            for path in self.checkpoints.save(self.model.var_map(), &metadata)? {
                self.send_event(TrainingEvent::CheckpointSaved { path });
            }
            self.state.best_score = self.checkpoints.best().map(|b| b.score);
            history.push(summary);
        }

        if let Some(swa) = swa.filter(|swa| swa.n_averaged() > 0) {
            swa.apply(self.model.var_map())?;

            let mut metadata = CheckpointMetadata::new(self.state.epoch, self.state.global_step);
            if let Some(last) = history.last() {
                metadata.metrics.insert("valid_metric".to_string(), last.valid_metric);
            }
            metadata.scheduler = Some(ctx.scheduler.state_dict());
            metadata.swa = true;

            let path = self.checkpoints.save_last(self.model.var_map(), &metadata)?;
            self.send_event(TrainingEvent::SwaApplied {
                epochs: swa.n_averaged(),
            });
            self.send_event(TrainingEvent::CheckpointSaved { path });
        }

        Ok(history)
    }

    /// Build the optimizer, schedule, clipper and scaler, resuming when asked
    fn initialize_training(&mut self) -> Result<StepContext> {
        let steps_per_epoch = self.train_loader.num_batches();
        let (optimizer, mut scheduler) = self.model.configure_optimizers(steps_per_epoch)?;
        let training = self.model.config().training.clone();

        if let Some(path) = &training.resume_from {
            info!("Resuming from checkpoint: {}", path.display());
            let metadata = CheckpointManager::load(path, self.model.var_map(), self.model.device())?;
            if let Some(state) = &metadata.scheduler {
                scheduler.load_state_dict(state)?;
            }
            self.state.epoch = metadata.epoch + 1;
            self.state.global_step = metadata.global_step;
        }

        let scaling = if self.model.precision().needs_loss_scaling() {
            info!("Mixed precision training with dynamic loss scaling");
            LossScalingConfig::default()
        } else {
            LossScalingConfig::disabled()
        };
        let scaler = LossScaler::new(scaling);
        self.state.loss_scale = scaler.is_enabled().then(|| scaler.get_scale());

        self.metrics.log_hparams(&self.model.hparams())?;

        Ok(StepContext {
            optimizer,
            scheduler,
            vars: self.model.var_map().all_vars(),
            clipper: training.gradient_clip_val.map(GradientClipper::new),
            scaler,
            held_lr: None,
        })
    }

    /// One pass over the training loader; returns the mean batch loss
    fn train_epoch(&mut self, epoch: usize, ctx: &mut StepContext) -> Result<f64> {
        let mut loss_sum = 0.0;
        let mut batches = 0usize;
        self.state.step = 0;

        for batch in self.train_loader.epoch() {
            let batch = batch?;

            let lr = match ctx.held_lr {
                Some(lr) => {
                    ctx.optimizer.set_learning_rate(lr);
                    lr
                }
                None => {
                    apply_schedule(&mut ctx.optimizer, &ctx.scheduler);
                    ctx.scheduler.get_lr()
                }
            };

            let loss = self.model.training_step(&batch)?;
            let loss_value = scalar_value(&loss)?;
            if !loss_value.is_finite() && !ctx.scaler.is_enabled() {
                return Err(Error::training(format!(
                    "non-finite loss {} at step {}",
                    loss_value, self.state.global_step
                )));
            }

            let mut grads = ctx.scaler.scale_loss(&loss)?.backward()?;
            ctx.scaler.unscale_gradients(&ctx.vars, &mut grads)?;
            let norm = match &ctx.clipper {
                Some(clipper) => clipper.clip(&ctx.vars, &mut grads)?,
                None if ctx.scaler.is_enabled() => GradientClipper::global_norm(&ctx.vars, &grads)?,
                None => 0.0,
            };

            if norm.is_finite() {
                ctx.optimizer.step(&grads)?;
                ctx.scaler.update_scale(false);
            } else if ctx.scaler.is_enabled() {
                ctx.scaler.update_scale(true);
                self.state.skipped_steps += 1;
                debug!(
                    "Gradient overflow at step {}, skipping update (scale now {})",
                    self.state.global_step,
                    ctx.scaler.get_scale()
                );
            } else {
                return Err(Error::training(format!(
                    "non-finite gradient norm at step {}",
                    self.state.global_step
                )));
            }
            if ctx.held_lr.is_none() {
                ctx.scheduler.step();
            }

            self.state.step += 1;
            self.state.global_step += 1;
            self.state.current_lr = lr;
            self.state.loss_scale = ctx.scaler.is_enabled().then(|| ctx.scaler.get_scale());

            if loss_value.is_finite() {
                loss_sum += loss_value;
                batches += 1;
            }
            self.metrics.log_step(self.state.global_step, epoch, loss_value, lr)?;
            self.send_event(TrainingEvent::StepCompleted {
                step: self.state.global_step,
                loss: loss_value,
                lr,
            });
        }

        if batches == 0 {
            warn!("Epoch {} produced no finite training loss", epoch);
            return Ok(f64::NAN);
        }
        Ok(loss_sum / batches as f64)
    }

    /// Full pass over the validation loader
    pub fn validate(&mut self) -> Result<ValidationSummary> {
        let mut outputs = ValidationOutputs::new();
        for batch in self.valid_loader.epoch() {
            outputs.push(&self.model.validation_step(&batch?)?)?;
        }
        self.model.validation_epoch_end(&outputs)
    }

    /// Send training event
    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.send(event).is_err() {
                debug!("Event receiver dropped");
            }
        }
    }
}
