//! Text classifier: pretrained encoder, resized head, loss and optimizer
//! configuration

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, VarMap};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::config::{Config, Precision};
use crate::encoder::{
    build_classifier, load_pretrained, EncoderConfig, SequenceClassifier, TextTokenizer, TokenBatch,
};
use crate::error::{Error, Result};
use crate::training::data::Batch;
use crate::training::loss::{scalar_value, LabelSmoothingLoss};
use crate::training::metrics::{ValidationOutputs, ValidationStepOutput, ValidationSummary};
use crate::training::optimizers::{build_adamw, AdamWConfig, OneCycleScheduler};
use crate::utils::{count_parameters, resolve_precision};

/// Sequence classifier together with everything needed to train it
pub struct TextClassifier {
    network: Box<dyn SequenceClassifier>,
    var_map: VarMap,
    tokenizer: Arc<TextTokenizer>,
    criterion: LabelSmoothingLoss,
    config: Config,
    device: Device,
    precision: Precision,
}

impl TextClassifier {
    /// Load the encoder, tokenizer and pretrained weights from the model
    /// directory and attach a fresh head of `num_classes` outputs
    #[instrument(skip(config, device))]
    pub fn new(config: &Config, device: &Device) -> Result<Self> {
        let model_dir = config.model.model_dir();
        if !model_dir.is_dir() {
            return Err(Error::model(format!(
                "model directory not found: {}",
                model_dir.display()
            )));
        }
        info!("Loading {} from {}", config.model.model_name, model_dir.display());

        let encoder_config = EncoderConfig::from_file(model_dir.join("config.json"))?;
        let tokenizer = TextTokenizer::from_model_dir(&model_dir, config.model.max_length)?;

        let classifier = Self::with_random_init(config, &encoder_config, tokenizer, device)?;
        load_pretrained(&classifier.var_map, &model_dir, device)?;
        Ok(classifier)
    }

    /// Build the network with every parameter freshly initialised
    pub fn with_random_init(
        config: &Config,
        encoder_config: &EncoderConfig,
        tokenizer: TextTokenizer,
        device: &Device,
    ) -> Result<Self> {
        if tokenizer.vocab_size() > encoder_config.vocab_size {
            return Err(Error::model(format!(
                "tokenizer has {} entries but the encoder only embeds {}",
                tokenizer.vocab_size(),
                encoder_config.vocab_size
            )));
        }

        if let Err(e) = device.set_seed(config.training.seed) {
            debug!("Device RNG not seeded: {}", e);
        }

        let precision = resolve_precision(config.device.precision, device);
        let var_map = VarMap::new();
        let network = build_classifier(
            &var_map,
            encoder_config,
            config.model.num_classes,
            config.model.drop_rate,
            precision.dtype(),
            device,
        )?;

        let classifier =
            Self::from_parts(Box::new(network), var_map, tokenizer, config, device, precision)?;
        info!(
            "Classifier ready: {} parameters, {} classes, {:?} compute",
            count_parameters(&classifier.var_map),
            config.model.num_classes,
            precision
        );
        Ok(classifier)
    }

    /// Assemble from an already built network running in `precision`
    pub fn from_parts(
        network: Box<dyn SequenceClassifier>,
        var_map: VarMap,
        tokenizer: TextTokenizer,
        config: &Config,
        device: &Device,
        precision: Precision,
    ) -> Result<Self> {
        if network.num_classes() != config.model.num_classes {
            return Err(Error::model(format!(
                "network has {} outputs, configuration asks for {}",
                network.num_classes(),
                config.model.num_classes
            )));
        }
        Ok(Self {
            network,
            var_map,
            tokenizer: Arc::new(tokenizer),
            criterion: LabelSmoothingLoss::new(config.model.num_classes, config.training.smooth)?,
            config: config.clone(),
            device: device.clone(),
            precision,
        })
    }

    /// Raw logits `[batch, num_classes]`
    pub fn forward(&self, tokens: &TokenBatch, train: bool) -> Result<Tensor> {
        self.network.forward(tokens, train)
    }

    /// Label-smoothed loss of a training batch, dropout active
    pub fn training_step(&self, batch: &Batch) -> Result<Tensor> {
        let logits = self.forward(&batch.tokens, true)?;
        self.criterion.forward(&logits, &batch.labels)
    }

    /// Loss and logits of a validation batch, dropout disabled
    pub fn validation_step(&self, batch: &Batch) -> Result<ValidationStepOutput> {
        let logits = self.forward(&batch.tokens, false)?;
        let loss = scalar_value(&self.criterion.forward(&logits, &batch.labels)?)?;
        Ok(ValidationStepOutput {
            labels: batch.labels.clone(),
            logits,
            loss,
        })
    }

    /// Reduce the epoch's validation outputs to loss and accuracy
    pub fn validation_epoch_end(&self, outputs: &ValidationOutputs) -> Result<ValidationSummary> {
        if outputs.is_empty() {
            return Err(Error::training("validation produced no outputs"));
        }
        outputs.summarize()
    }

    /// AdamW over every parameter plus a one-cycle schedule spanning
    /// `n_epochs * steps_per_epoch` optimizer steps
    pub fn configure_optimizers(&self, steps_per_epoch: usize) -> Result<(AdamW, OneCycleScheduler)> {
        let training = &self.config.training;
        let scheduler = OneCycleScheduler::new(
            training.learning_rate,
            training.n_epochs,
            steps_per_epoch,
            training.scheduler.clone(),
        )?;

        let adamw = AdamWConfig {
            learning_rate: scheduler.initial_lr(),
            beta1: training.scheduler.max_momentum,
            weight_decay: training.weight_decay,
            ..AdamWConfig::default()
        };
        let optimizer = build_adamw(&self.var_map, &adamw)?;
        Ok((optimizer, scheduler))
    }

    /// Hyperparameters recorded with each run
    pub fn hparams(&self) -> Value {
        let c = &self.config;
        json!({
            "learning_rate": c.training.learning_rate,
            "batch_size": c.training.batch_size,
            "n_epochs": c.training.n_epochs,
            "model_name": c.model.model_name,
            "fold": c.fold(),
            "drop_rate": c.model.drop_rate,
            "num_classes": c.model.num_classes,
            "smooth": c.training.smooth,
            "max_length": c.model.max_length,
            "imbalance_sample": c.training.imbalance_sample,
            "weight_decay": c.training.weight_decay,
            "gradient_clip_val": c.training.gradient_clip_val,
            "precision": format!("{:?}", self.precision),
            "swa": c.training.swa.enabled,
            "swa_lr": c.training.swa.swa_lr,
            "seed": c.training.seed,
            "parameters": count_parameters(&self.var_map),
        })
    }

    /// Parameter store
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Shared tokenizer
    pub fn tokenizer(&self) -> Arc<TextTokenizer> {
        Arc::clone(&self.tokenizer)
    }

    /// Run configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Device holding the parameters
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Precision of the forward pass; parameters are always f32
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Compute dtype of the forward pass
    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.network.num_classes()
    }
}
