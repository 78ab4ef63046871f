//! Configuration structures for the SolverText harness
//!
//! Defaults reproduce the baseline run: a Chinese RoBERTa-wwm encoder
//! fine-tuned on 137 classes for 30 epochs. Values can be layered from a
//! JSON/YAML/TOML file and `SOLVERTEXT__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable prefix used for configuration overrides
pub const ENV_PREFIX: &str = "SOLVERTEXT";

/// Main configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Encoder and classification head configuration
    pub model: ModelConfig,
    /// Optimisation hyperparameters
    pub training: TrainingConfig,
    /// Dataset locations and fold selection
    pub data: DataConfig,
    /// Device and precision
    pub device: DeviceConfig,
    /// Checkpoint persistence
    pub checkpoint: CheckpointConfig,
    /// Experiment logging
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            data: DataConfig::default(),
            device: DeviceConfig::default(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file, without environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_layered(Some(path.as_ref()), false)
    }

    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_layered(path, true)
    }

    fn load_layered(path: Option<&Path>, with_env: bool) -> Result<Self> {
        let defaults = serde_json::to_string(&Config::default())?;
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults,
            config::FileFormat::Json,
        ));

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        if with_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        self.data.validate()?;
        self.checkpoint.validate()?;

        if self.logging.log_every_n_steps == 0 {
            return Err(Error::config("log_every_n_steps must be > 0"));
        }
        if self.logging.project.trim().is_empty() || self.logging.tag.trim().is_empty() {
            return Err(Error::config("project and tag must not be empty"));
        }

        Ok(())
    }

    /// Fold index after resolving negative (from-the-end) values
    pub fn fold(&self) -> usize {
        self.data.resolved_fold().unwrap_or_default()
    }

    /// Run version string, `<tag>_<fold>`
    pub fn run_version(&self) -> String {
        format!("{}_{}", self.logging.tag, self.fold())
    }
}

/// Encoder and classification head configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier or local directory
    pub model_name: String,
    /// Directory under which model identifiers are resolved
    pub cache_dir: PathBuf,
    /// Number of target classes
    pub num_classes: usize,
    /// Dropout probability applied before the classifier
    pub drop_rate: f32,
    /// Maximum tokenized sequence length
    pub max_length: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: "hfl/chinese-roberta-wwm-ext".to_string(),
            cache_dir: PathBuf::from("models"),
            num_classes: 137,
            drop_rate: 0.3,
            max_length: 256,
        }
    }
}

impl ModelConfig {
    /// Resolve the model directory: the name itself if it is a directory,
    /// otherwise `<cache_dir>/<model_name>`
    pub fn model_dir(&self) -> PathBuf {
        let direct = PathBuf::from(&self.model_name);
        if direct.is_dir() {
            direct
        } else {
            self.cache_dir.join(&self.model_name)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(Error::config("num_classes must be >= 2"));
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(Error::config("drop_rate must be in [0, 1)"));
        }
        // [CLS] and [SEP] always occupy two positions
        if self.max_length < 2 {
            return Err(Error::config("max_length must be >= 2"));
        }
        Ok(())
    }
}

/// Optimisation hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Peak learning rate of the one-cycle schedule
    pub learning_rate: f64,
    /// Batch size for both loaders
    pub batch_size: usize,
    /// Number of epochs
    pub n_epochs: usize,
    /// Label smoothing factor
    pub smooth: f64,
    /// AdamW decoupled weight decay
    pub weight_decay: f64,
    /// Global gradient norm threshold, `None` disables clipping
    pub gradient_clip_val: Option<f64>,
    /// One-cycle schedule shape
    pub scheduler: OneCycleConfig,
    /// Draw training batches with inverse class frequency weights
    pub imbalance_sample: bool,
    /// Stochastic weight averaging
    pub swa: SwaConfig,
    /// Seed for splitting, shuffling and head initialisation
    pub seed: u64,
    /// Checkpoint to resume from
    pub resume_from: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-5,
            batch_size: 64,
            n_epochs: 30,
            smooth: 0.1,
            weight_decay: 2e-5,
            gradient_clip_val: Some(0.5),
            scheduler: OneCycleConfig::default(),
            imbalance_sample: false,
            swa: SwaConfig::default(),
            seed: 0,
            resume_from: None,
        }
    }
}

impl TrainingConfig {
    fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(Error::config("learning_rate must be a positive number"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if self.n_epochs == 0 {
            return Err(Error::config("n_epochs must be > 0"));
        }
        if !(0.0..1.0).contains(&self.smooth) {
            return Err(Error::config("smooth must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("weight_decay must be >= 0"));
        }
        if let Some(clip) = self.gradient_clip_val {
            if clip <= 0.0 {
                return Err(Error::config("gradient_clip_val must be > 0"));
            }
        }
        self.scheduler.validate()?;
        if self.swa.enabled && !(self.swa.epoch_start > 0.0 && self.swa.epoch_start <= 1.0) {
            return Err(Error::config("swa.epoch_start must be in (0, 1]"));
        }
        if let Some(lr) = self.swa.swa_lr {
            if lr <= 0.0 || !lr.is_finite() {
                return Err(Error::config("swa.swa_lr must be a positive number"));
            }
        }
        Ok(())
    }
}

/// One-cycle learning rate schedule parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OneCycleConfig {
    /// Fraction of the cycle spent increasing the learning rate
    pub pct_start: f64,
    /// `initial_lr = max_lr / div_factor`
    pub div_factor: f64,
    /// `min_lr = initial_lr / final_div_factor`
    pub final_div_factor: f64,
    /// Cycle AdamW beta1 inversely to the learning rate
    pub cycle_momentum: bool,
    /// Lower momentum bound
    pub base_momentum: f64,
    /// Upper momentum bound
    pub max_momentum: f64,
}

impl Default for OneCycleConfig {
    fn default() -> Self {
        Self {
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 30.0,
            cycle_momentum: true,
            base_momentum: 0.85,
            max_momentum: 0.95,
        }
    }
}

impl OneCycleConfig {
    fn validate(&self) -> Result<()> {
        if !(self.pct_start > 0.0 && self.pct_start < 1.0) {
            return Err(Error::config("scheduler.pct_start must be in (0, 1)"));
        }
        if self.div_factor <= 0.0 || self.final_div_factor <= 0.0 {
            return Err(Error::config("scheduler divide factors must be > 0"));
        }
        if self.cycle_momentum && self.base_momentum > self.max_momentum {
            return Err(Error::config("base_momentum must not exceed max_momentum"));
        }
        Ok(())
    }
}

/// Stochastic weight averaging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwaConfig {
    /// Average weights over the final epochs
    pub enabled: bool,
    /// Fraction of the epoch budget after which averaging starts
    pub epoch_start: f64,
    /// Learning rate held while averaging; `None` keeps the rate reached at
    /// the first averaged epoch
    pub swa_lr: Option<f64>,
    /// Epochs of cosine annealing towards `swa_lr`
    pub anneal_epochs: usize,
}

impl Default for SwaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            epoch_start: 0.8,
            swa_lr: None,
            anneal_epochs: 10,
        }
    }
}

impl SwaConfig {
    /// First (0-based) epoch whose weights enter the average
    pub fn start_epoch(&self, n_epochs: usize) -> usize {
        let start = (self.epoch_start * n_epochs as f64).floor() as usize;
        start.min(n_epochs.saturating_sub(1))
    }
}

/// Dataset locations and fold selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Root data directory
    pub data_dir: PathBuf,
    /// Labeled file tree, relative to `data_dir`: `<label>/<file>`
    pub train_subdir: String,
    /// Tab-separated side table, relative to `data_dir`
    pub text_table: String,
    /// Number of cross-validation folds
    pub n_splits: usize,
    /// Fold used for validation; negative values count from the end
    pub fold: i64,
    /// Tokenization worker threads, 0 for one per core
    pub num_workers: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            train_subdir: "train".to_string(),
            text_table: "train.tsv".to_string(),
            n_splits: 5,
            fold: -1,
            num_workers: 4,
        }
    }
}

impl DataConfig {
    /// Directory holding `<label>/<file>` entries
    pub fn train_dir(&self) -> PathBuf {
        self.data_dir.join(&self.train_subdir)
    }

    /// Path of the text side table
    pub fn text_table_path(&self) -> PathBuf {
        self.data_dir.join(&self.text_table)
    }

    /// Fold index in `0..n_splits`
    pub fn resolved_fold(&self) -> Result<usize> {
        let n = self.n_splits as i64;
        let fold = if self.fold < 0 { n + self.fold } else { self.fold };
        if fold < 0 || fold >= n {
            return Err(Error::config(format!(
                "fold {} out of range for {} splits",
                self.fold, self.n_splits
            )));
        }
        Ok(fold as usize)
    }

    fn validate(&self) -> Result<()> {
        if self.n_splits < 2 {
            return Err(Error::config("n_splits must be >= 2"));
        }
        self.resolved_fold()?;
        Ok(())
    }
}

/// Device and precision configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device selection: `cpu`, a CUDA ordinal list such as `0` or `0,1`,
    /// `cuda:N` or `metal:N`
    pub gpus: String,
    /// Numeric precision for weights and activations
    pub precision: Precision,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gpus: "0".to_string(),
            precision: Precision::F16,
        }
    }
}

/// Forward-pass precision; parameters and optimizer state stay f32
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Full precision
    F32,
    /// bfloat16 compute, f32 loss
    Bf16,
    /// float16 compute, f32 loss, dynamic loss scaling
    F16,
}

impl Precision {
    /// Compute dtype of the forward pass
    pub fn dtype(&self) -> candle_core::DType {
        match self {
            Precision::F32 => candle_core::DType::F32,
            Precision::Bf16 => candle_core::DType::BF16,
            Precision::F16 => candle_core::DType::F16,
        }
    }

    /// Whether gradients need dynamic loss scaling
    pub fn needs_loss_scaling(&self) -> bool {
        matches!(self, Precision::F16)
    }
}

/// Checkpoint persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Root directory for checkpoints
    pub dir: PathBuf,
    /// Metric watched for the best checkpoint
    pub monitor: String,
    /// Whether higher monitored values are better
    pub mode_max: bool,
    /// Number of best checkpoints retained
    pub save_top_k: usize,
    /// Always write a `last` checkpoint
    pub save_last: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            monitor: "valid_metric".to_string(),
            mode_max: true,
            save_top_k: 1,
            save_last: true,
        }
    }
}

impl CheckpointConfig {
    fn validate(&self) -> Result<()> {
        if self.monitor.is_empty() {
            return Err(Error::config("checkpoint.monitor must not be empty"));
        }
        Ok(())
    }
}

/// Experiment logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Project name
    pub project: String,
    /// Run name
    pub tag: String,
    /// Root directory for offline run logs
    pub log_dir: PathBuf,
    /// Step interval for training scalars
    pub log_every_n_steps: usize,
    /// Progress bar refresh interval in steps
    pub progress_bar_refresh_rate: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            project: "baseline".to_string(),
            tag: "rbt_drop0.3_ep30_lr2e-5_bs64_mlen256".to_string(),
            log_dir: PathBuf::from("runs"),
            log_every_n_steps: 50,
            progress_bar_refresh_rate: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.num_classes, 137);
        assert_eq!(config.training.n_epochs, 30);
        assert_eq!(config.fold(), 4);
    }

    #[test]
    fn test_negative_fold_resolution() {
        let mut data = DataConfig::default();
        data.fold = -5;
        assert_eq!(data.resolved_fold().unwrap(), 0);
        data.fold = 2;
        assert_eq!(data.resolved_fold().unwrap(), 2);
        data.fold = 5;
        assert!(data.resolved_fold().is_err());
        data.fold = -6;
        assert!(data.resolved_fold().is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.model.num_classes = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.smooth = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.gradient_clip_val = Some(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"training": {"batch_size": 8}, "data": {"fold": 1}}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.fold(), 1);
        assert_eq!(config.model.max_length, 256);
    }

    #[test]
    fn test_yaml_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, "model:\n  num_classes: 10\ndevice:\n  precision: f32\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.model.num_classes, 10);
        assert_eq!(config.device.precision, Precision::F32);
    }

    #[test]
    fn test_swa_start_epoch() {
        let swa = SwaConfig::default();
        assert_eq!(swa.start_epoch(30), 24);
        assert_eq!(swa.start_epoch(1), 0);
        assert_eq!(swa.swa_lr, None);
    }

    #[test]
    fn test_only_f16_scales_the_loss() {
        assert!(Precision::F16.needs_loss_scaling());
        assert!(!Precision::Bf16.needs_loss_scaling());
        assert!(!Precision::F32.needs_loss_scaling());
    }

    #[test]
    fn test_swa_lr_must_be_positive() {
        let mut config = Config::default();
        config.training.swa.swa_lr = Some(0.0);
        assert!(config.validate().is_err());
        config.training.swa.swa_lr = Some(1e-5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_version() {
        let config = Config::default();
        assert_eq!(config.run_version(), "rbt_drop0.3_ep30_lr2e-5_bs64_mlen256_4");
    }
}
