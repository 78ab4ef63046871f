//! Common utilities for testing the training pipeline

use std::path::Path;

use candle_core::Device;

use crate::config::{Config, Precision};
use crate::encoder::{EncoderConfig, TextTokenizer};
use crate::model::TextClassifier;

/// Characters every test text is drawn from
pub const TEST_CHARS: &str = "我们今天学习中文本分类很好气明日数据模型训练";

/// Create a test device (CPU for CI compatibility)
pub fn create_test_device() -> Device {
    Device::Cpu
}

/// Special tokens followed by one entry per test character
pub fn test_vocab() -> Vec<String> {
    let mut vocab: Vec<String> = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    vocab.extend(TEST_CHARS.chars().map(|c| c.to_string()));
    vocab
}

/// Two-layer encoder small enough to train in a unit test
pub fn tiny_encoder_config() -> EncoderConfig {
    let json = serde_json::json!({
        "vocab_size": test_vocab().len(),
        "hidden_size": 32,
        "num_hidden_layers": 2,
        "num_attention_heads": 2,
        "intermediate_size": 64,
        "hidden_act": "gelu",
        "hidden_dropout_prob": 0.1,
        "attention_probs_dropout_prob": 0.1,
        "max_position_embeddings": 64,
        "type_vocab_size": 2,
        "layer_norm_eps": 1e-12,
        "pad_token_id": 0
    });
    EncoderConfig::from_json_str(&json.to_string()).unwrap()
}

/// Create a minimal test configuration rooted at `root`
pub fn create_test_config(root: &Path) -> Config {
    let mut config = Config::default();

    config.model.model_name = root.join("model").to_string_lossy().into_owned();
    config.model.num_classes = 3;
    config.model.max_length = 16;
    config.model.drop_rate = 0.1;

    config.training.learning_rate = 1e-3;
    config.training.batch_size = 4;
    config.training.n_epochs = 2;
    config.training.swa.epoch_start = 0.5;

    config.data.data_dir = root.join("data");
    config.data.fold = 0;
    config.data.num_workers = 2;

    config.device.gpus = "cpu".to_string();
    config.device.precision = Precision::F32;

    config.checkpoint.dir = root.join("checkpoints");
    config.logging.log_dir = root.join("runs");
    config.logging.project = "test".to_string();
    config.logging.tag = "tiny".to_string();
    config.logging.log_every_n_steps = 1;

    config
}

/// Randomly initialised classifier over the test vocabulary
pub fn create_test_model(config: &Config) -> TextClassifier {
    let tokenizer = TextTokenizer::from_vocab(&test_vocab(), config.model.max_length).unwrap();
    TextClassifier::with_random_init(config, &tiny_encoder_config(), tokenizer, &create_test_device())
        .unwrap()
}

/// Assert two floats are within `tolerance`
pub fn assert_close(actual: f64, expected: f64, tolerance: f64) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {} to be within {} of {}",
        actual,
        tolerance,
        expected
    );
}
