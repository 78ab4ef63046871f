//! Test fixtures for setting up common test scenarios

use std::path::{Path, PathBuf};

use candle_core::DType;
use candle_nn::VarMap;
use tempfile::TempDir;

use crate::config::Config;
use crate::encoder::build_classifier;
use crate::training::data::FoldData;

use super::test_utils::{create_test_config, create_test_device, test_vocab, tiny_encoder_config};

/// Per-class texts; punctuation and Latin characters are filtered away on load
const CLASS_TEXTS: [&str; 3] = ["我们今天学习 abc!", "中文本分类很好。", "天气明日数据 42"];

/// Temporary data, model, checkpoint and log directories
pub struct TrainingFixture {
    pub temp_dir: TempDir,
    pub config: Config,
}

impl TrainingFixture {
    /// `samples_per_class` files under `train/<label>/` for every class, a
    /// text table covering all of them, one file with no text row and one
    /// text row with no file
    pub fn new(samples_per_class: usize) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(temp_dir.path());
        let train_dir = config.data.train_dir();

        let mut table = String::from("file_name\ttext\n");
        for (label, text) in CLASS_TEXTS.iter().enumerate() {
            let class_dir = train_dir.join(label.to_string());
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..samples_per_class {
                let name = format!("{}_{:03}.png", label, i);
                std::fs::write(class_dir.join(&name), b"").unwrap();
                table.push_str(&format!("{}\t{}\n", name, text));
            }
        }

        std::fs::write(train_dir.join("0").join("orphan.png"), b"").unwrap();
        table.push_str("missing.png\t我们\n");
        std::fs::write(config.data.text_table_path(), table).unwrap();

        Self { temp_dir, config }
    }

    /// Root of the fixture tree
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Number of rows that join with the text table
    pub fn joined_rows(&self, samples_per_class: usize) -> usize {
        samples_per_class * CLASS_TEXTS.len()
    }

    /// Fold prepared with the fixture configuration
    pub fn fold_data(&self) -> FoldData {
        FoldData::prepare(&self.config.data, self.config.training.seed).unwrap()
    }

    /// Write a pretrained model directory (`config.json`, `vocab.txt`,
    /// `model.safetensors`) whose head has `head_classes` outputs
    pub fn write_pretrained_model(&self, head_classes: usize) -> PathBuf {
        let model_dir = self.config.model.model_dir();
        std::fs::create_dir_all(&model_dir).unwrap();

        let encoder = tiny_encoder_config();
        std::fs::write(
            model_dir.join("config.json"),
            serde_json::to_string_pretty(&encoder).unwrap(),
        )
        .unwrap();
        std::fs::write(model_dir.join("vocab.txt"), test_vocab().join("\n")).unwrap();

        let var_map = VarMap::new();
        build_classifier(&var_map, &encoder, head_classes, 0.1, DType::F32, &create_test_device())
            .unwrap();
        var_map.save(model_dir.join("model.safetensors")).unwrap();
        model_dir
    }
}
