//! Checkpoint persistence
//!
//! Each checkpoint is a safetensors file of every model variable plus a JSON
//! sidecar with the same stem holding [`CheckpointMetadata`]. The manager
//! keeps the best checkpoint for the monitored metric
//! (`epoch={e}_{monitor}={v:.3}.safetensors`) and a rolling `last`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::CheckpointConfig;
use crate::encoder::assign_weights;
use crate::error::{Error, Result};
use crate::training::optimizers::SchedulerStateDict;

/// File stem of the rolling checkpoint
pub const LAST_CHECKPOINT: &str = "last";

/// Sidecar stored next to each checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch (0-based) that produced the weights
    pub epoch: usize,
    /// Optimizer steps taken so far
    pub global_step: usize,
    /// Metrics at save time
    pub metrics: BTreeMap<String, f64>,
    /// Learning rate schedule position
    pub scheduler: Option<SchedulerStateDict>,
    /// Whether the weights are a stochastic weight average
    #[serde(default)]
    pub swa: bool,
    /// Save time
    pub created_at: DateTime<Utc>,
}

impl CheckpointMetadata {
    /// Metadata stamped now
    pub fn new(epoch: usize, global_step: usize) -> Self {
        Self {
            epoch,
            global_step,
            metrics: BTreeMap::new(),
            scheduler: None,
            swa: false,
            created_at: Utc::now(),
        }
    }
}

/// A checkpoint on disk
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    /// Weights file
    pub path: PathBuf,
    /// Monitored metric value
    pub score: f64,
    /// Epoch that produced the weights
    pub epoch: usize,
}

/// Sidecar path for a weights file
pub fn metadata_path(weights: &Path) -> PathBuf {
    weights.with_extension("json")
}

/// Saves, rotates and restores checkpoints for one run
pub struct CheckpointManager {
    dir: PathBuf,
    config: CheckpointConfig,
    best: Option<CheckpointInfo>,
}

impl CheckpointManager {
    /// Manage checkpoints under `<config.dir>/<project>/<version>`. With
    /// `discover_existing` a best checkpoint already in the directory is
    /// picked up (resuming); otherwise the run starts with no best.
    pub fn new(
        config: &CheckpointConfig,
        project: &str,
        version: &str,
        discover_existing: bool,
    ) -> Result<Self> {
        let dir = config.dir.join(project).join(version);
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::checkpoint(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let mut manager = Self {
            dir,
            config: config.clone(),
            best: None,
        };
        if discover_existing {
            manager.best = manager.discover_best()?;
        }
        if let Some(best) = &manager.best {
            info!(
                "Found existing best checkpoint {} ({}={:.4})",
                best.path.display(),
                manager.config.monitor,
                best.score
            );
        }
        Ok(manager)
    }

    /// Run checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Best checkpoint so far
    pub fn best(&self) -> Option<&CheckpointInfo> {
        self.best.as_ref()
    }

    /// Path of the best checkpoint so far
    pub fn best_checkpoint_path(&self) -> Option<PathBuf> {
        self.best.as_ref().map(|b| b.path.clone())
    }

    /// Path of the rolling checkpoint
    pub fn last_checkpoint_path(&self) -> PathBuf {
        self.dir.join(format!("{}.safetensors", LAST_CHECKPOINT))
    }

    /// File name for a monitored checkpoint
    pub fn checkpoint_file_name(&self, epoch: usize, score: f64) -> String {
        format!("epoch={}_{}={:.3}.safetensors", epoch, self.config.monitor, score)
    }

    /// Whether `score` beats the current best
    pub fn is_improvement(&self, score: f64) -> bool {
        if !score.is_finite() {
            return false;
        }
        match &self.best {
            None => true,
            Some(best) if self.config.mode_max => score > best.score,
            Some(best) => score < best.score,
        }
    }

    /// Save after a validation epoch: a new best when the monitored metric
    /// improves, then `last` when enabled. Returns the paths written.
    #[instrument(skip(self, var_map, metadata), fields(epoch = metadata.epoch))]
    pub fn save(&mut self, var_map: &VarMap, metadata: &CheckpointMetadata) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();

        match metadata.metrics.get(&self.config.monitor).copied() {
            Some(score) if self.config.save_top_k > 0 && self.is_improvement(score) => {
                let path = self.dir.join(self.checkpoint_file_name(metadata.epoch, score));
                write_checkpoint(var_map, &path, metadata)?;

                if let Some(previous) = self.best.take() {
                    if previous.path != path {
                        remove_checkpoint(&previous.path);
                    }
                }
                info!("New best {}={:.4}, saved {}", self.config.monitor, score, path.display());
                self.best = Some(CheckpointInfo {
                    path: path.clone(),
                    score,
                    epoch: metadata.epoch,
                });
                written.push(path);
            }
            Some(_) => {}
            None => warn!("Metric '{}' missing, best checkpoint not updated", self.config.monitor),
        }

        if self.config.save_last {
            written.push(self.save_last(var_map, metadata)?);
        }
        Ok(written)
    }

    /// Overwrite the rolling checkpoint
    pub fn save_last(&self, var_map: &VarMap, metadata: &CheckpointMetadata) -> Result<PathBuf> {
        let path = self.last_checkpoint_path();
        write_checkpoint(var_map, &path, metadata)?;
        debug!("Saved {}", path.display());
        Ok(path)
    }

    /// Restore weights from `path` into `var_map` and return its metadata
    #[instrument(skip(var_map, device))]
    pub fn load(path: &Path, var_map: &VarMap, device: &Device) -> Result<CheckpointMetadata> {
        let metadata = read_metadata(path)?;
        let tensors = candle_core::safetensors::load(path, device)
            .map_err(|e| Error::checkpoint(format!("cannot read {}: {}", path.display(), e)))?;

        let report = assign_weights(var_map, tensors)?;
        if !report.missing.is_empty() || !report.mismatched.is_empty() {
            return Err(Error::checkpoint(format!(
                "{} does not match the model: {} missing, {} mismatched parameters",
                path.display(),
                report.missing.len(),
                report.mismatched.len()
            )));
        }

        info!(
            "Restored {} tensors from {} (epoch {}, step {})",
            report.loaded.len(),
            path.display(),
            metadata.epoch,
            metadata.global_step
        );
        Ok(metadata)
    }

    fn discover_best(&self) -> Result<Option<CheckpointInfo>> {
        let mut best: Option<CheckpointInfo> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_weights = path.extension().map(|e| e == "safetensors").unwrap_or(false);
            let is_last = path.file_stem().map(|s| s == LAST_CHECKPOINT).unwrap_or(false);
            if !is_weights || is_last {
                continue;
            }

            let Ok(metadata) = read_metadata(&path) else {
                debug!("Ignoring {} without readable metadata", path.display());
                continue;
            };
            let Some(score) = metadata.metrics.get(&self.config.monitor).copied() else {
                continue;
            };

            let better = match &best {
                None => true,
                Some(b) if self.config.mode_max => score > b.score,
                Some(b) => score < b.score,
            };
            if better {
                best = Some(CheckpointInfo {
                    path,
                    score,
                    epoch: metadata.epoch,
                });
            }
        }
        Ok(best)
    }
}

/// Write weights and sidecar
pub fn write_checkpoint(var_map: &VarMap, path: &Path, metadata: &CheckpointMetadata) -> Result<()> {
    var_map
        .save(path)
        .map_err(|e| Error::checkpoint(format!("cannot write {}: {}", path.display(), e)))?;
    std::fs::write(metadata_path(path), serde_json::to_string_pretty(metadata)?)?;
    Ok(())
}

/// Read the sidecar of a weights file
pub fn read_metadata(weights: &Path) -> Result<CheckpointMetadata> {
    let sidecar = metadata_path(weights);
    let content = std::fs::read_to_string(&sidecar)
        .map_err(|e| Error::checkpoint(format!("cannot read {}: {}", sidecar.display(), e)))?;
    Ok(serde_json::from_str(&content)?)
}

fn remove_checkpoint(path: &Path) {
    for file in [path.to_path_buf(), metadata_path(path)] {
        if let Err(e) = std::fs::remove_file(&file) {
            warn!("Failed to remove {}: {}", file.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::Init;
    use tempfile::TempDir;

    fn var_map(value: f64) -> VarMap {
        let var_map = VarMap::new();
        var_map
            .get((2, 3), "layer.weight", Init::Const(value), DType::F32, &Device::Cpu)
            .unwrap();
        var_map
    }

    fn config(dir: &Path) -> CheckpointConfig {
        CheckpointConfig {
            dir: dir.to_path_buf(),
            ..CheckpointConfig::default()
        }
    }

    fn metadata(epoch: usize, score: f64) -> CheckpointMetadata {
        let mut metadata = CheckpointMetadata::new(epoch, epoch * 10);
        metadata.metrics.insert("valid_metric".to_string(), score);
        metadata
    }

    fn weight_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".safetensors"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_keeps_single_best_and_last() {
        let root = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(&config(root.path()), "baseline", "run_0", false).unwrap();
        let vars = var_map(1.0);

        manager.save(&vars, &metadata(0, 0.5)).unwrap();
        manager.save(&vars, &metadata(1, 0.75)).unwrap();
        manager.save(&vars, &metadata(2, 0.6)).unwrap();

        let files = weight_files(manager.dir());
        assert_eq!(files, vec!["epoch=1_valid_metric=0.750.safetensors", "last.safetensors"]);
        assert_eq!(manager.best().unwrap().epoch, 1);
        assert!(!manager.dir().join("epoch=0_valid_metric=0.500.json").exists());
        assert!(manager.dir().join("epoch=1_valid_metric=0.750.json").exists());
    }

    #[test]
    fn test_min_mode() {
        let root = TempDir::new().unwrap();
        let config = CheckpointConfig {
            mode_max: false,
            ..config(root.path())
        };
        let manager = CheckpointManager::new(&config, "p", "v", false).unwrap();
        assert!(manager.is_improvement(1.0));
        assert!(!manager.is_improvement(f64::NAN));
    }

    #[test]
    fn test_load_roundtrip_and_discovery() {
        let root = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(&config(root.path()), "p", "v", false).unwrap();
        manager.save(&var_map(2.0), &metadata(3, 0.9)).unwrap();

        let target = var_map(0.0);
        let restored = CheckpointManager::load(&manager.last_checkpoint_path(), &target, &Device::Cpu).unwrap();
        assert_eq!(restored.epoch, 3);
        assert_eq!(restored.global_step, 30);

        let weights: Vec<Vec<f32>> = target.data().lock().unwrap()["layer.weight"]
            .as_tensor()
            .to_vec2()
            .unwrap();
        assert!(weights.iter().flatten().all(|&w| w == 2.0));

        let reopened = CheckpointManager::new(&config(root.path()), "p", "v", true).unwrap();
        assert_eq!(reopened.best().unwrap().epoch, 3);
        assert!(!reopened.is_improvement(0.8));

        let fresh = CheckpointManager::new(&config(root.path()), "p", "v", false).unwrap();
        assert!(fresh.best().is_none());
        assert!(fresh.is_improvement(0.1));
    }

    #[test]
    fn test_load_rejects_foreign_layout() {
        let root = TempDir::new().unwrap();
        let manager = CheckpointManager::new(&config(root.path()), "p", "v", false).unwrap();
        manager.save_last(&var_map(1.0), &metadata(0, 0.1)).unwrap();

        let other = VarMap::new();
        other
            .get((4,), "other.weight", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        assert!(CheckpointManager::load(&manager.last_checkpoint_path(), &other, &Device::Cpu).is_err());
    }
}
