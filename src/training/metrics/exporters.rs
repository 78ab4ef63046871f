//! Metrics exporters
//!
//! The offline run exporter writes one directory per run version:
//! `<log_dir>/<project>/<run>/<version>/` holding `hparams.json` and an
//! append-only `metrics.jsonl`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::MetricRecord;
use crate::error::{Error, Result};

/// Sink for hyperparameters and scalar metrics
pub trait MetricsExporter: Send {
    /// Exporter name
    fn name(&self) -> &str;

    /// Record run hyperparameters
    fn log_hparams(&mut self, hparams: &Value) -> Result<()>;

    /// Record one line of metrics
    fn log_metrics(&mut self, record: &MetricRecord) -> Result<()>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Offline experiment run on the local filesystem
pub struct OfflineRunExporter {
    run_dir: PathBuf,
    writer: BufWriter<File>,
}

impl OfflineRunExporter {
    /// Open (or continue) the run directory for `project/run/version`
    pub fn create(log_dir: &Path, project: &str, run: &str, version: &str) -> Result<Self> {
        let run_dir = log_dir.join(project).join(run).join(version);
        std::fs::create_dir_all(&run_dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("metrics.jsonl"))
            .map_err(|e| {
                Error::training(format!("cannot open metrics log in {}: {}", run_dir.display(), e))
            })?;

        info!("Logging run '{}' offline to {}", version, run_dir.display());
        Ok(Self {
            run_dir,
            writer: BufWriter::new(file),
        })
    }

    /// Directory of this run
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

impl MetricsExporter for OfflineRunExporter {
    fn name(&self) -> &str {
        "offline"
    }

    fn log_hparams(&mut self, hparams: &Value) -> Result<()> {
        let document = json!({
            "created_at": Utc::now().to_rfc3339(),
            "hparams": hparams,
        });
        let path = self.run_dir.join("hparams.json");
        std::fs::write(&path, serde_json::to_string_pretty(&document)?)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn log_metrics(&mut self, record: &MetricRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for OfflineRunExporter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
