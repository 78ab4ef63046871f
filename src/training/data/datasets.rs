//! Labeled text sources: directory scan, side-table join, script filtering,
//! fold preparation and the tokenizing dataset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::folds::StratifiedKFold;
use super::{Dataset, LabeledText, Sample};
use crate::config::DataConfig;
use crate::encoder::TextTokenizer;
use crate::error::{Error, Result};

/// A file found under `<train_dir>/<label>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledFile {
    pub path: PathBuf,
    pub file_name: String,
    pub label: u32,
}

/// Whether a character belongs to the CJK Unified Ideographs block kept for
/// classification (U+4E00..=U+9FEF)
pub fn is_target_script(c: char) -> bool {
    ('\u{4e00}'..='\u{9fef}').contains(&c)
}

/// Drop every character outside the target script
pub fn keep_target_script(text: &str) -> String {
    text.chars().filter(|&c| is_target_script(c)).collect()
}

/// List `<train_dir>/<label>/<file>` entries, sorted by path. Entries whose
/// parent directory name is not an integer label are skipped.
#[instrument]
pub fn scan_labeled_files(train_dir: &Path) -> Result<Vec<LabeledFile>> {
    if !train_dir.is_dir() {
        return Err(Error::data(format!(
            "training directory not found: {}",
            train_dir.display()
        )));
    }

    let mut files = Vec::new();
    let mut skipped = 0usize;

    for entry in WalkDir::new(train_dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::data(format!("cannot scan {}: {}", train_dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let label = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<u32>().ok());
        let file_name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);

        match (label, file_name) {
            (Some(label), Some(file_name)) => files.push(LabeledFile {
                path: path.to_path_buf(),
                file_name,
                label,
            }),
            _ => {
                debug!("Skipping unlabeled entry {}", path.display());
                skipped += 1;
            }
        }
    }

    info!(
        "Found {} labeled files under {} ({} skipped)",
        files.len(),
        train_dir.display(),
        skipped
    );
    Ok(files)
}

/// Basename used as the join key
fn join_key(file_name: &str) -> &str {
    file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(file_name)
}

/// Read the tab-separated side table into `file name -> text`. Missing text
/// cells become empty strings; the first row wins for duplicate names.
#[instrument]
pub fn read_text_table(path: &Path) -> Result<HashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .map_err(|e| Error::data(format!("cannot open {}: {}", path.display(), e)))?;

    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| Error::data(format!("{} has no '{}' column", path.display(), name)))
    };
    let file_col = column("file_name")?;
    let text_col = column("text")?;

    let mut table = HashMap::new();
    let mut duplicates = 0usize;
    for record in reader.records() {
        let record = record?;
        let Some(file_name) = record.get(file_col) else {
            continue;
        };
        let text = record.get(text_col).unwrap_or("").to_string();
        let key = join_key(file_name.trim()).to_string();
        if table.contains_key(&key) {
            duplicates += 1;
            continue;
        }
        table.insert(key, text);
    }

    if duplicates > 0 {
        warn!("{} duplicate file names in {}", duplicates, path.display());
    }
    debug!("Read {} text rows from {}", table.len(), path.display());
    Ok(table)
}

/// Inner join of files with the text table. Returns one entry per file:
/// `None` for files without a text row.
pub fn join_text(files: &[LabeledFile], table: &HashMap<String, String>) -> Vec<Option<LabeledText>> {
    files
        .iter()
        .map(|file| {
            table.get(join_key(&file.file_name)).map(|text| LabeledText {
                file_name: file.file_name.clone(),
                label: file.label,
                text: keep_target_script(text),
            })
        })
        .collect()
}

/// Train and validation rows for one fold
#[derive(Debug, Clone)]
pub struct FoldData {
    pub fold: usize,
    pub train: Vec<LabeledText>,
    pub valid: Vec<LabeledText>,
}

impl FoldData {
    /// Scan, split, join and filter according to `config`. The split is
    /// computed over all labeled files, then each side keeps only the rows
    /// that joined with the text table.
    #[instrument(skip(config))]
    pub fn prepare(config: &DataConfig, seed: u64) -> Result<Self> {
        let fold = config.resolved_fold()?;
        let files = scan_labeled_files(&config.train_dir())?;
        let table = read_text_table(&config.text_table_path())?;
        Self::from_parts(&files, &table, config.n_splits, fold, seed)
    }

    /// Split already loaded files and table
    pub fn from_parts(
        files: &[LabeledFile],
        table: &HashMap<String, String>,
        n_splits: usize,
        fold: usize,
        seed: u64,
    ) -> Result<Self> {
        let labels: Vec<u32> = files.iter().map(|f| f.label).collect();
        let split = StratifiedKFold::new(n_splits, seed).fold(&labels, fold)?;
        let joined = join_text(files, table);

        let select = |indices: &[usize]| -> Vec<LabeledText> {
            indices.iter().filter_map(|&i| joined[i].clone()).collect()
        };
        let train = select(&split.train);
        let valid = select(&split.valid);

        let dropped = joined.iter().filter(|row| row.is_none()).count();
        info!(
            "Fold {}/{}: {} train rows, {} valid rows, {} files without text dropped",
            fold,
            n_splits,
            train.len(),
            valid.len(),
            dropped
        );

        if train.is_empty() || valid.is_empty() {
            return Err(Error::data(format!(
                "fold {} has an empty train or validation split",
                fold
            )));
        }

        Ok(Self { fold, train, valid })
    }
}

/// Dataset that tokenizes rows on access
pub struct TextClassificationDataset {
    rows: Vec<LabeledText>,
    tokenizer: Arc<TextTokenizer>,
}

impl TextClassificationDataset {
    /// Create a dataset over `rows`
    pub fn new(rows: Vec<LabeledText>, tokenizer: Arc<TextTokenizer>) -> Self {
        Self { rows, tokenizer }
    }

    /// Underlying rows
    pub fn rows(&self) -> &[LabeledText] {
        &self.rows
    }
}

impl Dataset for TextClassificationDataset {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let row = self.rows.get(index).ok_or_else(|| {
            Error::data(format!("index {} out of range for {} rows", index, self.rows.len()))
        })?;
        Ok(Sample {
            tokens: self.tokenizer.encode(&row.text)?,
            label: row.label,
        })
    }

    fn labels(&self) -> Vec<u32> {
        self.rows.iter().map(|row| row.label).collect()
    }
}
