//! Concatenation of per-batch result tables into one.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::artifacts::ArtifactLayout;
use crate::error::{PipelineError, Result};
use crate::responses::{read_result_table, write_result_table};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub output: PathBuf,
    /// batch numbers merged, ascending
    pub merged: Vec<usize>,
    pub expected: Option<usize>,
    /// expected batch numbers with no table
    pub missing: Vec<usize>,
    /// tables numbered above `expected`, left out of the merge
    pub stale: Vec<usize>,
    pub rows: usize,
    pub positives: usize,
    pub negatives: usize,
}

impl MergeReport {
    pub fn other_labels(&self) -> usize {
        self.rows - self.positives - self.negatives
    }
}

/// Merge every `batch_<n>_output.csv` under `layout` in ascending `n` into
/// `output`. `expected` is the planned batch count when it is known.
pub fn merge_batch_outputs(layout: &ArtifactLayout, expected: Option<usize>, output: &Path) -> Result<MergeReport> {
    let tables = layout.discover_outputs()?;
    if tables.is_empty() {
        return Err(PipelineError::NoBatchOutputs(layout.outputs_dir()));
    }

    let mut rows = Vec::new();
    let mut merged = Vec::with_capacity(tables.len());
    let mut stale = Vec::new();
    for (n, path) in &tables {
        if expected.is_some_and(|total| *n > total) {
            warn!("skipping {}: batch {n} is not part of the current plan", path.display());
            stale.push(*n);
            continue;
        }
        let batch = read_result_table(path)?;
        info!("batch {n}: {} rows from {}", batch.len(), path.display());
        rows.extend(batch);
        merged.push(*n);
    }

    if merged.is_empty() {
        return Err(PipelineError::NoBatchOutputs(layout.outputs_dir()));
    }

    let missing: Vec<usize> = match expected {
        Some(total) => (1..=total).filter(|n| !merged.contains(n)).collect(),
        None => Vec::new(),
    };
    if !missing.is_empty() {
        warn!("merging without batches {missing:?}");
    }

    write_result_table(output, &rows)?;

    let positives = rows.iter().filter(|r| r.ai_native == "1").count();
    let negatives = rows.iter().filter(|r| r.ai_native == "0").count();
    info!("merged {} rows from {} tables into {}", rows.len(), merged.len(), output.display());

    Ok(MergeReport {
        output: output.to_path_buf(),
        merged,
        expected,
        missing,
        stale,
        rows: rows.len(),
        positives,
        negatives,
    })
}
