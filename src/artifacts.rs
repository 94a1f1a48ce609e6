//! On-disk artifact layout of a run.
//!
//! Every artifact is addressed by its batch number and written atomically
//! (temp file in the same directory, then rename), so "the file exists" always
//! means "the step finished". That presence check is what makes reruns resume.
//!
//! ```text
//! <work_dir>/batch_requests/batch_<n>_requests.jsonl
//! <work_dir>/batch_ids/batch_<n>_id.txt
//! <work_dir>/batch_results/batch_<n>_results.jsonl
//! <work_dir>/batch_outputs/batch_<n>_output.csv
//! <work_dir>/batch_outputs/batch_<n>_issues.json
//! ```

use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use csv::Writer;
use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::NamedTempFile;

use crate::error::{PipelineError, Result};

static OUTPUT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^batch_(\d+)_output\.csv$").expect("valid output name regex"));
static ID_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^batch_(\d+)_id\.txt$").expect("valid id name regex"));

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.root.join("batch_requests")
    }
    pub fn ids_dir(&self) -> PathBuf {
        self.root.join("batch_ids")
    }
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("batch_results")
    }
    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("batch_outputs")
    }

    pub fn request_file(&self, batch: usize) -> PathBuf {
        self.requests_dir().join(format!("batch_{batch}_requests.jsonl"))
    }
    pub fn id_file(&self, batch: usize) -> PathBuf {
        self.ids_dir().join(format!("batch_{batch}_id.txt"))
    }
    pub fn raw_result_file(&self, batch: usize) -> PathBuf {
        self.results_dir().join(format!("batch_{batch}_results.jsonl"))
    }
    pub fn output_csv(&self, batch: usize) -> PathBuf {
        self.outputs_dir().join(format!("batch_{batch}_output.csv"))
    }
    pub fn issues_file(&self, batch: usize) -> PathBuf {
        self.outputs_dir().join(format!("batch_{batch}_issues.json"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.requests_dir(),
            self.ids_dir(),
            self.results_dir(),
            self.outputs_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Persisted submission identifier, if this batch was ever submitted.
    pub fn read_submission_id(&self, batch: usize) -> Result<Option<String>> {
        let path = self.id_file(batch);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
        let id = raw.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    pub fn write_submission_id(&self, batch: usize, id: &str) -> Result<()> {
        write_atomic(&self.id_file(batch), id.as_bytes())
    }

    /// `(batch number, path)` of every parsed batch table, ascending by number.
    pub fn discover_outputs(&self) -> Result<Vec<(usize, PathBuf)>> {
        numbered_files(&self.outputs_dir(), &OUTPUT_NAME_RE)
    }

    /// `(batch number, submission id)` for every persisted id, ascending.
    pub fn discover_submissions(&self) -> Result<Vec<(usize, String)>> {
        let mut out = Vec::new();
        for (n, _) in numbered_files(&self.ids_dir(), &ID_NAME_RE)? {
            if let Some(id) = self.read_submission_id(n)? {
                out.push((n, id));
            }
        }
        Ok(out)
    }
}

fn numbered_files(dir: &Path, pattern: &Regex) -> Result<Vec<(usize, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(n) = pattern
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok())
        {
            found.push((n, entry.path()));
        }
    }
    // numeric, so batch_10 sorts after batch_9
    found.sort_by_key(|(n, _)| *n);
    Ok(found)
}

fn temp_beside(path: &Path) -> Result<NamedTempFile> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    NamedTempFile::new_in(parent).map_err(|e| PipelineError::io(parent, e))
}

/// Write `bytes` to `path` so readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = temp_beside(path)?;
    tmp.write_all(bytes).map_err(|e| PipelineError::io(path, e))?;
    tmp.persist(path).map_err(|e| PipelineError::io(path, e.error))?;
    Ok(())
}

/// Buffered line writer that only appears at its final path on `finish`.
pub struct AtomicFileWriter {
    writer: BufWriter<NamedTempFile>,
    final_path: PathBuf,
}

impl AtomicFileWriter {
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let tmp = temp_beside(&final_path)?;
        Ok(Self { writer: BufWriter::new(tmp), final_path })
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|e| PipelineError::io(&self.final_path, e))
    }

    pub fn finish(self) -> Result<PathBuf> {
        let tmp = self
            .writer
            .into_inner()
            .map_err(|e| PipelineError::io(&self.final_path, e.into_error()))?;
        tmp.persist(&self.final_path)
            .map_err(|e| PipelineError::io(&self.final_path, e.error))?;
        Ok(self.final_path)
    }
}

/// CSV writer over a temp file; dropped without `finish` leaves nothing behind.
pub struct AtomicCsvWriter {
    writer: Writer<BufWriter<NamedTempFile>>,
    final_path: PathBuf,
}

impl AtomicCsvWriter {
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let tmp = temp_beside(&final_path)?;
        Ok(Self {
            writer: Writer::from_writer(BufWriter::new(tmp)),
            final_path,
        })
    }

    pub fn writer_mut(&mut self) -> &mut Writer<BufWriter<NamedTempFile>> {
        &mut self.writer
    }

    pub fn finish(self) -> Result<PathBuf> {
        let buf = self.writer.into_inner().map_err(|e| {
            PipelineError::io(
                &self.final_path,
                std::io::Error::new(e.error().kind(), e.error().to_string()),
            )
        })?;
        let tmp = buf
            .into_inner()
            .map_err(|e| PipelineError::io(&self.final_path, e.into_error()))?;
        tmp.persist(&self.final_path)
            .map_err(|e| PipelineError::io(&self.final_path, e.error))?;
        Ok(self.final_path)
    }
}
