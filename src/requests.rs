//! Request payloads for the batch service, one JSON line per record.

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use serde::Serialize;

use crate::artifacts::AtomicFileWriter;
use crate::config::DescriptionMode;
use crate::dataset::Record;
use crate::error::{PipelineError, Result};

#[derive(Debug, Serialize, PartialEq)]
pub struct ChatMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ChatBody<'a> {
    pub model: &'a str,
    pub messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BatchRequest<'a> {
    pub custom_id: String,
    pub method: &'static str,
    pub url: &'a str,
    pub body: ChatBody<'a>,
}

/// Shared inputs for rendering every line of a run.
#[derive(Debug, Clone, Copy)]
pub struct RequestTemplate<'a> {
    pub model: &'a str,
    pub endpoint: &'a str,
    pub system_prompt: &'a str,
    pub mode: DescriptionMode,
}

/// Caller-chosen id; falls back to the global row index when the record has none.
pub fn custom_id(record: &Record, row_index: usize) -> String {
    match record.id() {
        Some(id) => format!("startup-{id}"),
        None => format!("startup-row-{row_index}"),
    }
}

impl<'a> RequestTemplate<'a> {
    /// One serialised JSONL line for `record` at `row_index` in the dataset.
    pub fn render_line(&self, record: &Record, row_index: usize) -> Result<String> {
        let user = record.render_user_message(self.mode);
        let request = BatchRequest {
            custom_id: custom_id(record, row_index),
            method: "POST",
            url: self.endpoint,
            body: ChatBody {
                model: self.model,
                messages: [
                    ChatMessage { role: "system", content: self.system_prompt },
                    ChatMessage { role: "user", content: &user },
                ],
            },
        };
        Ok(serde_json::to_string(&request)?)
    }

    /// Render `records` (which start at dataset row `first_row`) into one file.
    /// Returns the number of lines written.
    pub fn write_batch_file(&self, path: &Path, records: &[Record], first_row: usize) -> Result<usize> {
        let bar = ProgressBar::new(records.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} requests")
                .map_err(|e| PipelineError::Config(e.to_string()))?,
        );

        let mut out = AtomicFileWriter::new(path)?;
        for (offset, record) in records.iter().enumerate() {
            out.write_line(&self.render_line(record, first_row + offset)?)?;
            bar.inc(1);
        }
        out.finish()?;
        bar.finish_and_clear();

        info!("wrote {} requests to {}", records.len(), path.display());
        Ok(records.len())
    }
}

/// Measured per-request averages from a sample of rendered lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestEstimate {
    pub sampled: usize,
    pub avg_bytes: f64,
    pub avg_tokens: f64,
}

/// Render the first `sample` records and measure their size and token count
/// with the `o200k_base` encoding.
pub fn measure_sample(
    template: &RequestTemplate<'_>,
    records: &[Record],
    sample: usize,
) -> Result<Option<RequestEstimate>> {
    let take = sample.min(records.len());
    if take == 0 {
        return Ok(None);
    }
    let bpe = tiktoken_rs::o200k_base()
        .map_err(|e| PipelineError::Config(format!("tokenizer unavailable: {e}")))?;

    let system_tokens = bpe.encode_with_special_tokens(template.system_prompt).len();
    let mut bytes = 0usize;
    let mut tokens = 0usize;
    for (i, record) in records.iter().take(take).enumerate() {
        bytes += template.render_line(record, i)?.len() + 1;
        tokens += system_tokens
            + bpe
                .encode_with_special_tokens(&record.render_user_message(template.mode))
                .len();
    }
    Ok(Some(RequestEstimate {
        sampled: take,
        avg_bytes: bytes as f64 / take as f64,
        avg_tokens: tokens as f64 / take as f64,
    }))
}
