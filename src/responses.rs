//! Parsing of downloaded batch results into seven-column result records.
//!
//! Each raw line is a JSON envelope around one chat completion; the completion
//! text is itself a single CSV row. Lines are parsed independently and a bad
//! line is counted and dropped, never fatal for the batch.

use std::path::Path;

use indicatif::ProgressBar;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifacts::AtomicCsvWriter;
use crate::error::Result;

pub const RESULT_FIELD_COUNT: usize = 7;

pub const RESULT_HEADERS: [&str; RESULT_FIELD_COUNT] = [
    "CompanyID",
    "CompanyName",
    "AI_native",
    "Confidence_1to5",
    "Reasons_3_points",
    "Sources_used",
    "Verification_critique",
];

/// One parsed classification, stored exactly as the model wrote it (trimmed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(rename = "CompanyID")]
    pub company_id: String,
    #[serde(rename = "CompanyName")]
    pub company_name: String,
    #[serde(rename = "AI_native")]
    pub ai_native: String,
    #[serde(rename = "Confidence_1to5")]
    pub confidence: String,
    #[serde(rename = "Reasons_3_points")]
    pub reasons: String,
    #[serde(rename = "Sources_used")]
    pub sources: String,
    #[serde(rename = "Verification_critique")]
    pub critique: String,
}

/// Why a raw line did not produce a result record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineIssue {
    NotJson(String),
    RequestError(String),
    MissingContent,
    TooFewFields(usize),
    EmptyId,
}

impl std::fmt::Display for LineIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineIssue::NotJson(e) => write!(f, "not valid JSON: {e}"),
            LineIssue::RequestError(e) => write!(f, "request failed: {e}"),
            LineIssue::MissingContent => f.write_str("no completion text in response"),
            LineIssue::TooFewFields(n) => {
                write!(f, "completion has {n} fields, expected {RESULT_FIELD_COUNT}")
            }
            LineIssue::EmptyId => f.write_str("completion has an empty CompanyID"),
        }
    }
}

/// Parse the model's completion text: the first CSV row, quote-aware.
pub fn parse_completion(content: &str) -> std::result::Result<ResultRecord, LineIssue> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.trim().as_bytes());

    let row = match rdr.records().next() {
        Some(Ok(row)) => row,
        Some(Err(_)) | None => return Err(LineIssue::TooFewFields(0)),
    };
    if row.len() < RESULT_FIELD_COUNT {
        return Err(LineIssue::TooFewFields(row.len()));
    }
    let field = |i: usize| row.get(i).unwrap_or_default().trim().to_string();
    let record = ResultRecord {
        company_id: field(0),
        company_name: field(1),
        ai_native: field(2),
        confidence: field(3),
        reasons: field(4),
        sources: field(5),
        critique: field(6),
    };
    if record.company_id.is_empty() {
        return Err(LineIssue::EmptyId);
    }
    Ok(record)
}

/// Parse one raw result line. The returned id is the request's `custom_id`
/// when the envelope carries one.
pub fn parse_result_line(line: &str) -> (Option<String>, std::result::Result<ResultRecord, LineIssue>) {
    let envelope: Value = match serde_json::from_str(line.trim()) {
        Ok(v) => v,
        Err(e) => return (None, Err(LineIssue::NotJson(e.to_string()))),
    };
    let custom_id = envelope["custom_id"].as_str().map(str::to_string);

    if !envelope["error"].is_null() {
        return (custom_id, Err(LineIssue::RequestError(envelope["error"].to_string())));
    }
    if let Some(status) = envelope["response"]["status_code"].as_u64() {
        if status != 200 {
            return (custom_id, Err(LineIssue::RequestError(format!("status {status}"))));
        }
    }
    let parsed = envelope["response"]["body"]["choices"][0]["message"]["content"]
        .as_str()
        .ok_or(LineIssue::MissingContent)
        .and_then(parse_completion);
    (custom_id, parsed)
}

/// Outcome of parsing one downloaded result file.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedBatch {
    pub rows: Vec<ResultRecord>,
    /// one entry per dropped line: "<custom_id or line N>: <reason>"
    pub issues: Vec<String>,
}

impl ParsedBatch {
    pub fn dropped(&self) -> usize {
        self.issues.len()
    }
}

pub fn parse_results(raw: &str) -> ParsedBatch {
    let mut parsed = ParsedBatch::default();
    let bar = ProgressBar::new(raw.lines().count() as u64);
    for (i, line) in raw.lines().enumerate() {
        bar.inc(1);
        if line.trim().is_empty() {
            continue;
        }
        match parse_result_line(line) {
            (_, Ok(record)) => parsed.rows.push(record),
            (id, Err(issue)) => {
                let who = id.unwrap_or_else(|| format!("line {}", i + 1));
                parsed.issues.push(format!("{who}: {issue}"));
            }
        }
    }
    bar.finish_and_clear();
    if parsed.dropped() > 0 {
        warn!(
            "{} of {} result lines dropped as unparseable",
            parsed.dropped(),
            parsed.dropped() + parsed.rows.len()
        );
    }
    parsed
}

pub fn write_result_table(path: &Path, rows: &[ResultRecord]) -> Result<()> {
    let mut out = AtomicCsvWriter::new(path)?;
    // serialize() only emits the header with the first row
    out.writer_mut().write_record(RESULT_HEADERS)?;
    for row in rows {
        out.writer_mut().write_record([
            &row.company_id,
            &row.company_name,
            &row.ai_native,
            &row.confidence,
            &row.reasons,
            &row.sources,
            &row.critique,
        ])?;
    }
    out.finish()?;
    Ok(())
}

pub fn read_result_table(path: &Path) -> Result<Vec<ResultRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in rdr.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}
