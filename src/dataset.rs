//! Company dataset: loading, the both-descriptions filter and rendering of a
//! record into the user message sent to the model.

use std::path::Path;

use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::config::DescriptionMode;
use crate::error::{PipelineError, Result};

pub const SHORT_DESCRIPTION_COLUMN: &str = "short_description";
pub const LONG_DESCRIPTION_COLUMN: &str = "Long description";

/// Sentinel for any value that is missing or unparseable.
pub const UNKNOWN: &str = "N/A";

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").expect("valid year regex"));

/// One company row. Columns not listed here are ignored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Record {
    #[serde(default)]
    pub org_uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(rename = "Long description", default)]
    pub long_description: Option<String>,
    #[serde(default)]
    pub category_list: Option<String>,
    #[serde(default)]
    pub category_groups_list: Option<String>,
    #[serde(default)]
    pub founded_date: Option<String>,
}

fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Record {
    /// Trimmed identifier, if the row has one.
    pub fn id(&self) -> Option<&str> {
        present(&self.org_uuid)
    }

    /// Category tags joined the way the prompt expects them.
    pub fn keywords(&self) -> String {
        match (present(&self.category_list), present(&self.category_groups_list)) {
            (Some(list), Some(groups)) => format!("{list}, {groups}"),
            (Some(list), None) => list.to_string(),
            (None, Some(groups)) => groups.to_string(),
            (None, None) => UNKNOWN.to_string(),
        }
    }

    pub fn year_founded(&self) -> String {
        extract_year(self.founded_date.as_deref().unwrap_or(""))
    }

    /// Fixed-format INPUT block for the user message.
    pub fn render_user_message(&self, mode: DescriptionMode) -> String {
        let or_unknown = |v: &Option<String>| present(v).unwrap_or(UNKNOWN).to_string();

        let mut msg = format!(
            "INPUT:\nCompanyID: {}\nCompanyName: {}\nShort Description: {}",
            or_unknown(&self.org_uuid),
            or_unknown(&self.name),
            or_unknown(&self.short_description),
        );
        if mode == DescriptionMode::Both {
            msg.push_str(&format!("\nLong Description: {}", or_unknown(&self.long_description)));
        }
        msg.push_str(&format!(
            "\nKeywords: {}\nYearFounded: {}",
            self.keywords(),
            self.year_founded()
        ));
        msg
    }
}

/// First plausible four-digit year (19xx/20xx) in a loosely formatted date,
/// e.g. `01nov2016` or `2016-11-01`.
pub fn extract_year(date: &str) -> String {
    let date = date.trim();
    if date.is_empty() || date == UNKNOWN {
        return UNKNOWN.to_string();
    }
    // `\b` does not fire between letters and digits ("01nov2016"), so retry on
    // a copy where letters are replaced by spaces.
    YEAR_RE
        .find(date)
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            let spaced: String = date
                .chars()
                .map(|c| if c.is_ascii_alphabetic() { ' ' } else { c })
                .collect();
            YEAR_RE.find(&spaced).map(|m| m.as_str().to_string())
        })
        .unwrap_or_else(|| UNKNOWN.to_string())
}

pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in rdr.deserialize() {
        records.push(row?);
    }
    info!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Row count without materialising the records.
pub fn count_rows(path: &Path) -> Result<usize> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut n = 0usize;
    let mut row = csv::ByteRecord::new();
    while rdr.read_byte_record(&mut row)? {
        n += 1;
    }
    Ok(n)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub total: usize,
    pub with_short: usize,
    pub with_long: usize,
    pub kept: usize,
}

impl FilterStats {
    pub fn retained_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.kept as f64 / self.total as f64 * 100.0
        }
    }
}

/// Copy every row that has both a non-blank short and long description,
/// keeping all original columns.
pub fn filter_both_descriptions(input: &Path, output: &Path) -> Result<FilterStats> {
    let mut rdr = csv::Reader::from_path(input)?;
    let headers = rdr.headers()?.clone();

    let column = |name: &str| {
        headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
            PipelineError::Config(format!("column '{name}' missing from {}", input.display()))
        })
    };
    let short_idx = column(SHORT_DESCRIPTION_COLUMN)?;
    let long_idx = column(LONG_DESCRIPTION_COLUMN)?;

    let mut wtr = crate::artifacts::AtomicCsvWriter::new(output)?;
    wtr.writer_mut().write_record(&headers)?;

    let mut stats = FilterStats::default();
    for row in rdr.records() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping unreadable row in {}: {e}", input.display());
                continue;
            }
        };
        stats.total += 1;
        let has = |idx: usize| row.get(idx).map(|v| !v.trim().is_empty()).unwrap_or(false);
        let (short, long) = (has(short_idx), has(long_idx));
        stats.with_short += short as usize;
        stats.with_long += long as usize;
        if short && long {
            stats.kept += 1;
            wtr.writer_mut().write_record(&row)?;
        }
    }
    wtr.finish()?;

    info!(
        "filtered {} -> {}: {} of {} rows kept",
        input.display(),
        output.display(),
        stats.kept,
        stats.total
    );
    Ok(stats)
}
