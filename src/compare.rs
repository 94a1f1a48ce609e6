//! Agreement between two classification runs over the same companies.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
};

use log::info;

use crate::artifacts::AtomicCsvWriter;
use crate::dataset;
use crate::error::Result;
use crate::responses::ResultRecord;

/// One company present in both runs.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub company_id: String,
    pub company_name: String,
    pub flag_a: String,
    pub confidence_a: String,
    pub flag_b: String,
    pub confidence_b: String,
    pub reasons_a: String,
    pub reasons_b: String,
}

impl JoinedRow {
    /// `Some(true)` when both flags are numeric and differ.
    pub fn disagrees(&self) -> Option<bool> {
        match (number(&self.flag_a), number(&self.flag_b)) {
            (Some(a), Some(b)) => Some(a != b),
            _ => None,
        }
    }
}

fn number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn level(s: &str) -> Option<i64> {
    number(s).filter(|v| v.fract() == 0.0).map(|v| v as i64)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelAgreement {
    pub pairs: usize,
    pub agreements: usize,
}

impl LevelAgreement {
    pub fn pct(&self) -> f64 {
        pct(self.agreements, self.pairs)
    }
}

fn pct(n: usize, of: usize) -> f64 {
    if of == 0 {
        0.0
    } else {
        n as f64 / of as f64 * 100.0
    }
}

/// Descriptive statistics for one run over the joined rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub label: String,
    pub numeric_flags: usize,
    pub positives: usize,
    pub mean_confidence: Option<f64>,
    pub confidence_distribution: BTreeMap<i64, usize>,
    /// agreement among pairs at each of this run's confidence levels
    pub agreement_by_confidence: BTreeMap<i64, LevelAgreement>,
}

impl RunStats {
    pub fn positive_rate(&self) -> f64 {
        pct(self.positives, self.numeric_flags)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
    pub joined: usize,
    pub only_a: usize,
    pub only_b: usize,
    /// pairs where both flags are numeric
    pub comparable: usize,
    pub agreements: usize,
    pub run_a: RunStats,
    pub run_b: RunStats,
    /// A said 0, B said 1
    pub zero_to_one: usize,
    /// A said 1, B said 0
    pub one_to_zero: usize,
}

impl ComparisonReport {
    pub fn agreement_pct(&self) -> f64 {
        pct(self.agreements, self.comparable)
    }

    pub fn disagreements(&self) -> usize {
        self.comparable - self.agreements
    }

    /// Positive rate of B minus that of A, in percentage points.
    pub fn positive_rate_delta(&self) -> f64 {
        self.run_b.positive_rate() - self.run_a.positive_rate()
    }

    pub fn mean_confidence_delta(&self) -> Option<f64> {
        Some(self.run_b.mean_confidence? - self.run_a.mean_confidence?)
    }

    pub fn interpretation(&self) -> &'static str {
        match self.agreement_pct() {
            p if p >= 95.0 => "excellent agreement",
            p if p >= 90.0 => "very good agreement",
            p if p >= 85.0 => "good agreement",
            p if p >= 80.0 => "moderate agreement",
            _ => "low agreement",
        }
    }

    /// Report lines for the terminal.
    pub fn describe(&self) -> Vec<String> {
        let (a, b) = (&self.run_a.label, &self.run_b.label);
        let mut lines = vec![
            format!("companies in both runs:  {}", self.joined),
            format!("only in {a}:  {}", self.only_a),
            format!("only in {b}:  {}", self.only_b),
            format!(
                "agreement:  {}/{} = {:.2}% ({})",
                self.agreements,
                self.comparable,
                self.agreement_pct(),
                self.interpretation()
            ),
            format!("disagreements:  {}", self.disagreements()),
            format!("  {a}=0 -> {b}=1:  {}", self.zero_to_one),
            format!("  {a}=1 -> {b}=0:  {}", self.one_to_zero),
        ];
        for run in [&self.run_a, &self.run_b] {
            lines.push(format!(
                "{}: positive rate {:.2}%, mean confidence {}",
                run.label,
                run.positive_rate(),
                run.mean_confidence
                    .map(|m| format!("{m:.2}"))
                    .unwrap_or_else(|| "n/a".into())
            ));
            for (lvl, n) in &run.confidence_distribution {
                lines.push(format!("  confidence {lvl}: {n} ({:.1}%)", pct(*n, self.joined)));
            }
            for (lvl, agr) in &run.agreement_by_confidence {
                lines.push(format!(
                    "  agreement at {} confidence {lvl}: {:.2}% ({} pairs)",
                    run.label,
                    agr.pct(),
                    agr.pairs
                ));
            }
        }
        lines.push(format!("positive rate difference ({b} - {a}):  {:+.2}%", self.positive_rate_delta()));
        lines.push(format!(
            "mean confidence difference ({b} - {a}):  {}",
            self.mean_confidence_delta()
                .map(|d| format!("{d:+.2}"))
                .unwrap_or_else(|| "n/a".into())
        ));
        lines
    }
}

/// Identifiers (`org_uuid`) of every row in a dataset CSV.
pub fn load_id_set(dataset_csv: &Path) -> Result<HashSet<String>> {
    Ok(dataset::load_records(dataset_csv)?
        .iter()
        .filter_map(|r| r.id().map(str::to_string))
        .collect())
}

/// Inner join on `CompanyID` in run A's order; for ids repeated in B the first
/// row wins. With `restrict_to`, run A is first limited to those ids.
pub fn join_runs(
    run_a: &[ResultRecord],
    run_b: &[ResultRecord],
    restrict_to: Option<&HashSet<String>>,
) -> (Vec<JoinedRow>, usize, usize) {
    let mut b_by_id: HashMap<&str, &ResultRecord> = HashMap::with_capacity(run_b.len());
    for row in run_b {
        b_by_id.entry(row.company_id.as_str()).or_insert(row);
    }

    let kept_a: Vec<&ResultRecord> = run_a
        .iter()
        .filter(|r| restrict_to.map_or(true, |ids| ids.contains(&r.company_id)))
        .collect();
    let a_ids: HashSet<&str> = kept_a.iter().map(|r| r.company_id.as_str()).collect();

    let mut joined = Vec::new();
    let mut only_a = 0;
    for a in kept_a {
        match b_by_id.get(a.company_id.as_str()) {
            Some(b) => joined.push(JoinedRow {
                company_id: a.company_id.clone(),
                company_name: a.company_name.clone(),
                flag_a: a.ai_native.clone(),
                confidence_a: a.confidence.clone(),
                flag_b: b.ai_native.clone(),
                confidence_b: b.confidence.clone(),
                reasons_a: a.reasons.clone(),
                reasons_b: b.reasons.clone(),
            }),
            None => only_a += 1,
        }
    }
    let only_b = b_by_id.keys().filter(|id| !a_ids.contains(*id)).count();
    (joined, only_a, only_b)
}

fn run_stats<'a>(
    label: &str,
    rows: &'a [JoinedRow],
    fields: impl Fn(&'a JoinedRow) -> (&'a str, &'a str),
) -> RunStats {
    let mut stats = RunStats { label: label.to_string(), ..RunStats::default() };
    let mut conf_sum = 0.0;
    let mut conf_n = 0usize;
    for row in rows {
        let (flag, confidence) = fields(row);
        if let Some(f) = number(flag) {
            stats.numeric_flags += 1;
            if f == 1.0 {
                stats.positives += 1;
            }
        }
        if let Some(c) = number(confidence) {
            conf_sum += c;
            conf_n += 1;
        }
        if let Some(lvl) = level(confidence) {
            *stats.confidence_distribution.entry(lvl).or_default() += 1;
            if let Some(differs) = row.disagrees() {
                let agr = stats.agreement_by_confidence.entry(lvl).or_default();
                agr.pairs += 1;
                agr.agreements += usize::from(!differs);
            }
        }
    }
    stats.mean_confidence = (conf_n > 0).then(|| conf_sum / conf_n as f64);
    stats
}

pub fn compare(
    label_a: &str,
    label_b: &str,
    run_a: &[ResultRecord],
    run_b: &[ResultRecord],
    restrict_to: Option<&HashSet<String>>,
) -> (Vec<JoinedRow>, ComparisonReport) {
    let (joined, only_a, only_b) = join_runs(run_a, run_b, restrict_to);

    let mut comparable = 0;
    let mut agreements = 0;
    let mut zero_to_one = 0;
    let mut one_to_zero = 0;
    for row in &joined {
        let Some(differs) = row.disagrees() else { continue };
        comparable += 1;
        if !differs {
            agreements += 1;
            continue;
        }
        match (number(&row.flag_a), number(&row.flag_b)) {
            (Some(a), Some(b)) if a == 0.0 && b == 1.0 => zero_to_one += 1,
            (Some(a), Some(b)) if a == 1.0 && b == 0.0 => one_to_zero += 1,
            _ => {}
        }
    }

    let report = ComparisonReport {
        joined: joined.len(),
        only_a,
        only_b,
        comparable,
        agreements,
        run_a: run_stats(label_a, &joined, |r| (r.flag_a.as_str(), r.confidence_a.as_str())),
        run_b: run_stats(label_b, &joined, |r| (r.flag_b.as_str(), r.confidence_b.as_str())),
        zero_to_one,
        one_to_zero,
    };
    info!(
        "compared {label_a} vs {label_b}: {} joined, {:.2}% agreement",
        report.joined,
        report.agreement_pct()
    );
    (joined, report)
}

/// Paths of the two comparison tables for a pair of labels.
pub fn output_paths(dir: &Path, label_a: &str, label_b: &str) -> (PathBuf, PathBuf) {
    let stem = format!("{}_vs_{}", label_a.to_lowercase(), label_b.to_lowercase());
    (
        dir.join(format!("full_comparison_{stem}.csv")),
        dir.join(format!("disagreements_{stem}.csv")),
    )
}

/// Write all joined rows to `full` and the numeric disagreements to `disagreements`.
pub fn write_comparison(
    full: &Path,
    disagreements: &Path,
    label_a: &str,
    label_b: &str,
    rows: &[JoinedRow],
) -> Result<usize> {
    let header = [
        "CompanyID".to_string(),
        "CompanyName".to_string(),
        format!("AI_native_{label_a}"),
        format!("Confidence_{label_a}"),
        format!("AI_native_{label_b}"),
        format!("Confidence_{label_b}"),
        format!("Reasons_{label_a}"),
        format!("Reasons_{label_b}"),
    ];
    let fields = |r: &JoinedRow| {
        [
            r.company_id.clone(),
            r.company_name.clone(),
            r.flag_a.clone(),
            r.confidence_a.clone(),
            r.flag_b.clone(),
            r.confidence_b.clone(),
            r.reasons_a.clone(),
            r.reasons_b.clone(),
        ]
    };

    let mut all = AtomicCsvWriter::new(full)?;
    let mut diff = AtomicCsvWriter::new(disagreements)?;
    all.writer_mut().write_record(&header)?;
    diff.writer_mut().write_record(&header)?;

    let mut n_diff = 0;
    for row in rows {
        all.writer_mut().write_record(fields(row))?;
        if row.disagrees() == Some(true) {
            diff.writer_mut().write_record(fields(row))?;
            n_diff += 1;
        }
    }
    all.finish()?;
    diff.finish()?;
    Ok(n_diff)
}
