/*
cargo run --release --bin merge_results -- \
    output/results_both.csv \
    --work-dir batch_files_both \
    --expected-batches 18
*/

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use startup_classifier::{aggregate, artifacts::ArtifactLayout, logging, PipelineError};

/// Exit status when there is nothing to merge.
const EXIT_NO_OUTPUTS: u8 = 2;

#[derive(Parser, Debug)]
#[command(version, about = "Concatenate batch_<n>_output.csv tables in batch order.")]
struct Cli {
    /// Merged result table
    output: PathBuf,

    #[arg(long = "work-dir", default_value = "batch_files")]
    work_dir: PathBuf,

    /// Planned batch count; missing batch numbers are reported against it
    #[arg(long = "expected-batches")]
    expected_batches: Option<usize>,

    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&cli.log_dir, "merge_results").context("cannot set up logging")?;

    let layout = ArtifactLayout::new(&cli.work_dir);
    let report = match aggregate::merge_batch_outputs(&layout, cli.expected_batches, &cli.output) {
        Ok(r) => r,
        Err(PipelineError::NoBatchOutputs(dir)) => {
            eprintln!("No batch output tables found in {}", dir.display());
            return Ok(ExitCode::from(EXIT_NO_OUTPUTS));
        }
        Err(e) => return Err(e).context("merging batch outputs"),
    };

    println!("Rows:          {}", report.rows);
    match report.expected {
        Some(expected) => println!("Batches:       {}/{expected}", report.merged.len()),
        None => println!("Batches:       {}", report.merged.len()),
    }
    if !report.missing.is_empty() {
        println!("Missing:       {:?}", report.missing);
    }
    if !report.stale.is_empty() {
        println!("Skipped:       {:?} (beyond the planned batch count)", report.stale);
    }
    println!("AI_native=1:   {}", report.positives);
    println!("AI_native=0:   {}", report.negatives);
    if report.other_labels() > 0 {
        println!("Other labels:  {}", report.other_labels());
    }
    println!("✔ Merged → {}", report.output.display());
    Ok(ExitCode::SUCCESS)
}
