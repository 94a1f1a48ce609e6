/*
cargo run --release --bin prepare_dataset -- \
    data/startups_raw.csv \
    data/startups_both_descriptions.csv
*/

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use startup_classifier::{dataset, logging};

#[derive(Parser, Debug)]
#[command(version, about = "Keep only companies that have both a short and a long description.")]
struct Cli {
    /// Raw company CSV
    input: PathBuf,
    /// Filtered CSV, all original columns
    output: PathBuf,
    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_dir, "prepare_dataset").context("cannot set up logging")?;

    let stats = dataset::filter_both_descriptions(&cli.input, &cli.output)
        .with_context(|| format!("filtering {}", cli.input.display()))?;

    println!("Total companies:              {}", stats.total);
    println!("With short description:       {}", stats.with_short);
    println!("With long description:        {}", stats.with_long);
    println!(
        "With both (kept):             {} ({:.1}%)",
        stats.kept,
        stats.retained_pct()
    );
    println!("✔ Filtered dataset → {}", cli.output.display());
    Ok(())
}
