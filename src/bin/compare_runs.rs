/*
cargo run --release --bin compare_runs -- \
    output/results_both.csv \
    output/results_short.csv \
    --restrict-to data/startups_both_descriptions.csv \
    --out-dir output/comparison
*/

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use startup_classifier::{compare, logging, responses::read_result_table};

#[derive(Parser, Debug)]
#[command(version, about = "Join two result tables on CompanyID and report agreement.")]
struct Cli {
    /// Result table of run A
    run_a: PathBuf,
    /// Result table of run B
    run_b: PathBuf,

    #[arg(long = "label-a", default_value = "Both")]
    label_a: String,

    #[arg(long = "label-b", default_value = "Short")]
    label_b: String,

    /// Only keep run A rows whose id appears in this dataset's org_uuid column
    #[arg(long = "restrict-to", value_name = "CSV")]
    restrict_to: Option<PathBuf>,

    #[arg(long = "out-dir", default_value = ".")]
    out_dir: PathBuf,

    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_dir, "compare_runs").context("cannot set up logging")?;

    let run_a = read_result_table(&cli.run_a).with_context(|| format!("reading {}", cli.run_a.display()))?;
    let run_b = read_result_table(&cli.run_b).with_context(|| format!("reading {}", cli.run_b.display()))?;
    println!("{}: {} rows, {}: {} rows", cli.label_a, run_a.len(), cli.label_b, run_b.len());

    let restrict = cli
        .restrict_to
        .as_deref()
        .map(compare::load_id_set)
        .transpose()
        .context("loading restriction dataset")?;
    if let Some(ids) = &restrict {
        println!("Restricting {} to {} dataset ids", cli.label_a, ids.len());
    }

    let (rows, report) = compare::compare(&cli.label_a, &cli.label_b, &run_a, &run_b, restrict.as_ref());
    for line in report.describe() {
        println!("{line}");
    }

    fs::create_dir_all(&cli.out_dir).with_context(|| format!("creating {}", cli.out_dir.display()))?;
    let (full, diff) = compare::output_paths(&cli.out_dir, &cli.label_a, &cli.label_b);
    let n_diff = compare::write_comparison(&full, &diff, &cli.label_a, &cli.label_b, &rows)?;
    println!("✔ Full comparison ({} rows) → {}", rows.len(), full.display());
    println!("✔ Disagreements ({n_diff} rows) → {}", diff.display());
    Ok(())
}
