/*
cargo run --release --bin check_batches -- --work-dir batch_files_both
*/

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use startup_classifier::{
    artifacts::ArtifactLayout, config::ApiArgs, logging, orchestrator::survey, remote::RemoteStatus,
    OpenAiBatchClient,
};

#[derive(Parser, Debug)]
#[command(version, about = "Print the remote status of every submitted batch. Changes nothing.")]
struct Cli {
    #[arg(long = "work-dir", default_value = "batch_files")]
    work_dir: PathBuf,

    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,

    #[command(flatten)]
    api: ApiArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_dir, "check_batches").context("cannot set up logging")?;

    let key = cli.api.resolve_key()?;
    let client = OpenAiBatchClient::new(
        &key,
        &cli.api.base_url,
        Duration::from_secs(cli.api.http_timeout_secs),
    )?;
    let layout = ArtifactLayout::new(&cli.work_dir);

    let statuses = survey(&client, &layout)
        .await
        .with_context(|| format!("reading submissions under {}", cli.work_dir.display()))?;
    if statuses.is_empty() {
        println!("No submitted batches under {}", cli.work_dir.display());
        return Ok(());
    }

    let mut completed = 0;
    for (n, id, status) in &statuses {
        match status {
            Ok(batch) => {
                let progress = batch
                    .request_counts
                    .map(|c| format!("{}/{} ({:.1}%), {} failed", c.completed, c.total, c.percent_done(), c.failed))
                    .unwrap_or_default();
                let downloaded = if layout.output_csv(*n).exists() { " [downloaded]" } else { "" };
                println!("batch {n} [{id}]: {} {progress}{downloaded}", batch.status.as_str());
                if batch.status == RemoteStatus::Completed {
                    completed += 1;
                }
            }
            Err(e) => {
                log::warn!("batch {n} [{id}]: {e}");
                println!("batch {n} [{id}]: status unavailable: {e}");
            }
        }
    }
    println!("\n{completed}/{} batches completed", statuses.len());
    Ok(())
}
