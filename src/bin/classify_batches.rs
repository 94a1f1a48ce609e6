/*
cargo run --release --bin classify_batches -- \
    data/startups_both_descriptions.csv \
    output/results_both.csv \
    --system-prompt prompts/system_prompt.txt \
    --mode both \
    --schedule parallel \
    --work-dir batch_files_both

# one round only, e.g. from cron
cargo run --release --bin classify_batches -- \
    data/startups_both_descriptions.csv output/results_short.csv \
    --system-prompt prompts/system_prompt.txt --mode short-only --once
*/

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use startup_classifier::{
    aggregate,
    config::{
        ApiArgs, DescriptionMode, LimitArgs, OnSubmitError, PipelineConfig, SchedulePolicy,
        CHAT_COMPLETIONS_ENDPOINT, DEFAULT_MODEL,
    },
    dataset, logging,
    orchestrator::{Orchestrator, RoundReport, TokioPause},
    partition::BatchPlan,
    requests::{measure_sample, RequestTemplate},
    OpenAiBatchClient, PipelineError, RunSummary,
};

#[derive(Parser, Debug)]
#[command(version, about = "Classify company records through the batch API, resuming from prior artifacts.")]
struct Cli {
    /// Company CSV to classify
    input: PathBuf,
    /// Merged result table
    output: PathBuf,

    #[arg(long = "system-prompt", default_value = "system_prompt.txt")]
    system_prompt: PathBuf,

    #[arg(long, value_enum, default_value_t = DescriptionMode::Both)]
    mode: DescriptionMode,

    #[arg(long, value_enum, default_value_t = SchedulePolicy::Parallel)]
    schedule: SchedulePolicy,

    #[arg(long = "on-submit-error", value_enum, default_value_t = OnSubmitError::Continue)]
    on_submit_error: OnSubmitError,

    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long = "work-dir", default_value = "batch_files")]
    work_dir: PathBuf,

    #[arg(long = "poll-secs", default_value_t = 60)]
    poll_secs: u64,

    /// Give a batch up for this run after this many failed status checks in a row (0 = never)
    #[arg(long = "max-poll-errors", default_value_t = 20)]
    max_poll_errors: usize,

    #[arg(long = "completion-window", default_value = "24h")]
    completion_window: String,

    /// Filter the input to rows with both descriptions first, writing this file
    #[arg(long = "filter-to", value_name = "PATH")]
    filter_to: Option<PathBuf>,

    /// Measure byte and token estimates from the first N rendered requests
    #[arg(long = "measure-sample", value_name = "N")]
    measure_sample: Option<usize>,

    /// Print the batch plan and exit without contacting the service
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Run a single round and exit
    #[arg(long)]
    once: bool,

    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,

    #[command(flatten)]
    api: ApiArgs,

    #[command(flatten)]
    limits: LimitArgs,
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Run summary ===");
    println!("Batches downloaded:      {}/{}", summary.downloaded, summary.batches);
    println!("Submitted this run:      {}", summary.submitted_this_run);
    println!("Downloaded this run:     {}", summary.downloaded_this_run);
    println!(
        "Result rows:             {} of {} records",
        summary.result_rows, summary.expected_records
    );
    if summary.dropped_lines > 0 {
        println!("Unparseable lines:       {} (see batch_<n>_issues.json)", summary.dropped_lines);
    }
    for (n, state) in &summary.missing {
        println!("  batch {n}: {state}");
    }
    if summary.deficit() > 0 {
        println!("Deficit:                 {} records without a result", summary.deficit());
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&cli.log_dir, "classify_batches").context("cannot set up logging")?;

    let input = match &cli.filter_to {
        Some(filtered) => {
            let stats = dataset::filter_both_descriptions(&cli.input, filtered)
                .with_context(|| format!("filtering {}", cli.input.display()))?;
            println!(
                "Filtered {} → {} rows with both descriptions ({:.1}%)",
                stats.total,
                stats.kept,
                stats.retained_pct()
            );
            filtered.clone()
        }
        None => cli.input.clone(),
    };

    let mut config = PipelineConfig {
        input_csv: input,
        output_csv: cli.output.clone(),
        system_prompt_file: cli.system_prompt.clone(),
        work_dir: cli.work_dir.clone(),
        model: cli.model.clone(),
        description_mode: cli.mode,
        limits: cli.limits.to_limits(),
        schedule: cli.schedule,
        on_submit_error: cli.on_submit_error,
        poll_interval: Duration::from_secs(cli.poll_secs),
        max_poll_errors: cli.max_poll_errors,
        completion_window: cli.completion_window.clone(),
        endpoint: CHAT_COMPLETIONS_ENDPOINT.to_string(),
    };
    config.validate()?;
    let records = dataset::load_records(&config.input_csv)
        .with_context(|| format!("cannot load {}", config.input_csv.display()))?;

    if let Some(sample) = cli.measure_sample {
        let prompt = config.load_system_prompt()?;
        let template = RequestTemplate {
            model: &config.model,
            endpoint: &config.endpoint,
            system_prompt: &prompt,
            mode: config.description_mode,
        };
        if let Some(est) = measure_sample(&template, &records, sample)? {
            println!(
                "Measured over {} requests: {:.0} bytes, {:.0} tokens per request",
                est.sampled, est.avg_bytes, est.avg_tokens
            );
            config.limits.est_bytes_per_request = est.avg_bytes;
            config.limits.est_tokens_per_request = est.avg_tokens;
        }
    }

    if cli.dry_run {
        let plan = BatchPlan::compute(records.len(), &config.limits)?;
        for line in plan.describe(&config.limits) {
            println!("{line}");
        }
        for (n, range) in plan.ranges() {
            println!("  batch {n}: rows {}..{} ({})", range.start, range.end, range.len());
        }
        return Ok(ExitCode::SUCCESS);
    }

    // configuration errors surface before any remote call
    let key = cli.api.resolve_key()?;
    let client = OpenAiBatchClient::new(
        &key,
        &cli.api.base_url,
        Duration::from_secs(cli.api.http_timeout_secs),
    )?;

    let mut orchestrator = Orchestrator::with_records(client, config.clone(), records)?;
    let plan = orchestrator.plan().clone();
    println!(
        "{} records in {} batches (~{} each, limit {} by {})",
        plan.total_records, plan.batch_count, plan.records_per_batch, plan.effective_limit, plan.binding
    );

    let print_round = |report: &RoundReport| {
        for line in &report.status_lines {
            println!("  {line}");
        }
        println!("{}", report.summary());
    };

    let summary = if cli.once {
        let report = orchestrator.advance().await?;
        print_round(&report);
        orchestrator.summary()
    } else {
        orchestrator.run(&mut TokioPause, print_round).await?
    };
    print_summary(&summary);

    match aggregate::merge_batch_outputs(orchestrator.layout(), Some(plan.batch_count), &config.output_csv) {
        Ok(merge) => {
            println!(
                "✔ Merged {} rows from {}/{} batches → {}",
                merge.rows,
                merge.merged.len(),
                plan.batch_count,
                merge.output.display()
            );
            println!("  AI_native=1: {}, AI_native=0: {}", merge.positives, merge.negatives);
        }
        Err(PipelineError::NoBatchOutputs(dir)) => {
            warn!("nothing to merge yet in {}", dir.display());
            println!("No batch outputs to merge yet.");
        }
        Err(e) => return Err(e).context("merging batch outputs"),
    }

    info!("Program finished");
    if cli.once || summary.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
