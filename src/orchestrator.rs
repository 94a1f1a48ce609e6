//! Batch lifecycle orchestration.
//!
//! Every batch moves through one state machine:
//!
//! ```text
//! PENDING -> FILE_BUILT -> SUBMITTED -> {VALIDATING, IN_PROGRESS, FINALIZING, CANCELLING}
//!         -> {COMPLETED, FAILED, EXPIRED, CANCELLED}
//! COMPLETED -> DOWNLOADED
//! ```
//!
//! The state of each batch is recovered from the artifacts on disk when the
//! orchestrator is created, so a rerun picks up exactly where the last one
//! stopped. [`Orchestrator::advance`] performs one round of work and returns;
//! [`Orchestrator::run`] repeats rounds with a [`Pause`] in between until no
//! batch has anything left to do.

use std::{collections::BTreeMap, fs, io, ops::Range, time::Duration};

use async_trait::async_trait;
use log::{info, warn};

use crate::artifacts::{write_atomic, ArtifactLayout};
use crate::config::{OnSubmitError, PipelineConfig, SchedulePolicy};
use crate::dataset::{self, Record};
use crate::error::{PipelineError, Result};
use crate::partition::BatchPlan;
use crate::remote::{BatchApi, RemoteBatch, RemoteStatus, RequestCounts};
use crate::requests::RequestTemplate;
use crate::responses::{parse_results, write_result_table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchState {
    Pending,
    FileBuilt,
    Submitted,
    Validating,
    InProgress,
    Finalizing,
    Cancelling,
    Completed,
    Failed,
    Expired,
    Cancelled,
    Downloaded,
}

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::FileBuilt => "file_built",
            BatchState::Submitted => "submitted",
            BatchState::Validating => "validating",
            BatchState::InProgress => "in_progress",
            BatchState::Finalizing => "finalizing",
            BatchState::Cancelling => "cancelling",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
            BatchState::Expired => "expired",
            BatchState::Cancelled => "cancelled",
            BatchState::Downloaded => "downloaded",
        }
    }

    /// Submitted and not yet terminal on the remote side.
    pub fn awaits_remote(self) -> bool {
        matches!(
            self,
            BatchState::Submitted
                | BatchState::Validating
                | BatchState::InProgress
                | BatchState::Finalizing
                | BatchState::Cancelling
        )
    }

    /// Terminal without results: failed, expired or cancelled.
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, BatchState::Failed | BatchState::Expired | BatchState::Cancelled)
    }
}

impl From<RemoteStatus> for BatchState {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Validating => BatchState::Validating,
            RemoteStatus::InProgress => BatchState::InProgress,
            RemoteStatus::Finalizing => BatchState::Finalizing,
            RemoteStatus::Cancelling => BatchState::Cancelling,
            RemoteStatus::Completed => BatchState::Completed,
            RemoteStatus::Failed => BatchState::Failed,
            RemoteStatus::Expired => BatchState::Expired,
            RemoteStatus::Cancelled => BatchState::Cancelled,
            // keep polling until the service says something we understand
            RemoteStatus::Unknown => BatchState::Submitted,
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One batch and everything known about it.
#[derive(Debug, Clone)]
pub struct BatchSlot {
    /// 1-based batch number
    pub number: usize,
    pub range: Range<usize>,
    pub state: BatchState,
    pub submission_id: Option<String>,
    pub output_file_id: Option<String>,
    pub counts: Option<RequestCounts>,
    /// submission failed or was withheld, or polling gave up; not retried within this run
    pub blocked: bool,
    pub last_error: Option<String>,
    /// failed status checks since the last successful one
    pub poll_failures: usize,
    /// rows in the parsed table, once downloaded
    pub rows: Option<usize>,
    pub dropped: usize,
}

impl BatchSlot {
    fn new(number: usize, range: Range<usize>) -> Self {
        Self {
            number,
            range,
            state: BatchState::Pending,
            submission_id: None,
            output_file_id: None,
            counts: None,
            blocked: false,
            last_error: None,
            poll_failures: 0,
            rows: None,
            dropped: 0,
        }
    }

    fn observe(&mut self, remote: &RemoteBatch) {
        self.state = BatchState::from(remote.status);
        if remote.request_counts.is_some() {
            self.counts = remote.request_counts;
        }
        if remote.output_file_id.is_some() {
            self.output_file_id = remote.output_file_id.clone();
        }
    }

    fn downloadable(&self) -> bool {
        self.state == BatchState::Completed && self.output_file_id.is_some()
    }

    /// Nothing more will happen to this batch in the current run.
    pub fn is_settled(&self) -> bool {
        match self.state {
            BatchState::Downloaded => true,
            BatchState::Completed => self.output_file_id.is_none(),
            s if s.is_unsuccessful() => true,
            BatchState::Pending | BatchState::FileBuilt => self.blocked,
            s if s.awaits_remote() => self.blocked,
            _ => false,
        }
    }

    /// One-line status as printed after every poll.
    pub fn status_line(&self) -> String {
        let id = self.submission_id.as_deref().unwrap_or("-");
        let mut line = format!("batch {} [{id}]: {}", self.number, self.state);
        if let Some(c) = self.counts {
            line.push_str(&format!(
                " {}/{} ({:.1}%), {} failed",
                c.completed,
                c.total,
                c.percent_done(),
                c.failed
            ));
        }
        if let Some(rows) = self.rows {
            line.push_str(&format!(", {rows} rows"));
            if self.dropped > 0 {
                line.push_str(&format!(", {} dropped", self.dropped));
            }
        }
        if let Some(err) = &self.last_error {
            line.push_str(&format!(" (last error: {err})"));
        }
        line
    }
}

/// Waits between poll rounds.
#[async_trait]
pub trait Pause: Send {
    async fn pause(&mut self, interval: Duration);
}

/// Real wall-clock wait.
pub struct TokioPause;

#[async_trait]
impl Pause for TokioPause {
    async fn pause(&mut self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

/// What one call to [`Orchestrator::advance`] did.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub round: usize,
    pub built: usize,
    pub submitted: usize,
    pub submit_failures: usize,
    pub polled: usize,
    pub poll_errors: usize,
    pub downloaded: usize,
    /// batches with work left after this round
    pub outstanding: usize,
    pub by_state: BTreeMap<BatchState, usize>,
    pub status_lines: Vec<String>,
}

impl RoundReport {
    pub fn is_finished(&self) -> bool {
        self.outstanding == 0
    }

    pub fn summary(&self) -> String {
        let states: Vec<String> = self
            .by_state
            .iter()
            .map(|(s, n)| format!("{n} {s}"))
            .collect();
        format!(
            "round {}: {} built, {} submitted, {} polled, {} downloaded; {}",
            self.round,
            self.built,
            self.submitted,
            self.polled,
            self.downloaded,
            states.join(", ")
        )
    }
}

/// Final accounting of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub downloaded: usize,
    pub submitted_this_run: usize,
    pub downloaded_this_run: usize,
    pub expected_records: usize,
    pub result_rows: usize,
    pub dropped_lines: usize,
    /// batch numbers without a parsed table, with their state
    pub missing: Vec<(usize, BatchState)>,
}

impl RunSummary {
    pub fn deficit(&self) -> usize {
        self.expected_records.saturating_sub(self.result_rows)
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.deficit() == 0
    }
}

pub struct Orchestrator<A: BatchApi> {
    api: A,
    config: PipelineConfig,
    layout: ArtifactLayout,
    plan: BatchPlan,
    records: Vec<Record>,
    system_prompt: String,
    slots: Vec<BatchSlot>,
    rounds: usize,
    submitted_this_run: usize,
    downloaded_this_run: usize,
    submissions_halted: bool,
}

impl<A: BatchApi> Orchestrator<A> {
    /// Validate the configuration, load the dataset and recover batch states.
    pub fn new(api: A, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let records = dataset::load_records(&config.input_csv)?;
        Self::with_records(api, config, records)
    }

    /// As [`Orchestrator::new`] with records that are already loaded.
    pub fn with_records(api: A, config: PipelineConfig, records: Vec<Record>) -> Result<Self> {
        config.validate()?;
        let system_prompt = config.load_system_prompt()?;
        let plan = BatchPlan::compute(records.len(), &config.limits)?;
        for line in plan.describe(&config.limits) {
            info!("{line}");
        }

        let layout = ArtifactLayout::new(&config.work_dir);
        layout.ensure_dirs()?;

        let mut slots = Vec::with_capacity(plan.batch_count);
        for (n, range) in plan.ranges() {
            slots.push(recover_slot(&layout, n, range)?);
        }
        let resumed = slots.iter().filter(|s| s.state != BatchState::Pending).count();
        if resumed > 0 {
            info!("resuming: {resumed} of {} batches have prior artifacts", slots.len());
        }

        Ok(Self {
            api,
            config,
            layout,
            plan,
            records,
            system_prompt,
            slots,
            rounds: 0,
            submitted_this_run: 0,
            downloaded_this_run: 0,
            submissions_halted: false,
        })
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn plan(&self) -> &BatchPlan {
        &self.plan
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn slots(&self) -> &[BatchSlot] {
        &self.slots
    }

    /// One round of work under the configured schedule.
    pub async fn advance(&mut self) -> Result<RoundReport> {
        self.rounds += 1;
        let mut report = RoundReport { round: self.rounds, ..RoundReport::default() };

        match self.config.schedule {
            SchedulePolicy::Parallel => self.parallel_round(&mut report).await?,
            SchedulePolicy::Sequential => self.sequential_round(&mut report).await?,
        }

        for slot in &self.slots {
            *report.by_state.entry(slot.state).or_default() += 1;
            if !slot.is_settled() {
                report.outstanding += 1;
            }
        }
        info!("{}", report.summary());
        Ok(report)
    }

    /// Rounds until every batch is settled, pausing `poll_interval` in between.
    pub async fn run(
        &mut self,
        pause: &mut dyn Pause,
        mut on_round: impl FnMut(&RoundReport),
    ) -> Result<RunSummary> {
        loop {
            let report = self.advance().await?;
            on_round(&report);
            if report.is_finished() {
                break;
            }
            pause.pause(self.config.poll_interval).await;
        }
        Ok(self.summary())
    }

    pub fn summary(&self) -> RunSummary {
        let downloaded: Vec<&BatchSlot> = self
            .slots
            .iter()
            .filter(|s| s.state == BatchState::Downloaded)
            .collect();
        RunSummary {
            batches: self.slots.len(),
            downloaded: downloaded.len(),
            submitted_this_run: self.submitted_this_run,
            downloaded_this_run: self.downloaded_this_run,
            expected_records: self.plan.total_records,
            result_rows: downloaded.iter().filter_map(|s| s.rows).sum(),
            dropped_lines: downloaded.iter().map(|s| s.dropped).sum(),
            missing: self
                .slots
                .iter()
                .filter(|s| s.state != BatchState::Downloaded)
                .map(|s| (s.number, s.state))
                .collect(),
        }
    }

    async fn parallel_round(&mut self, report: &mut RoundReport) -> Result<()> {
        for idx in 0..self.slots.len() {
            if self.slots[idx].state == BatchState::Pending {
                self.build_file(idx, report)?;
            }
        }
        for idx in 0..self.slots.len() {
            if self.slots[idx].state == BatchState::FileBuilt && !self.slots[idx].blocked {
                self.submit(idx, report).await;
            }
        }
        self.poll_and_collect(0..self.slots.len(), report).await
    }

    async fn sequential_round(&mut self, report: &mut RoundReport) -> Result<()> {
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_settled() {
                continue;
            }
            if self.slots[idx].state == BatchState::Pending && !self.submissions_halted {
                self.build_file(idx, report)?;
            }
            if self.slots[idx].state == BatchState::FileBuilt && !self.slots[idx].blocked {
                self.submit(idx, report).await;
            }
            if self.slots[idx].state == BatchState::Pending && self.submissions_halted {
                self.slots[idx].blocked = true;
            }
            self.poll_and_collect(idx..idx + 1, report).await?;

            if !self.slots[idx].is_settled() {
                // still waiting on the service; the next batch starts after this one
                break;
            }
        }
        Ok(())
    }

    async fn poll_and_collect(&mut self, indices: Range<usize>, report: &mut RoundReport) -> Result<()> {
        for idx in indices.clone() {
            if self.slots[idx].state.awaits_remote() {
                self.poll(idx, report).await;
            }
        }
        for idx in indices {
            if self.slots[idx].downloadable() {
                self.download(idx, report).await?;
            }
        }
        Ok(())
    }

    /// PENDING -> FILE_BUILT
    fn build_file(&mut self, idx: usize, report: &mut RoundReport) -> Result<()> {
        let slot = &self.slots[idx];
        let path = self.layout.request_file(slot.number);
        if !path.exists() {
            let template = RequestTemplate {
                model: &self.config.model,
                endpoint: &self.config.endpoint,
                system_prompt: &self.system_prompt,
                mode: self.config.description_mode,
            };
            let range = slot.range.clone();
            template.write_batch_file(&path, &self.records[range.clone()], range.start)?;
            report.built += 1;
        }
        self.slots[idx].state = BatchState::FileBuilt;
        Ok(())
    }

    /// FILE_BUILT -> SUBMITTED. Failures leave the batch FILE_BUILT.
    async fn submit(&mut self, idx: usize, report: &mut RoundReport) {
        let number = self.slots[idx].number;
        if self.submissions_halted {
            self.slots[idx].blocked = true;
            return;
        }
        match self.try_submit(number).await {
            Ok(remote) => {
                info!("batch {number}: submitted as {}", remote.id);
                let slot = &mut self.slots[idx];
                slot.submission_id = Some(remote.id.clone());
                slot.observe(&remote);
                // a fresh batch is never terminal; anything else means "submitted"
                if !slot.state.awaits_remote() && !slot.state.is_unsuccessful() {
                    slot.state = BatchState::Submitted;
                }
                slot.last_error = None;
                self.submitted_this_run += 1;
                report.submitted += 1;
            }
            Err(e) => {
                warn!("batch {number}: submission failed: {e}");
                let slot = &mut self.slots[idx];
                slot.blocked = true;
                slot.last_error = Some(e.to_string());
                report.submit_failures += 1;
                if self.config.on_submit_error == OnSubmitError::Abort {
                    warn!("no further batches will be submitted in this run");
                    self.submissions_halted = true;
                }
            }
        }
    }

    async fn try_submit(&self, number: usize) -> Result<RemoteBatch> {
        let path = self.layout.request_file(number);
        let size = fs::metadata(&path).map_err(|e| PipelineError::io(&path, e))?.len();
        let limit = self.config.limits.max_file_bytes;
        if size > limit {
            return Err(PipelineError::FileTooLarge { path, size, limit });
        }

        let file_id = self.api.upload_file(&path).await?;
        let remote = self
            .api
            .create_batch(&file_id, &self.config.endpoint, &self.config.completion_window)
            .await?;
        // the id must be on disk before the submission counts as done
        self.layout.write_submission_id(number, &remote.id)?;
        Ok(remote)
    }

    async fn poll(&mut self, idx: usize, report: &mut RoundReport) {
        let Some(id) = self.slots[idx].submission_id.clone() else {
            return;
        };
        report.polled += 1;
        match self.api.retrieve_batch(&id).await {
            Ok(remote) => {
                let slot = &mut self.slots[idx];
                slot.observe(&remote);
                slot.last_error = None;
                slot.poll_failures = 0;
                if slot.state == BatchState::Completed && slot.output_file_id.is_none() {
                    warn!("batch {}: completed without an output file", slot.number);
                    slot.last_error = Some("completed without an output file".into());
                } else if slot.state.is_unsuccessful() {
                    warn!("batch {}: ended {}", slot.number, slot.state);
                }
            }
            Err(e) => {
                let cap = self.config.max_poll_errors;
                let slot = &mut self.slots[idx];
                slot.poll_failures += 1;
                slot.last_error = Some(e.to_string());
                report.poll_errors += 1;
                if !e.is_transient() {
                    warn!("batch {}: status check failed, giving up for this run: {e}", slot.number);
                    slot.blocked = true;
                } else if cap > 0 && slot.poll_failures >= cap {
                    warn!(
                        "batch {}: {} status checks failed in a row, giving up for this run: {e}",
                        slot.number, slot.poll_failures
                    );
                    slot.blocked = true;
                } else {
                    warn!("batch {}: status check failed, retrying next round: {e}", slot.number);
                }
            }
        }
        let line = self.slots[idx].status_line();
        info!("{line}");
        report.status_lines.push(line);
    }

    /// COMPLETED -> DOWNLOADED
    async fn download(&mut self, idx: usize, report: &mut RoundReport) -> Result<()> {
        let number = self.slots[idx].number;
        match self.try_download(idx).await {
            Ok(()) => {
                report.downloaded += 1;
                let line = self.slots[idx].status_line();
                info!("{line}");
                report.status_lines.push(line);
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!("batch {number}: download failed, retrying next round: {e}");
                self.slots[idx].last_error = Some(e.to_string());
                Ok(())
            }
            Err(e) => {
                warn!("batch {number}: download failed: {e}");
                let slot = &mut self.slots[idx];
                slot.last_error = Some(e.to_string());
                slot.output_file_id = None;
                Ok(())
            }
        }
    }

    async fn try_download(&mut self, idx: usize) -> Result<()> {
        let number = self.slots[idx].number;
        let output = self.layout.output_csv(number);
        if output.exists() {
            self.slots[idx].state = BatchState::Downloaded;
            return Ok(());
        }
        let Some(file_id) = self.slots[idx].output_file_id.clone() else {
            return Ok(());
        };

        let raw_path = self.layout.raw_result_file(number);
        let raw = if raw_path.exists() {
            fs::read_to_string(&raw_path).map_err(|e| PipelineError::io(&raw_path, e))?
        } else {
            let raw = self.api.file_content(&file_id).await?;
            write_atomic(&raw_path, raw.as_bytes())?;
            self.downloaded_this_run += 1;
            raw
        };

        let parsed = parse_results(&raw);
        let issues = serde_json::to_string_pretty(&parsed.issues)?;
        write_atomic(&self.layout.issues_file(number), issues.as_bytes())?;
        write_result_table(&output, &parsed.rows)?;

        let expected = self.slots[idx].range.len();
        if parsed.rows.len() != expected {
            warn!(
                "batch {number}: {} result rows for {expected} requests ({} lines dropped)",
                parsed.rows.len(),
                parsed.dropped()
            );
        }

        if self.config.schedule == SchedulePolicy::Sequential {
            let request = self.layout.request_file(number);
            match fs::remove_file(&request) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove {}: {e}", request.display()),
            }
        }

        let slot = &mut self.slots[idx];
        slot.state = BatchState::Downloaded;
        slot.rows = Some(parsed.rows.len());
        slot.dropped = parsed.dropped();
        slot.last_error = None;
        Ok(())
    }
}

/// Recover a batch's state from the artifacts it left behind.
fn recover_slot(layout: &ArtifactLayout, number: usize, range: Range<usize>) -> Result<BatchSlot> {
    let mut slot = BatchSlot::new(number, range);
    let output = layout.output_csv(number);
    if output.exists() {
        slot.state = BatchState::Downloaded;
        slot.rows = Some(dataset::count_rows(&output)?);
        slot.dropped = read_issue_count(layout, number);
        slot.submission_id = layout.read_submission_id(number)?;
    } else if let Some(id) = layout.read_submission_id(number)? {
        slot.state = BatchState::Submitted;
        slot.submission_id = Some(id);
    } else if layout.request_file(number).exists() {
        slot.state = BatchState::FileBuilt;
    }
    Ok(slot)
}

/// Dropped-line count from the issues file; 0 when there is none.
fn read_issue_count(layout: &ArtifactLayout, number: usize) -> usize {
    let path = layout.issues_file(number);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("batch {number}: cannot read {}: {e}; dropped lines not counted", path.display());
            return 0;
        }
    };
    match serde_json::from_str::<Vec<String>>(&text) {
        Ok(issues) => issues.len(),
        Err(e) => {
            warn!("batch {number}: {} is not an issue list: {e}; dropped lines not counted", path.display());
            0
        }
    }
}

/// Current remote status of every persisted submission, read-only.
pub async fn survey<A: BatchApi + ?Sized>(
    api: &A,
    layout: &ArtifactLayout,
) -> Result<Vec<(usize, String, Result<RemoteBatch>)>> {
    let mut out = Vec::new();
    for (number, id) in layout.discover_submissions()? {
        let status = api.retrieve_batch(&id).await;
        out.push((number, id, status));
    }
    Ok(out)
}
