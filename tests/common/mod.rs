//! In-memory batch service and run fixtures shared by the integration tests.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use startup_classifier::{
    config::{BatchLimits, DescriptionMode, OnSubmitError, PipelineConfig, SchedulePolicy},
    orchestrator::Pause,
    remote::{BatchApi, RemoteBatch, RemoteStatus, RequestCounts},
    PipelineError, Result,
};
use tempfile::TempDir;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub uploads: usize,
    pub creates: usize,
    pub retrieves: usize,
    pub downloads: usize,
}

#[derive(Default)]
struct FakeState {
    calls: Calls,
    /// uploaded request text by batch number
    files: HashMap<usize, String>,
    polls: HashMap<usize, usize>,
    failed_polls: HashMap<usize, usize>,
    failed_downloads: HashSet<usize>,
}

/// Echoes every request back as a well-formed completion.
#[derive(Default)]
pub struct FakeBatchApi {
    state: Mutex<FakeState>,
    /// polls answered `in_progress` before a batch reports a terminal state
    pub in_progress_polls: usize,
    pub fail_batches: HashSet<usize>,
    pub reject_uploads: HashSet<usize>,
    /// custom ids whose completion comes back with too few fields
    pub garbled: HashSet<String>,
    /// batch -> status checks answered 503 before the batch is visible
    pub poll_outages: HashMap<usize, usize>,
    /// batches whose status check always answers 404
    pub unknown_batches: HashSet<usize>,
    /// batches whose first download answers 503
    pub flaky_downloads: HashSet<usize>,
    /// batches that complete without an output file
    pub empty_completions: HashSet<usize>,
}

impl FakeBatchApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress_for(mut self, polls: usize) -> Self {
        self.in_progress_polls = polls;
        self
    }

    pub fn failing(mut self, batch: usize) -> Self {
        self.fail_batches.insert(batch);
        self
    }

    pub fn rejecting_upload(mut self, batch: usize) -> Self {
        self.reject_uploads.insert(batch);
        self
    }

    pub fn garbling(mut self, custom_id: &str) -> Self {
        self.garbled.insert(custom_id.to_string());
        self
    }

    pub fn failing_polls(mut self, batch: usize, times: usize) -> Self {
        self.poll_outages.insert(batch, times);
        self
    }

    pub fn forgetting(mut self, batch: usize) -> Self {
        self.unknown_batches.insert(batch);
        self
    }

    pub fn failing_download_once(mut self, batch: usize) -> Self {
        self.flaky_downloads.insert(batch);
        self
    }

    pub fn completing_without_output(mut self, batch: usize) -> Self {
        self.empty_completions.insert(batch);
        self
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls
    }
}

fn batch_number(path: &Path) -> usize {
    let name = path.file_name().unwrap().to_string_lossy();
    name.trim_start_matches("batch_")
        .split('_')
        .next()
        .and_then(|n| n.parse().ok())
        .expect("request file named batch_<n>_requests.jsonl")
}

fn number_from_id(id: &str) -> usize {
    id.rsplit('-').next().unwrap().parse().unwrap()
}

fn field<'a>(message: &'a str, key: &str) -> &'a str {
    message
        .lines()
        .find_map(|l| l.strip_prefix(key))
        .map(str::trim)
        .unwrap_or("")
}

fn completion_for(request_line: &str, garbled: &HashSet<String>) -> Value {
    let request: Value = serde_json::from_str(request_line).unwrap();
    let custom_id = request["custom_id"].as_str().unwrap().to_string();
    let user = request["body"]["messages"][1]["content"].as_str().unwrap();
    let id = field(user, "CompanyID:");
    let name = field(user, "CompanyName:");
    let flag = if id.ends_with(['0', '2', '4', '6', '8']) { "1" } else { "0" };

    let content = if garbled.contains(&custom_id) {
        format!("{id},{name},{flag}")
    } else {
        format!(
            "{id},\"{name}, Inc.\",{flag},4,\"builds models, sells APIs, hires researchers\",https://{id}.example,\"consistent, checked\""
        )
    };
    json!({
        "id": format!("req-{custom_id}"),
        "custom_id": custom_id,
        "response": {
            "status_code": 200,
            "body": { "choices": [ { "message": { "role": "assistant", "content": content } } ] }
        },
        "error": null
    })
}

#[async_trait]
impl BatchApi for FakeBatchApi {
    async fn upload_file(&self, path: &Path) -> Result<String> {
        let n = batch_number(path);
        let mut state = self.state.lock().unwrap();
        state.calls.uploads += 1;
        if self.reject_uploads.contains(&n) {
            return Err(PipelineError::Api { status: 500, body: "upload rejected".into() });
        }
        let text = fs::read_to_string(path).map_err(|e| PipelineError::Decode(e.to_string()))?;
        state.files.insert(n, text);
        Ok(format!("file-{n}"))
    }

    async fn create_batch(&self, input_file_id: &str, _endpoint: &str, _window: &str) -> Result<RemoteBatch> {
        let n = number_from_id(input_file_id);
        self.state.lock().unwrap().calls.creates += 1;
        Ok(RemoteBatch {
            id: format!("batch-{n}"),
            status: RemoteStatus::Validating,
            request_counts: None,
            output_file_id: None,
            error_file_id: None,
            completed_at: None,
        })
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch> {
        let n = number_from_id(batch_id);
        let mut state = self.state.lock().unwrap();
        state.calls.retrieves += 1;
        if self.unknown_batches.contains(&n) {
            return Err(PipelineError::Api { status: 404, body: format!("no batch {batch_id}") });
        }
        let outage = self.poll_outages.get(&n).copied().unwrap_or(0);
        let failed = state.failed_polls.entry(n).or_default();
        if *failed < outage {
            *failed += 1;
            return Err(PipelineError::Api { status: 503, body: "service unavailable".into() });
        }
        let total = state.files.get(&n).map(|f| f.lines().count()).unwrap_or(0) as u64;
        let polls = state.polls.entry(n).or_default();
        *polls += 1;

        let (status, completed, output) = if *polls <= self.in_progress_polls {
            (RemoteStatus::InProgress, total / 2, None)
        } else if self.fail_batches.contains(&n) {
            (RemoteStatus::Failed, 0, None)
        } else if self.empty_completions.contains(&n) {
            (RemoteStatus::Completed, total, None)
        } else {
            (RemoteStatus::Completed, total, Some(format!("out-{n}")))
        };
        Ok(RemoteBatch {
            id: batch_id.to_string(),
            status,
            request_counts: Some(RequestCounts { total, completed, failed: 0 }),
            output_file_id: output,
            error_file_id: None,
            completed_at: None,
        })
    }

    async fn file_content(&self, file_id: &str) -> Result<String> {
        let n = number_from_id(file_id);
        let mut state = self.state.lock().unwrap();
        state.calls.downloads += 1;
        if self.flaky_downloads.contains(&n) && state.failed_downloads.insert(n) {
            return Err(PipelineError::Api { status: 503, body: "download interrupted".into() });
        }
        let requests = state
            .files
            .get(&n)
            .ok_or_else(|| PipelineError::Api { status: 404, body: format!("no file {file_id}") })?;
        let mut out = String::new();
        for line in requests.lines() {
            out.push_str(&completion_for(line, &self.garbled).to_string());
            out.push('\n');
        }
        Ok(out)
    }
}

/// Counts pauses instead of sleeping.
#[derive(Default)]
pub struct CountingPause {
    pub pauses: usize,
}

#[async_trait]
impl Pause for CountingPause {
    async fn pause(&mut self, _interval: Duration) {
        self.pauses += 1;
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: PipelineConfig,
}

impl Fixture {
    /// A dataset of `records` companies split into batches of at most `per_batch`.
    pub fn new(records: usize, per_batch: usize, schedule: SchedulePolicy) -> Self {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("companies.csv");
        write_dataset(&input, records);
        let prompt = dir.path().join("system_prompt.txt");
        fs::write(&prompt, "Classify whether the company is AI-native.\n").unwrap();

        let config = PipelineConfig {
            input_csv: input,
            output_csv: dir.path().join("merged.csv"),
            system_prompt_file: prompt,
            work_dir: dir.path().join("batch_files"),
            model: "gpt-5-mini".into(),
            description_mode: DescriptionMode::Both,
            limits: BatchLimits { max_requests_per_batch: per_batch, ..BatchLimits::default() },
            schedule,
            on_submit_error: OnSubmitError::Continue,
            poll_interval: Duration::ZERO,
            max_poll_errors: 0,
            completion_window: "24h".into(),
            endpoint: "/v1/chat/completions".into(),
        };
        Self { dir, config }
    }

    pub fn work_file(&self, rel: &str) -> PathBuf {
        self.config.work_dir.join(rel)
    }
}

pub fn write_dataset(path: &Path, records: usize) {
    let mut w = csv::Writer::from_path(path).unwrap();
    w.write_record([
        "org_uuid",
        "name",
        "short_description",
        "Long description",
        "category_list",
        "category_groups_list",
        "founded_date",
    ])
    .unwrap();
    for i in 0..records {
        w.write_record([
            format!("org-{i:03}"),
            format!("Company {i}"),
            format!("Makes product {i}"),
            format!("A longer story about product {i}, its customers and its team."),
            "Artificial Intelligence,Machine Learning".to_string(),
            "Software".to_string(),
            "01nov2016".to_string(),
        ])
        .unwrap();
    }
    w.flush().unwrap();
}
