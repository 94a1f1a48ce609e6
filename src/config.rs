//! Run configuration.
//!
//! Every component receives an explicit [`PipelineConfig`]; nothing reads
//! process-wide state after start-up. The clap flag groups below are shared by
//! the binaries through `#[command(flatten)]`.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Args, ValueEnum};

use crate::error::{PipelineError, Result};

pub const DEFAULT_MODEL: &str = "gpt-5-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const CHAT_COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Which descriptions are rendered into the user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DescriptionMode {
    /// short description only; the long description line is omitted
    ShortOnly,
    /// short and long description
    Both,
}

/// How the orchestrator schedules batches through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchedulePolicy {
    /// build and submit everything, then poll all outstanding batches together
    Parallel,
    /// drive one batch to completion before starting the next
    Sequential,
}

/// What happens to the remaining batches after a failed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnSubmitError {
    Continue,
    Abort,
}

/// Capacity constraints of the batch service plus per-request estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchLimits {
    pub max_requests_per_batch: usize,
    pub max_file_bytes: u64,
    pub est_bytes_per_request: f64,
    pub max_enqueued_tokens: u64,
    pub est_tokens_per_request: f64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_requests_per_batch: 50_000,
            max_file_bytes: 100 * 1024 * 1024,
            est_bytes_per_request: 12.0 * 1024.0,
            max_enqueued_tokens: 1_000_000_000,
            est_tokens_per_request: 3_400.0,
        }
    }
}

/// Everything the orchestrator needs to know about one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_csv: PathBuf,
    pub output_csv: PathBuf,
    pub system_prompt_file: PathBuf,
    pub work_dir: PathBuf,
    pub model: String,
    pub description_mode: DescriptionMode,
    pub limits: BatchLimits,
    pub schedule: SchedulePolicy,
    pub on_submit_error: OnSubmitError,
    pub poll_interval: Duration,
    /// consecutive failed status checks before a batch is given up for the run; 0 disables the cap
    pub max_poll_errors: usize,
    pub completion_window: String,
    pub endpoint: String,
}

impl PipelineConfig {
    /// Configuration errors are fatal and must surface before any remote call.
    pub fn validate(&self) -> Result<()> {
        for (what, path) in [
            ("input dataset", &self.input_csv),
            ("system prompt", &self.system_prompt_file),
        ] {
            if !path.is_file() {
                return Err(PipelineError::Config(format!(
                    "{what} not found at {}",
                    path.display()
                )));
            }
        }
        if self.model.trim().is_empty() {
            return Err(PipelineError::Config("model name is empty".into()));
        }
        Ok(())
    }

    pub fn load_system_prompt(&self) -> Result<String> {
        let text = fs::read_to_string(&self.system_prompt_file)
            .map_err(|e| PipelineError::io(&self.system_prompt_file, e))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Config(format!(
                "system prompt {} is empty",
                self.system_prompt_file.display()
            )));
        }
        Ok(text.to_string())
    }
}

// ---------------------------------------------------------------------------
// clap flag groups
// ---------------------------------------------------------------------------

/// Credentials and endpoint of the batch service.
#[derive(Args, Debug, Clone)]
pub struct ApiArgs {
    /// API key; overrides $OPENAI_API_KEY
    #[arg(long = "api-key", value_name = "KEY")]
    pub api_key: Option<String>,

    /// File holding the key on its first non-comment line
    #[arg(long = "api-key-file", value_name = "PATH")]
    pub api_key_file: Option<PathBuf>,

    #[arg(long = "base-url", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// HTTP timeout per request; uploads of large batch files need a generous value
    #[arg(long = "http-timeout-secs", default_value_t = 300)]
    pub http_timeout_secs: u64,
}

impl ApiArgs {
    /// Resolve the key: flag, then environment, then key file.
    pub fn resolve_key(&self) -> Result<String> {
        if let Some(k) = self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            return Ok(k.to_string());
        }
        if let Ok(k) = env::var(API_KEY_ENV) {
            if !k.trim().is_empty() {
                return Ok(k.trim().to_string());
            }
        }
        if let Some(path) = &self.api_key_file {
            return read_key_file(path);
        }
        Err(PipelineError::Config(format!(
            "provide --api-key, set {API_KEY_ENV} or pass --api-key-file"
        )))
    }
}

/// First line that is neither blank nor a `#` comment.
pub fn read_key_file(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    raw.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "no API key found in {} (only comments or empty lines)",
                path.display()
            ))
        })
}

/// Batch service limits and per-request estimates.
#[derive(Args, Debug, Clone)]
pub struct LimitArgs {
    #[arg(long = "max-requests-per-batch", default_value_t = 50_000)]
    pub max_requests_per_batch: usize,

    /// Upload size budget per batch file, in MiB
    #[arg(long = "max-file-mb", default_value_t = 100)]
    pub max_file_mb: u64,

    #[arg(long = "est-kb-per-request", default_value_t = 12.0)]
    pub est_kb_per_request: f64,

    /// Enqueued-token quota of the account tier
    #[arg(long = "max-enqueued-tokens", default_value_t = 1_000_000_000)]
    pub max_enqueued_tokens: u64,

    #[arg(long = "est-tokens-per-request", default_value_t = 3_400.0)]
    pub est_tokens_per_request: f64,
}

impl LimitArgs {
    pub fn to_limits(&self) -> BatchLimits {
        BatchLimits {
            max_requests_per_batch: self.max_requests_per_batch,
            max_file_bytes: self.max_file_mb * 1024 * 1024,
            est_bytes_per_request: self.est_kb_per_request * 1024.0,
            max_enqueued_tokens: self.max_enqueued_tokens,
            est_tokens_per_request: self.est_tokens_per_request,
        }
    }
}
