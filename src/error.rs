use std::path::PathBuf;

use thiserror::Error;

/// Library-wide error type. Binaries wrap it in `anyhow`.
#[derive(Debug, Error)]
pub enum PipelineError {
    // configuration: fatal before any remote call
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid batch limits: {0}")]
    InvalidLimits(String),

    // remote service
    #[error("request to batch service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("batch service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response from batch service: {0}")]
    Decode(String),

    #[error("batch file {} is {size} bytes, above the {limit} byte limit", .path.display())]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    // local artifacts
    #[error("no batch output tables found in {}", .0.display())]
    NoBatchOutputs(PathBuf),

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io { path: path.into(), source }
    }

    /// True for failures worth retrying on the next run or poll round.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            PipelineError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        let throttled = PipelineError::Api { status: 429, body: "slow down".into() };
        let broken = PipelineError::Api { status: 503, body: String::new() };
        let rejected = PipelineError::Api { status: 400, body: "bad file".into() };
        assert!(throttled.is_transient());
        assert!(broken.is_transient());
        assert!(!rejected.is_transient());
        assert!(!PipelineError::Config("no key".into()).is_transient());
    }
}
