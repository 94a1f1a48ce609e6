//! Batch classification of startup company records through an LLM batch API.
//!
//! The stages are exposed as separate binaries (`prepare_dataset`,
//! `classify_batches`, `check_batches`, `merge_results`, `compare_runs`);
//! this library holds everything they share.

pub mod aggregate;
pub mod artifacts;
pub mod compare;
pub mod config;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod partition;
pub mod remote;
pub mod requests;
pub mod responses;

pub use error::{PipelineError, Result};
pub use orchestrator::{BatchState, Orchestrator, RunSummary};
pub use remote::{BatchApi, OpenAiBatchClient};
