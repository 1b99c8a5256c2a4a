//! Error taxonomy for the adapter lifecycle
//!
//! Pre-start failures (`InvalidConfiguration`, `PreconditionTimeout`,
//! `WatchStartFailed`) abort the boot sequence. `InvalidConfigFormat` is
//! recovered inside the observer that produced it. `TaskFailure` and
//! `ShutdownTimeout` surface as the overall result of the supervised run.

use crate::config::StoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Timed out after {timeout:?} waiting for Kubernetes version >= {minimum}")]
    PreconditionTimeout { minimum: String, timeout: Duration },

    #[error("Failed to start configuration watch: {0}")]
    WatchStartFailed(#[source] StoreError),

    #[error("Invalid format in config {record}: {reason}")]
    InvalidConfigFormat { record: String, reason: String },

    #[error("Task {task} failed: {reason}")]
    TaskFailure { task: String, reason: String },

    #[error("Tasks did not stop within {grace:?}: {pending:?}")]
    ShutdownTimeout {
        grace: Duration,
        pending: Vec<String>,
    },
}

impl AdapterError {
    /// Boot stage the error belongs to, used as a log field
    pub fn stage(&self) -> &'static str {
        match self {
            AdapterError::InvalidConfiguration(_) => "configuration",
            AdapterError::PreconditionTimeout { .. } => "version_gate",
            AdapterError::WatchStartFailed(_) => "config_watch",
            AdapterError::InvalidConfigFormat { .. } => "config_apply",
            AdapterError::TaskFailure { .. } => "supervision",
            AdapterError::ShutdownTimeout { .. } => "shutdown",
        }
    }

    pub(crate) fn invalid_format(record: &str, reason: impl Into<String>) -> Self {
        AdapterError::InvalidConfigFormat {
            record: record.to_string(),
            reason: reason.into(),
        }
    }
}
