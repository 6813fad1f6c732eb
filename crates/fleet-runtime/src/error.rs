//! Launch and capacity error types.

use std::time::Duration;

use thiserror::Error;

pub type LaunchResult<T> = Result<T, LaunchError>;
pub type CapacityResult<T> = Result<T, CapacityError>;

/// A worker launch that did not produce a worker.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start launcher `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("launch of {item} failed ({status}): {stderr}")]
    Failed {
        item: String,
        status: String,
        stderr: String,
    },

    #[error("launch timed out after {0:?}")]
    Timeout(Duration),

    #[error("launch rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("capacity count via `{program}` failed: {reason}")]
    Command { program: String, reason: String },

    #[error("invalid session pattern: {0}")]
    Pattern(#[from] regex::Error),
}
