//! Work-item store error types.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("store command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to parse store output: {0}")]
    Parse(String),

    #[error("write rejected for {id}: {reason}")]
    WriteRejected { id: String, reason: String },
}
