//! Scheduler error types.

use thiserror::Error;

use fleet_core::ItemStatus;

/// Errors surfaced synchronously by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    #[error("{item} belongs to partition {owner}, not {partition} (use --force to override)")]
    CrossPartition {
        item: String,
        owner: String,
        partition: String,
    },

    #[error("{0} is already queued (use --force to re-queue)")]
    AlreadyQueued(String),

    #[error("{item} is {status} (use --force to override)")]
    Claimed { item: String, status: ItemStatus },

    #[error("{0} is closed")]
    Closed(String),

    #[error("queue label write failed for {item}, description restored: {source}")]
    LabelWrite {
        item: String,
        #[source]
        source: fleet_store::StoreError,
    },

    #[error("queue label write failed for {item} and the description could not be restored: {source}")]
    RollbackFailed {
        item: String,
        #[source]
        source: fleet_store::StoreError,
    },

    #[error("store error: {0}")]
    Store(#[from] fleet_store::StoreError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Engine-level failures. Any of these aborts the whole cycle.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("scheduler state error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("capacity count error: {0}")]
    Capacity(#[from] fleet_runtime::CapacityError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The cycle overran its time budget and was abandoned.
    #[error("dispatch cycle exceeded its {0:?} time budget")]
    Timeout(std::time::Duration),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
