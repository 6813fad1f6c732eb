//! fleet-scheduler — capacity-governed deferred dispatch.
//!
//! Work items wait in a queue made of labels in the external store; their
//! launch parameters ride along in a metadata block inside the description.
//! Each dispatch cycle counts live workers, plans how many queued items fit
//! under the fleet ceiling, launches them, and moves each item to its next
//! state. Items that keep failing to launch are quarantined by a per-item
//! circuit breaker.
//!
//! # Modules
//!
//! - [`metadata`] — encode, decode, and strip the description block
//! - [`queue`] — add, load, list, remove, clear
//! - [`planner`] — pure headroom/batch arithmetic
//! - [`breaker`] — failure counting and quarantine threshold
//! - [`engine`] — the locked dispatch cycle
//! - [`events`] — JSON-lines audit feed
//! - [`heartbeat`] — periodic trigger for the daemon

pub mod breaker;
pub mod engine;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod metadata;
pub mod planner;
pub mod queue;

pub use engine::{
    CycleOptions, CycleReport, DispatchEngine, EngineDeps, EngineSettings, ItemOutcome, Outcome,
    SkipReason, StatusReport,
};
pub use error::{DispatchError, DispatchResult, QueueError, QueueResult};
pub use events::{Event, EventKind, EventSink, FileEventLog, MemoryEventLog};
pub use heartbeat::Heartbeat;
pub use metadata::SchedulerMetadata;
pub use planner::{DispatchPlan, PlanReason};
pub use queue::{AddOptions, AddOutcome, ListEntry, Queue, QueueItem};
