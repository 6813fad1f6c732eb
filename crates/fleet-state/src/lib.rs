//! fleet-state — small persistent records owned by the scheduler itself.
//!
//! Everything else the scheduler knows lives in the external work-item
//! store (labels and description metadata). This crate holds the two
//! pieces that cannot: the fleet-wide pause flag with its dispatch
//! bookkeeping, and the non-blocking lock that serialises dispatch cycles.
//!
//! # Layout
//!
//! ```text
//! <root>/.runtime/
//!   ├── scheduler-state.json     (temp write + rename)
//!   ├── scheduler-state.lock     (guards read-modify-write of the record)
//!   └── scheduler-dispatch.lock  (one dispatch cycle at a time)
//! ```
//!
//! `StateBackend` is the injected accessor; `FileStateBackend` is the
//! production implementation and `MemoryStateBackend` the test double.

pub mod error;
pub mod lock;
pub mod state;

pub use error::{StateError, StateResult};
pub use lock::{DispatchLock, FileLock};
pub use state::{FileStateBackend, MemoryStateBackend, SchedulerState, StateBackend};

/// Directory under the fleet root for scheduler runtime files.
pub const RUNTIME_DIR: &str = ".runtime";
