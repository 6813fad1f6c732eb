//! fleet-store — the scheduler's view of the external work-item store.
//!
//! The store owns work items; the scheduler only reads them and writes
//! labels and descriptions. [`WorkItemStore`] is the seam:
//!
//! - [`CommandStore`] drives a `bd`-style tracker CLI across the fleet
//!   root and every partition directory
//! - [`MemoryStore`] keeps items in memory, with fault injection, for tests

pub mod command;
pub mod error;
pub mod memory;
pub mod store;

pub use command::CommandStore;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use store::{LabelQuery, WorkItemStore};
