//! fleet-runtime — the substrate workers run on.
//!
//! Two seams the dispatch engine consumes:
//!
//! - [`Launcher`] starts one worker for a work item in a partition
//! - [`WorkerCounter`] reports how many workers are live right now,
//!   fleet-wide, regardless of who launched them

pub mod capacity;
pub mod error;
pub mod launcher;

pub use capacity::{FixedCounter, SessionCounter, WorkerCounter};
pub use error::{CapacityError, CapacityResult, LaunchError, LaunchResult};
pub use launcher::{
    CALLER_ENV, CommandLauncher, LaunchReceipt, LaunchRequest, Launcher, SCHEDULER_CALLER,
};
