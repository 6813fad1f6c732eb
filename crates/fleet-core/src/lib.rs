pub mod config;
pub mod types;

pub use config::{FleetConfig, PartitionConfig, SchedulerConfig};
pub use types::*;
