//! Live worker counting.
//!
//! Capacity is a fleet-wide physical resource: every live worker counts,
//! including ones launched by hand. Counts are never cached because
//! workers start and die outside the scheduler's control.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use fleet_core::config::CapacityConfig;

use crate::error::{CapacityError, CapacityResult};

#[async_trait]
pub trait WorkerCounter: Send + Sync {
    /// Number of live workers right now.
    async fn count_active(&self) -> CapacityResult<usize>;
}

/// Counts tmux sessions whose names match a pattern.
#[derive(Debug, Clone)]
pub struct SessionCounter {
    program: String,
    pattern: Regex,
}

impl SessionCounter {
    pub fn new(program: &str, pattern: &str) -> CapacityResult<Self> {
        Ok(Self {
            program: program.to_string(),
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn from_config(config: &CapacityConfig) -> CapacityResult<Self> {
        Self::new(&config.program, &config.session_pattern)
    }

    /// Count matching names in a `list-sessions` listing.
    pub fn count_matching(&self, listing: &str) -> usize {
        listing
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && self.pattern.is_match(name))
            .count()
    }
}

/// tmux reports these when no server is running, i.e. no sessions exist.
fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running")
        || stderr.contains("no sessions")
        || stderr.contains("error connecting to")
}

#[async_trait]
impl WorkerCounter for SessionCounter {
    async fn count_active(&self) -> CapacityResult<usize> {
        let output = Command::new(&self.program)
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()
            .await
            .map_err(|e| CapacityError::Command {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_no_server(&stderr) {
                debug!("no session server running, zero active workers");
                return Ok(0);
            }
            return Err(CapacityError::Command {
                program: self.program.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        let count = self.count_matching(&String::from_utf8_lossy(&output.stdout));
        debug!(count, "active workers counted");
        Ok(count)
    }
}

/// A counter with a settable value.
#[derive(Debug, Default)]
pub struct FixedCounter {
    value: AtomicUsize,
    failing: AtomicBool,
}

impl FixedCounter {
    pub fn new(value: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set(&self, value: usize) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Make subsequent counts fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerCounter for FixedCounter {
    async fn count_active(&self) -> CapacityResult<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CapacityError::Command {
                program: "fixed".to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(self.value.load(Ordering::SeqCst))
    }
}
