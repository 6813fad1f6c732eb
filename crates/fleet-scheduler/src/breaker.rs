//! Per-item circuit breaker.
//!
//! The consecutive launch-failure count lives in the item's metadata block,
//! so it survives restarts with no state of its own. Once the count reaches
//! [`FAILURE_THRESHOLD`] the item is quarantined and never retried
//! automatically. There is no reset: re-adding an item writes a fresh block
//! with a zero count.

use crate::metadata::SchedulerMetadata;
use crate::queue::QueueItem;

/// Launch failures an item may accumulate before it is quarantined.
pub const FAILURE_THRESHOLD: u32 = 3;

/// What a recorded failure means for the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Still a queue member; eligible again next cycle.
    Retry { failures: u32 },
    /// Threshold reached; quarantine.
    Trip { failures: u32 },
}

impl Verdict {
    pub fn failures(&self) -> u32 {
        match self {
            Verdict::Retry { failures } | Verdict::Trip { failures } => *failures,
        }
    }
}

/// Count one launch failure against `meta`.
pub fn record_failure(meta: &mut SchedulerMetadata, reason: &str) -> Verdict {
    meta.dispatch_failures = meta.dispatch_failures.saturating_add(1);
    meta.last_failure = Some(reason.to_string());
    if is_tripped(meta) {
        Verdict::Trip {
            failures: meta.dispatch_failures,
        }
    } else {
        Verdict::Retry {
            failures: meta.dispatch_failures,
        }
    }
}

pub fn is_tripped(meta: &SchedulerMetadata) -> bool {
    meta.dispatch_failures >= FAILURE_THRESHOLD
}

/// Drop items whose stored count already reached the threshold.
///
/// Normally such items carry the quarantine label and never reach the
/// dispatch path; this catches the ones where that label write failed.
pub fn filter_tripped(items: Vec<QueueItem>) -> (Vec<QueueItem>, usize) {
    let before = items.len();
    let kept: Vec<QueueItem> = items
        .into_iter()
        .filter(|item| !item.metadata.as_ref().is_some_and(is_tripped))
        .collect();
    let tripped = before - kept.len();
    (kept, tripped)
}
