//! Dispatch planner — how many ready items to launch this cycle.
//!
//! Pure and deterministic: no I/O, input order preserved.

use serde::Serialize;

/// What limited the plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    /// Nothing was ready.
    #[default]
    None,
    /// Headroom ran out first.
    Capacity,
    /// The per-cycle batch limit ran out first.
    Batch,
    /// Every ready item fits.
    Ready,
}

impl PlanReason {
    pub fn label(&self) -> &'static str {
        match self {
            PlanReason::None => "none",
            PlanReason::Capacity => "capacity",
            PlanReason::Batch => "batch",
            PlanReason::Ready => "ready",
        }
    }
}

impl std::fmt::Display for PlanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan<T> {
    pub to_dispatch: Vec<T>,
    pub deferred: Vec<T>,
    pub reason: PlanReason,
}

impl<T> DispatchPlan<T> {
    /// Governance off: everything ready goes out, nothing defers.
    pub fn unlimited(ready: Vec<T>) -> Self {
        let reason = if ready.is_empty() {
            PlanReason::None
        } else {
            PlanReason::Ready
        };
        Self {
            to_dispatch: ready,
            deferred: Vec::new(),
            reason,
        }
    }
}

/// Free launch slots under `max_workers`.
pub fn headroom(max_workers: i64, active: usize) -> usize {
    let active = i64::try_from(active).unwrap_or(i64::MAX);
    usize::try_from(max_workers.saturating_sub(active).max(0)).unwrap_or(0)
}

/// Split `ready` into this cycle's launches and the rest.
///
/// Only meaningful with governance on (`max_workers > 0`); callers take
/// [`DispatchPlan::unlimited`] otherwise.
pub fn plan<T>(
    max_workers: i64,
    batch_size: u32,
    active: usize,
    mut ready: Vec<T>,
) -> DispatchPlan<T> {
    if ready.is_empty() {
        return DispatchPlan {
            to_dispatch: Vec::new(),
            deferred: Vec::new(),
            reason: PlanReason::None,
        };
    }

    let room = headroom(max_workers, active);
    let batch = batch_size as usize;
    let n = room.min(batch).min(ready.len());

    let reason = if n == ready.len() {
        PlanReason::Ready
    } else if room <= batch {
        PlanReason::Capacity
    } else {
        PlanReason::Batch
    };

    let deferred = ready.split_off(n);
    DispatchPlan {
        to_dispatch: ready,
        deferred,
        reason,
    }
}
