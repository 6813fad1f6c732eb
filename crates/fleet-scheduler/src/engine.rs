//! Dispatch engine — one capacity-governed dispatch cycle.
//!
//! ```text
//!  try_lock ──held──▶ skip
//!     │
//!  load state ──paused──▶ skip
//!     │
//!  count live workers (governed only)
//!     │
//!  load queue ─▶ drop circuit-broken ─▶ plan (or take all when ungoverned)
//!     │
//!  launch pool (N at a time, cycle deadline)
//!     │  per item:  decode ─bad─▶ quarantine
//!     │             launch ─ok─▶ strip metadata, queued → dispatched
//!     │                    └err─▶ count failure ─3rd─▶ quarantine
//!     │
//!  re-read state, record bookkeeping
//! ```
//!
//! Engine-level failures (lock, state, capacity count, queue read) abort the
//! cycle before any item is touched. Item-level failures never abort; they
//! become outcomes in the [`CycleReport`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use fleet_core::config::SchedulerConfig;
use fleet_core::{FleetConfig, LABEL_DISPATCHED, LABEL_QUARANTINED, LABEL_QUEUED};
use fleet_runtime::{
    CommandLauncher, LaunchError, LaunchReceipt, Launcher, SessionCounter, WorkerCounter,
};
use fleet_state::{DispatchLock, FileStateBackend, SchedulerState, StateBackend};
use fleet_store::{CommandStore, WorkItemStore};

use crate::breaker::{self, FAILURE_THRESHOLD, Verdict};
use crate::error::{DispatchError, DispatchResult};
use crate::events::{Event, EventKind, EventSink, FileEventLog};
use crate::metadata;
use crate::planner::{self, DispatchPlan, PlanReason};
use crate::queue::{Queue, QueueItem};

/// Pause between the first label swap attempt and its retry.
pub const SWAP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Time past the launch deadline for in-flight items to record their outcome.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The engine's collaborators.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn WorkItemStore>,
    pub launcher: Arc<dyn Launcher>,
    pub counter: Arc<dyn WorkerCounter>,
    pub state: Arc<dyn StateBackend>,
    pub events: Arc<dyn EventSink>,
}

impl EngineDeps {
    /// The production wiring for a fleet rooted at `root`: store and launcher
    /// CLIs from config, tmux session counting, state and events under
    /// `.runtime/`.
    pub fn for_fleet(root: &Path, config: &FleetConfig) -> DispatchResult<Self> {
        Ok(Self {
            store: Arc::new(CommandStore::from_config(root, config)),
            launcher: Arc::new(CommandLauncher::from_config(&config.launcher)),
            counter: Arc::new(SessionCounter::from_config(&config.capacity)?),
            state: Arc::new(FileStateBackend::for_root(root)),
            events: Arc::new(FileEventLog::for_root(root)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_workers: i64,
    pub batch_size: u32,
    pub parallelism: usize,
    pub spawn_delay: Duration,
    pub cycle_timeout: Duration,
    /// Extra time after `cycle_timeout` before the whole cycle is abandoned.
    pub settle_timeout: Duration,
    pub swap_retry_delay: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            batch_size: config.batch_size,
            parallelism: config.parallelism.max(1),
            spawn_delay: config.spawn_delay(),
            cycle_timeout: config.cycle_timeout(),
            settle_timeout: SETTLE_TIMEOUT,
            swap_retry_delay: SWAP_RETRY_DELAY,
        }
    }
}

/// Per-invocation knobs for [`DispatchEngine::run_cycle`].
#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Plan and report, launch nothing, write nothing.
    pub dry_run: bool,
    pub max_override: Option<i64>,
    pub batch_override: Option<u32>,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Another cycle holds the dispatch lock.
    Locked,
    Paused { by: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Dispatched { worker: Option<String> },
    /// Launch failed below the threshold; still queued.
    Retry { failures: u32, reason: String },
    /// Left scheduler scope; `failures == 0` means malformed metadata.
    Quarantined { failures: u32, reason: String },
    /// The cycle deadline passed before this launch could start.
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub id: String,
    pub partition: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ItemOutcome {
    fn new(item: &QueueItem, outcome: Outcome) -> Self {
        Self {
            id: item.id.clone(),
            partition: item.partition.clone(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedItem {
    pub id: String,
    pub title: String,
    pub partition: String,
}

/// Everything one cycle decided and did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    pub dry_run: bool,
    pub governed: bool,
    pub max_workers: i64,
    pub batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<usize>,
    pub ready: usize,
    pub circuit_broken: usize,
    pub reason: PlanReason,
    pub planned: Vec<PlannedItem>,
    pub deferred: Vec<String>,
    pub outcomes: Vec<ItemOutcome>,
}

impl CycleReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    pub fn dispatched(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Dispatched { .. }))
    }

    pub fn retried(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Retry { .. }))
    }

    pub fn quarantined(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Quarantined { .. }))
    }

    pub fn not_started(&self) -> usize {
        self.count(|o| matches!(o, Outcome::NotStarted))
    }

    /// "unlimited" or "N free of M".
    pub fn capacity_label(&self) -> String {
        match self.active {
            Some(active) if self.governed => format!(
                "{} free of {}",
                planner::headroom(self.max_workers, active),
                self.max_workers
            ),
            _ => "unlimited".to_string(),
        }
    }
}

/// Snapshot for `schedule status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub state: SchedulerState,
    pub governed: bool,
    pub max_workers: i64,
    pub batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<usize>,
    pub ready: usize,
}

/// Runs dispatch cycles against the injected collaborators.
pub struct DispatchEngine {
    deps: Arc<EngineDeps>,
    queue: Queue,
    lock: DispatchLock,
    settings: EngineSettings,
}

impl DispatchEngine {
    pub fn new(deps: EngineDeps, config: Arc<FleetConfig>, lock: DispatchLock) -> Self {
        let settings = EngineSettings::from_config(&config.scheduler);
        let queue = Queue::new(deps.store.clone(), deps.events.clone(), config);
        Self {
            deps: Arc::new(deps),
            queue,
            lock,
            settings,
        }
    }

    /// Engine for the fleet at `root` with production collaborators.
    pub fn open(root: &Path, config: Arc<FleetConfig>) -> DispatchResult<Self> {
        let deps = EngineDeps::for_fleet(root, &config)?;
        Ok(Self::new(deps, config, DispatchLock::for_root(root)))
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn governance_enabled(&self) -> bool {
        self.settings.max_workers > 0
    }

    /// Run one dispatch cycle.
    ///
    /// Lock contention and a paused fleet are clean skips, not errors. No
    /// launch starts after `cycle_timeout`; a cycle still busy
    /// `settle_timeout` later is abandoned with [`DispatchError::Timeout`]
    /// and the lock is released.
    pub async fn run_cycle(&self, opts: &CycleOptions) -> DispatchResult<CycleReport> {
        let Some(_guard) = self.lock.try_lock()? else {
            info!("dispatch cycle already in flight, skipping");
            return Ok(CycleReport::skipped(SkipReason::Locked));
        };

        let started = Instant::now();
        let deadline = later(started, self.settings.cycle_timeout);
        let budget = self
            .settings
            .cycle_timeout
            .saturating_add(self.settings.settle_timeout);

        let cycle = self.locked_cycle(opts, deadline);
        match tokio::time::timeout_at(later(started, budget), cycle).await {
            Ok(result) => result,
            Err(_) => {
                error!(?budget, "dispatch cycle overran its time budget, abandoning it");
                Err(DispatchError::Timeout(budget))
            }
        }
    }

    async fn locked_cycle(
        &self,
        opts: &CycleOptions,
        deadline: Instant,
    ) -> DispatchResult<CycleReport> {
        let state = self.deps.state.load()?;
        if state.paused {
            info!(paused_by = %state.paused_by, "scheduler paused, skipping dispatch");
            return Ok(CycleReport::skipped(SkipReason::Paused {
                by: state.paused_by,
            }));
        }

        let max_workers = opts.max_override.unwrap_or(self.settings.max_workers);
        let batch_size = opts.batch_override.unwrap_or(self.settings.batch_size);
        let governed = max_workers > 0;
        let active = if governed {
            Some(self.deps.counter.count_active().await?)
        } else {
            None
        };

        let ready = self.queue.load().await?;
        let (ready, circuit_broken) = breaker::filter_tripped(ready);
        if circuit_broken > 0 {
            warn!(
                circuit_broken,
                threshold = FAILURE_THRESHOLD,
                "skipping circuit-broken items"
            );
        }
        let ready_count = ready.len();

        let plan = match active {
            Some(active) => planner::plan(max_workers, batch_size, active, ready),
            None => DispatchPlan::unlimited(ready),
        };

        let mut report = CycleReport {
            dry_run: opts.dry_run,
            governed,
            max_workers,
            batch_size,
            active,
            ready: ready_count,
            circuit_broken,
            reason: plan.reason,
            planned: plan
                .to_dispatch
                .iter()
                .map(|item| PlannedItem {
                    id: item.id.clone(),
                    title: item.title.clone(),
                    partition: item.partition.clone(),
                })
                .collect(),
            deferred: plan.deferred.iter().map(|item| item.id.clone()).collect(),
            ..Default::default()
        };

        info!(
            governed,
            ?active,
            ready = ready_count,
            planned = report.planned.len(),
            deferred = report.deferred.len(),
            reason = %plan.reason,
            dry_run = opts.dry_run,
            "dispatch plan"
        );

        if opts.dry_run || plan.to_dispatch.is_empty() {
            return Ok(report);
        }

        report.outcomes = self
            .dispatch_all(plan.to_dispatch, &opts.actor, deadline)
            .await;

        let dispatched = report.dispatched();
        if dispatched > 0 {
            // Fresh read-modify-write so a pause set during the cycle survives.
            let count = u32::try_from(dispatched).unwrap_or(u32::MAX);
            if let Err(e) = self.deps.state.update(&mut |s| s.record_dispatch(count)) {
                warn!(error = %e, "could not record dispatch bookkeeping");
            }
        }

        info!(
            dispatched,
            retried = report.retried(),
            quarantined = report.quarantined(),
            not_started = report.not_started(),
            deferred = report.deferred.len(),
            "dispatch cycle complete"
        );
        Ok(report)
    }

    async fn dispatch_all(
        &self,
        items: Vec<QueueItem>,
        actor: &str,
        deadline: Instant,
    ) -> Vec<ItemOutcome> {
        let pool = Arc::new(Semaphore::new(self.settings.parallelism.max(1)));
        let dispatcher = ItemDispatcher {
            deps: self.deps.clone(),
            actor: actor.to_string(),
            cycle_timeout: self.settings.cycle_timeout,
            swap_retry_delay: self.settings.swap_retry_delay,
        };

        let total = items.len();
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::with_capacity(total);

        for (idx, item) in items.into_iter().enumerate() {
            if idx > 0 && !self.settings.spawn_delay.is_zero() {
                let wake = later(Instant::now(), self.settings.spawn_delay).min(deadline);
                tokio::time::sleep_until(wake).await;
            }
            let permit = tokio::time::timeout_at(deadline, pool.clone().acquire_owned()).await;
            let permit = match permit {
                Ok(Ok(permit)) if Instant::now() < deadline => permit,
                _ => {
                    warn!(item = %item.id, "cycle deadline reached, leaving item queued");
                    outcomes.push((idx, ItemOutcome::new(&item, Outcome::NotStarted)));
                    continue;
                }
            };

            debug!(item = %item.id, partition = %item.partition, n = idx + 1, total, "dispatching");
            let dispatcher = dispatcher.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (idx, dispatcher.process(item, deadline).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => outcomes.push(done),
                Err(e) => error!(error = %e, "dispatch task aborted"),
            }
        }

        outcomes.sort_by_key(|(idx, _)| *idx);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Pause flag, bookkeeping, live capacity, and ready count.
    pub async fn status(&self) -> DispatchResult<StatusReport> {
        let state = self.deps.state.load()?;
        let active = match self.deps.counter.count_active().await {
            Ok(active) => Some(active),
            Err(e) => {
                warn!(error = %e, "could not count active workers");
                None
            }
        };
        let ready = self.queue.load().await?.len();
        Ok(StatusReport {
            state,
            governed: self.governance_enabled(),
            max_workers: self.settings.max_workers,
            batch_size: self.settings.batch_size,
            active,
            ready,
        })
    }

    pub fn pause(&self, actor: &str) -> DispatchResult<bool> {
        Ok(self.deps.state.pause(actor)?)
    }

    pub fn resume(&self) -> DispatchResult<bool> {
        Ok(self.deps.state.resume()?)
    }
}

/// `base + by`, saturating to a far-off instant instead of overflowing.
fn later(base: Instant, by: Duration) -> Instant {
    base.checked_add(by)
        .unwrap_or_else(|| base + Duration::from_secs(86_400 * 365 * 30))
}

/// Applies the per-item state machine. One clone per launch task.
#[derive(Clone)]
struct ItemDispatcher {
    deps: Arc<EngineDeps>,
    actor: String,
    cycle_timeout: Duration,
    swap_retry_delay: Duration,
}

impl ItemDispatcher {
    async fn process(&self, item: QueueItem, deadline: Instant) -> ItemOutcome {
        let meta = match &item.metadata {
            None => return self.quarantine_malformed(&item, "no scheduler metadata").await,
            Some(meta) => match meta.defect() {
                Some(defect) => return self.quarantine_malformed(&item, defect).await,
                None => meta,
            },
        };

        let request = meta.launch_request(&item.id).from_scheduler();
        let launched = tokio::time::timeout_at(deadline, self.deps.launcher.launch(&request))
            .await
            .unwrap_or(Err(LaunchError::Timeout(self.cycle_timeout)));

        match launched {
            Ok(receipt) => self.on_success(&item, receipt).await,
            Err(e) => self.on_failure(&item, &e.to_string()).await,
        }
    }

    async fn quarantine_malformed(&self, item: &QueueItem, reason: &str) -> ItemOutcome {
        warn!(item = %item.id, reason, "quarantining item with unusable metadata");
        self.quarantine(&item.id).await;
        self.deps.events.record(
            Event::new(EventKind::Quarantine, &self.actor, &item.id, &item.partition)
                .with_reason(reason)
                .with_failures(0),
        );
        ItemOutcome::new(
            item,
            Outcome::Quarantined {
                failures: 0,
                reason: reason.to_string(),
            },
        )
    }

    async fn quarantine(&self, id: &str) {
        if let Err(e) = self
            .deps
            .store
            .update_labels(id, &[LABEL_QUARANTINED], &[LABEL_QUEUED])
            .await
        {
            error!(item = %id, error = %e, "failed to apply quarantine label");
        }
    }

    async fn on_success(&self, item: &QueueItem, receipt: LaunchReceipt) -> ItemOutcome {
        match self.deps.store.get(&item.id).await {
            Ok(Some(fresh)) => {
                let clean = metadata::strip(&fresh.description);
                if clean != fresh.description
                    && let Err(e) = self.deps.store.update_description(&item.id, &clean).await
                {
                    warn!(item = %item.id, error = %e, "failed to strip metadata");
                }
            }
            Ok(None) => warn!(item = %item.id, "item disappeared after dispatch"),
            Err(e) => warn!(item = %item.id, error = %e, "could not re-read item after dispatch"),
        }

        self.swap_labels(&item.id).await;

        info!(
            item = %item.id,
            partition = %item.partition,
            worker = ?receipt.worker,
            "dispatched"
        );
        self.deps.events.record(
            Event::new(EventKind::Dispatch, &self.actor, &item.id, &item.partition)
                .with_worker(receipt.worker.clone()),
        );
        ItemOutcome::new(
            item,
            Outcome::Dispatched {
                worker: receipt.worker,
            },
        )
    }

    /// queued → dispatched. On repeated failure the queued label is removed
    /// alone so the item cannot be launched twice.
    async fn swap_labels(&self, id: &str) {
        let store = &self.deps.store;
        let Err(first) = store
            .update_labels(id, &[LABEL_DISPATCHED], &[LABEL_QUEUED])
            .await
        else {
            return;
        };
        warn!(item = %id, error = %first, "label swap failed, retrying");
        tokio::time::sleep(self.swap_retry_delay).await;

        let Err(retry) = store
            .update_labels(id, &[LABEL_DISPATCHED], &[LABEL_QUEUED])
            .await
        else {
            return;
        };
        match store.remove_label(id, LABEL_QUEUED).await {
            Ok(()) => warn!(
                item = %id,
                error = %retry,
                "dispatched label not set, queued label removed"
            ),
            Err(e) => error!(
                item = %id,
                error = %e,
                "could not remove queued label after dispatch; item may be dispatched twice"
            ),
        }
    }

    async fn on_failure(&self, item: &QueueItem, reason: &str) -> ItemOutcome {
        let current = match self.deps.store.get(&item.id).await {
            Ok(Some(fresh)) => fresh.description,
            _ => item.description.clone(),
        };
        let mut meta = metadata::decode(&current)
            .or_else(|| item.metadata.clone())
            .unwrap_or_default();
        let verdict = breaker::record_failure(&mut meta, reason);
        let failures = verdict.failures();

        let updated = metadata::encode(&current, &meta);
        if let Err(e) = self.deps.store.update_description(&item.id, &updated).await {
            warn!(item = %item.id, error = %e, "failed to record dispatch failure");
        }
        self.deps.events.record(
            Event::new(EventKind::DispatchFailed, &self.actor, &item.id, &item.partition)
                .with_reason(reason)
                .with_failures(failures),
        );

        match verdict {
            Verdict::Trip { .. } => {
                warn!(item = %item.id, failures, reason, "circuit breaker tripped, quarantining");
                self.quarantine(&item.id).await;
                self.deps.events.record(
                    Event::new(EventKind::Quarantine, &self.actor, &item.id, &item.partition)
                        .with_reason(reason)
                        .with_failures(failures),
                );
                ItemOutcome::new(
                    item,
                    Outcome::Quarantined {
                        failures,
                        reason: reason.to_string(),
                    },
                )
            }
            Verdict::Retry { .. } => {
                info!(item = %item.id, failures, reason, "launch failed, will retry");
                ItemOutcome::new(
                    item,
                    Outcome::Retry {
                        failures,
                        reason: reason.to_string(),
                    },
                )
            }
        }
    }
}
