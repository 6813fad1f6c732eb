//! Dispatch cycle scenarios against in-memory collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use fleet_core::{FleetConfig, ItemState, LABEL_QUEUED, WorkItem};
use fleet_runtime::{FixedCounter, LaunchError, LaunchReceipt, LaunchRequest, LaunchResult, Launcher};
use fleet_scheduler::metadata;
use fleet_scheduler::{
    AddOptions, CycleOptions, DispatchEngine, DispatchError, EngineDeps, EngineSettings,
    EventKind, FileEventLog, MemoryEventLog, Outcome, PlanReason, SchedulerMetadata, SkipReason,
};
use fleet_state::{DispatchLock, MemoryStateBackend, StateBackend};
use fleet_store::{LabelQuery, MemoryStore, StoreResult, WorkItemStore};

/// Launcher that succeeds unless told an item is broken.
#[derive(Default)]
struct ScriptedLauncher {
    broken: Mutex<HashSet<String>>,
    calls: Mutex<Vec<LaunchRequest>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedLauncher {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn break_item(&self, id: &str) {
        self.broken.lock().unwrap().insert(id.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.item.clone())
            .collect()
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, request: &LaunchRequest) -> LaunchResult<LaunchReceipt> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.broken.lock().unwrap().contains(&request.item) {
            return Err(LaunchError::Rejected(format!("no such formula for {}", request.item)));
        }
        Ok(LaunchReceipt {
            worker: Some(format!("worker-{}", request.item)),
        })
    }
}

/// Store whose reads stop answering once `hang` is set.
struct HangingStore {
    inner: Arc<MemoryStore>,
    hang: AtomicBool,
}

#[async_trait]
impl WorkItemStore for HangingStore {
    async fn get(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.get(id).await
    }

    async fn update_labels(&self, id: &str, add: &[&str], remove: &[&str]) -> StoreResult<()> {
        self.inner.update_labels(id, add, remove).await
    }

    async fn update_description(&self, id: &str, text: &str) -> StoreResult<()> {
        self.inner.update_description(id, text).await
    }

    async fn query_by_label(&self, label: &str, query: LabelQuery) -> StoreResult<Vec<WorkItem>> {
        self.inner.query_by_label(label, query).await
    }
}

struct Fleet {
    dir: TempDir,
    store: Arc<MemoryStore>,
    launcher: Arc<ScriptedLauncher>,
    counter: Arc<FixedCounter>,
    state: Arc<MemoryStateBackend>,
    events: Arc<MemoryEventLog>,
    engine: DispatchEngine,
}

fn settings(max_workers: i64, batch_size: u32) -> EngineSettings {
    EngineSettings {
        max_workers,
        batch_size,
        parallelism: 1,
        spawn_delay: Duration::ZERO,
        cycle_timeout: Duration::from_secs(30),
        settle_timeout: Duration::from_secs(5),
        swap_retry_delay: Duration::from_millis(5),
    }
}

fn fleet_with(settings: EngineSettings, launcher: ScriptedLauncher) -> Fleet {
    let dir = tempfile::tempdir().unwrap();
    let config = FleetConfig::from_toml(
        "[partitions.alpha]\nprefix = \"al\"\n[partitions.beta]\nprefix = \"be\"\n",
    )
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    let launcher = Arc::new(launcher);
    let counter = Arc::new(FixedCounter::new(0));
    let state = Arc::new(MemoryStateBackend::new());
    let events = Arc::new(MemoryEventLog::new());

    let deps = EngineDeps {
        store: store.clone(),
        launcher: launcher.clone(),
        counter: counter.clone(),
        state: state.clone(),
        events: events.clone(),
    };
    let engine = DispatchEngine::new(deps, Arc::new(config), DispatchLock::for_root(dir.path()))
        .with_settings(settings);

    Fleet {
        dir,
        store,
        launcher,
        counter,
        state,
        events,
        engine,
    }
}

fn fleet(max_workers: i64, batch_size: u32) -> Fleet {
    fleet_with(settings(max_workers, batch_size), ScriptedLauncher::default())
}

fn run() -> CycleOptions {
    CycleOptions {
        actor: "test".to_string(),
        ..Default::default()
    }
}

impl Fleet {
    async fn enqueue(&self, id: &str) {
        self.store.insert(WorkItem::new(id, &format!("work {id}")));
        let partition = if id.starts_with("be-") { "beta" } else { "alpha" };
        let mut meta = SchedulerMetadata::new(partition);
        meta.formula = Some("mol-polish".to_string());
        self.engine
            .queue()
            .add(
                id,
                meta,
                &AddOptions {
                    actor: "test".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    fn state_of(&self, id: &str) -> Option<ItemState> {
        self.store.item(id).unwrap().scheduler_state()
    }
}

#[tokio::test]
async fn three_ready_two_slots_then_full() {
    let f = fleet(2, 10);
    for id in ["al-1", "al-2", "al-3"] {
        f.enqueue(id).await;
    }

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.dispatched(), 2);
    assert_eq!(report.deferred, vec!["al-3".to_string()]);
    assert_eq!(report.reason, PlanReason::Capacity);
    assert_eq!(f.launcher.calls(), vec!["al-1", "al-2"]);

    for id in ["al-1", "al-2"] {
        assert_eq!(f.state_of(id), Some(ItemState::Dispatched));
        assert!(!metadata::has_block(&f.store.item(id).unwrap().description));
    }
    assert_eq!(f.state_of("al-3"), Some(ItemState::Queued));

    f.counter.set(2);
    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.dispatched(), 0);
    assert_eq!(report.deferred, vec!["al-3".to_string()]);
    assert_eq!(report.capacity_label(), "0 free of 2");
    assert_eq!(f.launcher.calls().len(), 2);

    let state = f.state.load().unwrap();
    assert_eq!(state.last_dispatch_count, 2);
    assert!(state.last_dispatch_at.is_some());
}

#[tokio::test]
async fn ungoverned_dispatches_everything_regardless_of_load() {
    let f = fleet(0, 1);
    f.counter.set(500);
    for id in ["al-1", "al-2", "be-1", "be-2"] {
        f.enqueue(id).await;
    }

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert!(!report.governed);
    assert_eq!(report.dispatched(), 4);
    assert!(report.deferred.is_empty());
    assert_eq!(report.capacity_label(), "unlimited");

    let partitions: Vec<_> = report.outcomes.iter().map(|o| o.partition.as_str()).collect();
    assert_eq!(partitions, vec!["alpha", "alpha", "beta", "beta"]);
}

#[tokio::test]
async fn launches_carry_scheduler_flags() {
    let f = fleet(5, 5);
    f.enqueue("al-1").await;
    f.engine.run_cycle(&run()).await.unwrap();

    let calls = f.launcher.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].partition, "alpha");
    assert_eq!(calls[0].formula.as_deref(), Some("mol-polish"));
    assert!(calls[0].no_auto_schedule);
    assert!(calls[0].no_group);
    assert_eq!(calls[0].caller_context.as_deref(), Some("scheduler-dispatch"));
}

#[tokio::test]
async fn breaker_quarantines_after_exactly_three_attempts() {
    let f = fleet(5, 5);
    f.enqueue("al-1").await;
    f.launcher.break_item("al-1");

    for attempt in 1..=2u32 {
        let report = f.engine.run_cycle(&run()).await.unwrap();
        match &report.outcomes[0].outcome {
            Outcome::Retry { failures, reason } => {
                assert_eq!(*failures, attempt);
                assert!(reason.contains("no such formula"));
            }
            other => panic!("attempt {attempt}: unexpected outcome {other:?}"),
        }
        assert_eq!(f.state_of("al-1"), Some(ItemState::Queued));
    }

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert!(matches!(
        report.outcomes[0].outcome,
        Outcome::Quarantined { failures: 3, .. }
    ));
    assert_eq!(f.state_of("al-1"), Some(ItemState::Quarantined));

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(f.launcher.calls().len(), 3);

    let stored = metadata::decode(&f.store.item("al-1").unwrap().description).unwrap();
    assert_eq!(stored.dispatch_failures, 3);
    assert!(stored.last_failure.unwrap().contains("no such formula"));

    let kinds = f.events.kinds();
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::DispatchFailed).count(),
        3
    );
    assert_eq!(kinds.last(), Some(&EventKind::Quarantine));
}

#[tokio::test]
async fn malformed_metadata_is_quarantined_on_first_attempt() {
    let f = fleet(5, 5);

    let mut bare = WorkItem::new("al-1", "queued by hand");
    bare.labels.push(LABEL_QUEUED.to_string());
    f.store.insert(bare);

    let mut headless = WorkItem::new("al-2", "no target");
    headless.description = format!("text\n{}\nformula: mol-x", metadata::DELIMITER);
    headless.labels.push(LABEL_QUEUED.to_string());
    f.store.insert(headless);

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.quarantined(), 2);
    for outcome in &report.outcomes {
        assert!(matches!(
            outcome.outcome,
            Outcome::Quarantined { failures: 0, .. }
        ));
    }
    assert!(f.launcher.calls().is_empty());
    assert_eq!(f.state_of("al-1"), Some(ItemState::Quarantined));
    assert_eq!(f.state_of("al-2"), Some(ItemState::Quarantined));

    let meta = metadata::decode(&f.store.item("al-2").unwrap().description).unwrap();
    assert_eq!(meta.dispatch_failures, 0);
}

#[tokio::test]
async fn concurrent_cycles_dispatch_once() {
    let f = fleet_with(
        settings(10, 10),
        ScriptedLauncher::with_delay(Duration::from_millis(50)),
    );
    for id in ["al-1", "al-2", "al-3"] {
        f.enqueue(id).await;
    }

    let opts = run();
    let (a, b) = tokio::join!(f.engine.run_cycle(&opts), f.engine.run_cycle(&opts));
    let (a, b) = (a.unwrap(), b.unwrap());

    let skipped = [&a, &b]
        .iter()
        .filter(|r| r.skipped == Some(SkipReason::Locked))
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(a.dispatched() + b.dispatched(), 3);

    let mut calls = f.launcher.calls();
    calls.sort();
    assert_eq!(calls, vec!["al-1", "al-2", "al-3"]);
}

#[tokio::test]
async fn held_lock_is_a_clean_skip() {
    let f = fleet(10, 10);
    f.enqueue("al-1").await;

    let _held = DispatchLock::for_root(f.dir.path()).try_lock().unwrap().unwrap();
    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::Locked));
    assert!(f.launcher.calls().is_empty());
    assert_eq!(f.state_of("al-1"), Some(ItemState::Queued));
}

#[tokio::test]
async fn pause_blocks_dispatch_and_resume_restores_it() {
    let f = fleet(10, 10);
    f.enqueue("al-1").await;
    let before = f.store.item("al-1").unwrap();

    assert!(f.engine.pause("mayor").unwrap());
    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(
        report.skipped,
        Some(SkipReason::Paused {
            by: "mayor".to_string()
        })
    );
    assert!(f.launcher.calls().is_empty());
    assert_eq!(f.store.item("al-1").unwrap(), before);

    assert!(f.engine.resume().unwrap());
    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.dispatched(), 1);
}

#[tokio::test]
async fn cleared_item_keeps_inert_metadata() {
    let f = fleet(10, 10);
    f.enqueue("al-1").await;
    f.enqueue("al-2").await;

    assert!(f.engine.queue().remove("al-1").await.unwrap());
    let loaded = f.engine.queue().load().await.unwrap();
    assert!(loaded.iter().all(|item| item.id != "al-1"));
    assert!(metadata::has_block(&f.store.item("al-1").unwrap().description));

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.dispatched(), 1);
    assert_eq!(f.launcher.calls(), vec!["al-2"]);
}

#[tokio::test]
async fn failed_label_swap_still_prevents_redispatch() {
    let f = fleet(10, 10);
    f.enqueue("al-1").await;
    // Swap and its retry fail; the fallback removal goes through.
    f.store.fail_label_writes("al-1", 2);

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.dispatched(), 1);
    let item = f.store.item("al-1").unwrap();
    assert!(item.labels.is_empty());

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(f.launcher.calls().len(), 1);
}

#[tokio::test]
async fn circuit_broken_items_are_skipped() {
    let f = fleet(10, 10);
    let mut meta = SchedulerMetadata::new("alpha");
    meta.dispatch_failures = 3;
    let mut item = WorkItem::new("al-1", "worn");
    item.description = metadata::encode("", &meta);
    item.labels.push(LABEL_QUEUED.to_string());
    f.store.insert(item);

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.circuit_broken, 1);
    assert_eq!(report.ready, 0);
    assert!(f.launcher.calls().is_empty());
}

#[tokio::test]
async fn dry_run_plans_without_side_effects() {
    let f = fleet(1, 5);
    f.enqueue("al-1").await;
    f.enqueue("al-2").await;
    let writes = f.store.write_count();

    let opts = CycleOptions {
        dry_run: true,
        ..run()
    };
    let report = f.engine.run_cycle(&opts).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.planned.len(), 1);
    assert_eq!(report.planned[0].id, "al-1");
    assert_eq!(report.deferred, vec!["al-2".to_string()]);
    assert!(report.outcomes.is_empty());
    assert!(f.launcher.calls().is_empty());
    assert_eq!(f.store.write_count(), writes);
}

#[tokio::test]
async fn cli_overrides_beat_config() {
    let f = fleet(1, 1);
    for id in ["al-1", "al-2", "al-3"] {
        f.enqueue(id).await;
    }
    let opts = CycleOptions {
        max_override: Some(3),
        batch_override: Some(2),
        ..run()
    };
    let report = f.engine.run_cycle(&opts).await.unwrap();
    assert_eq!(report.dispatched(), 2);
    assert_eq!(report.reason, PlanReason::Batch);
}

#[tokio::test]
async fn pool_respects_parallelism() {
    let mut s = settings(10, 10);
    s.parallelism = 2;
    let f = fleet_with(s, ScriptedLauncher::with_delay(Duration::from_millis(30)));
    for id in ["al-1", "al-2", "al-3", "al-4", "al-5"] {
        f.enqueue(id).await;
    }

    let report = f.engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.dispatched(), 5);
    assert!(f.launcher.peak.load(Ordering::SeqCst) <= 2);
    let ids: Vec<_> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["al-1", "al-2", "al-3", "al-4", "al-5"]);
}

#[tokio::test]
async fn cycle_deadline_fails_hung_launch_and_leaves_rest_queued() {
    let mut s = settings(10, 10);
    s.cycle_timeout = Duration::from_millis(50);
    let f = fleet_with(s, ScriptedLauncher::with_delay(Duration::from_millis(500)));
    f.enqueue("al-1").await;
    f.enqueue("al-2").await;

    let report = f.engine.run_cycle(&run()).await.unwrap();
    match &report.outcomes[0].outcome {
        Outcome::Retry { failures, reason } => {
            assert_eq!(*failures, 1);
            assert!(reason.contains("timed out"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(report.outcomes[1].outcome, Outcome::NotStarted);
    assert_eq!(f.state_of("al-2"), Some(ItemState::Queued));
    assert_eq!(f.launcher.calls(), vec!["al-1"]);
}

#[tokio::test]
async fn status_reports_state_and_counts() {
    let f = fleet(4, 2);
    f.enqueue("al-1").await;
    f.counter.set(1);
    f.engine.pause("witness").unwrap();

    let status = f.engine.status().await.unwrap();
    assert!(status.state.paused);
    assert_eq!(status.state.paused_by, "witness");
    assert!(status.governed);
    assert_eq!(status.active, Some(1));
    assert_eq!(status.ready, 1);

    f.counter.set_failing(true);
    let status = f.engine.status().await.unwrap();
    assert_eq!(status.active, None);
}

#[tokio::test]
async fn file_event_log_records_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let config = FleetConfig::from_toml("[partitions.alpha]\nprefix = \"al\"\n").unwrap();
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(FileEventLog::for_root(dir.path()));
    let deps = EngineDeps {
        store: store.clone(),
        launcher: Arc::new(ScriptedLauncher::default()),
        counter: Arc::new(FixedCounter::new(0)),
        state: Arc::new(fleet_state::FileStateBackend::for_root(dir.path())),
        events: log.clone(),
    };
    let engine = DispatchEngine::new(deps, Arc::new(config), DispatchLock::for_root(dir.path()))
        .with_settings(settings(3, 3));

    store.insert(WorkItem::new("al-1", "logged"));
    engine
        .queue()
        .add("al-1", SchedulerMetadata::new("alpha"), &AddOptions::default())
        .await
        .unwrap();
    let report = engine.run_cycle(&run()).await.unwrap();
    assert_eq!(report.dispatched(), 1);

    let body = std::fs::read_to_string(log.path()).unwrap();
    let kinds: Vec<String> = body
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["kind"].to_string())
        .collect();
    assert_eq!(kinds, vec!["\"enqueue\"", "\"dispatch\""]);
    assert!(body.contains("worker-al-1"));
}

#[tokio::test]
async fn hung_store_cannot_wedge_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = FleetConfig::from_toml("[partitions.alpha]\nprefix = \"al\"\n").unwrap();
    let inner = Arc::new(MemoryStore::new());
    let store = Arc::new(HangingStore {
        inner: inner.clone(),
        hang: AtomicBool::new(false),
    });
    let launcher = Arc::new(ScriptedLauncher::default());
    let deps = EngineDeps {
        store: store.clone(),
        launcher: launcher.clone(),
        counter: Arc::new(FixedCounter::new(0)),
        state: Arc::new(MemoryStateBackend::new()),
        events: Arc::new(MemoryEventLog::new()),
    };
    let mut s = settings(5, 5);
    s.cycle_timeout = Duration::from_millis(50);
    s.settle_timeout = Duration::from_millis(50);
    let engine = DispatchEngine::new(deps, Arc::new(config), DispatchLock::for_root(dir.path()))
        .with_settings(s);

    inner.insert(WorkItem::new("al-1", "stuck"));
    engine
        .queue()
        .add("al-1", SchedulerMetadata::new("alpha"), &AddOptions::default())
        .await
        .unwrap();

    // The launch succeeds; the post-launch re-read never returns.
    store.hang.store(true, Ordering::SeqCst);
    let result = tokio::time::timeout(Duration::from_secs(2), engine.run_cycle(&run()))
        .await
        .expect("cycle should give up at its time budget");
    assert!(matches!(result, Err(DispatchError::Timeout(_))));
    assert_eq!(launcher.calls(), vec!["al-1"]);

    store.hang.store(false, Ordering::SeqCst);
    let next = engine.run_cycle(&run()).await.unwrap();
    assert_ne!(next.skipped, Some(SkipReason::Locked));
}

#[tokio::test]
async fn spawn_delay_is_cut_short_by_the_deadline() {
    let mut s = settings(10, 10);
    s.spawn_delay = Duration::from_secs(3600);
    s.cycle_timeout = Duration::from_millis(100);
    let f = fleet_with(s, ScriptedLauncher::default());
    f.enqueue("al-1").await;
    f.enqueue("al-2").await;

    let report = tokio::time::timeout(Duration::from_secs(2), f.engine.run_cycle(&run()))
        .await
        .expect("spawn delay should not outlive the cycle")
        .unwrap();
    assert!(matches!(
        report.outcomes[0].outcome,
        Outcome::Dispatched { .. }
    ));
    assert_eq!(report.outcomes[1].outcome, Outcome::NotStarted);
    assert_eq!(f.launcher.calls(), vec!["al-1"]);
    assert_eq!(f.state_of("al-2"), Some(ItemState::Queued));
}
