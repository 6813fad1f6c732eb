use std::collections::BTreeMap;

use anyhow::bail;
use clap::Args;

use fleet_core::ItemState;
use fleet_scheduler::{
    AddOptions, AddOutcome, CycleOptions, CycleReport, ListEntry, Outcome, SchedulerMetadata,
    SkipReason,
};

use crate::context::Fleet;

/// Launch parameters stored with a queued item and replayed at dispatch.
#[derive(Args, Debug, Default)]
pub struct LaunchParams {
    /// Workflow template to run
    #[arg(long)]
    pub formula: Option<String>,
    /// Free-form instructions for the worker
    #[arg(long = "args")]
    pub instructions: Option<String>,
    /// Template variable as key=value (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
    /// Merge strategy
    #[arg(long)]
    pub merge: Option<String>,
    #[arg(long)]
    pub base_branch: Option<String>,
    #[arg(long)]
    pub no_merge: bool,
    #[arg(long)]
    pub account: Option<String>,
    /// Worker agent override
    #[arg(long)]
    pub agent: Option<String>,
    /// Hand the raw work item to the worker, no template
    #[arg(long)]
    pub hook_raw: bool,
    #[arg(long)]
    pub owned: bool,
    #[arg(long)]
    pub mode: Option<String>,
    /// Group (convoy) the item belongs to
    #[arg(long)]
    pub group: Option<String>,
}

impl LaunchParams {
    pub fn into_metadata(self, partition: &str) -> anyhow::Result<SchedulerMetadata> {
        let mut vars = Vec::with_capacity(self.vars.len());
        for raw in &self.vars {
            match raw.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    vars.push((key.trim().to_string(), value.to_string()))
                }
                _ => bail!("invalid --var {raw:?}, expected KEY=VALUE"),
            }
        }
        Ok(SchedulerMetadata {
            formula: non_empty(self.formula),
            instructions: non_empty(self.instructions),
            vars,
            merge: non_empty(self.merge),
            group: non_empty(self.group),
            base_branch: non_empty(self.base_branch),
            no_merge: self.no_merge,
            account: non_empty(self.account),
            agent: non_empty(self.agent),
            hook_raw: self.hook_raw,
            owned: self.owned,
            mode: non_empty(self.mode),
            ..SchedulerMetadata::new(partition)
        })
    }
}

/// A blank flag value means "not set".
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn add_options(actor: &str, force: bool, dry_run: bool) -> AddOptions {
    AddOptions {
        force,
        dry_run,
        actor: actor.to_string(),
    }
}

pub async fn add(
    fleet: &Fleet,
    actor: &str,
    item: &str,
    partition: &str,
    params: LaunchParams,
    force: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let meta = params.into_metadata(partition)?;
    let opts = add_options(actor, force, dry_run);

    match fleet.engine.queue().add(item, meta, &opts).await? {
        AddOutcome::WouldQueue => {
            println!("Would queue {item} → {partition} (dry run)");
            return Ok(());
        }
        AddOutcome::Queued => println!("✓ Queued {item} → {partition}"),
    }

    dispatch_if_ungoverned(fleet, actor).await
}

pub async fn batch(
    fleet: &Fleet,
    actor: &str,
    partition: &str,
    items: &[String],
    params: LaunchParams,
    force: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let meta = params.into_metadata(partition)?;
    let opts = add_options(actor, force, dry_run);
    let report = fleet.engine.queue().add_batch(items, &meta, &opts).await;

    let verb = if dry_run { "Would queue" } else { "✓ Queued" };
    for id in &report.queued {
        println!("{verb} {id} → {partition}");
    }
    for (id, err) in &report.failed {
        println!("✗ {id}: {err}");
    }
    println!(
        "{} of {} queued",
        report.queued.len(),
        report.queued.len() + report.failed.len()
    );

    if report.all_failed() {
        bail!("no items were queued");
    }
    if dry_run {
        return Ok(());
    }
    dispatch_if_ungoverned(fleet, actor).await
}

/// Governance off means queued work goes out now, through the normal cycle.
async fn dispatch_if_ungoverned(fleet: &Fleet, actor: &str) -> anyhow::Result<()> {
    if fleet.engine.governance_enabled() {
        return Ok(());
    }
    let opts = CycleOptions {
        actor: actor.to_string(),
        ..Default::default()
    };
    let report = fleet.engine.run_cycle(&opts).await?;
    print_cycle(&report);
    Ok(())
}

pub async fn run(
    fleet: &Fleet,
    actor: &str,
    dry_run: bool,
    max: Option<i64>,
    batch: Option<u32>,
) -> anyhow::Result<()> {
    let opts = CycleOptions {
        dry_run,
        max_override: max,
        batch_override: batch,
        actor: actor.to_string(),
    };
    let report = fleet.engine.run_cycle(&opts).await?;
    if dry_run {
        print_plan(&report);
    } else {
        print_cycle(&report);
    }
    Ok(())
}

fn print_skip(skip: &SkipReason) {
    match skip {
        SkipReason::Locked => println!("Another dispatch cycle is running, nothing to do"),
        SkipReason::Paused { by } => println!("⏸ Scheduler paused by {by}, nothing dispatched"),
    }
}

fn print_plan(report: &CycleReport) {
    if let Some(skip) = &report.skipped {
        print_skip(skip);
        return;
    }
    println!("Capacity: {}", report.capacity_label());
    println!("Batch:    {}", report.batch_size);
    println!("Ready:    {}", report.ready);
    if report.circuit_broken > 0 {
        println!("Circuit-broken: {}", report.circuit_broken);
    }
    println!("Would dispatch {} ({})", report.planned.len(), report.reason);
    for item in &report.planned {
        println!("  {} → {}  {}", item.id, item.partition, item.title);
    }
    if !report.deferred.is_empty() {
        println!("Deferred: {}", report.deferred.join(", "));
    }
}

fn print_cycle(report: &CycleReport) {
    if let Some(skip) = &report.skipped {
        print_skip(skip);
        return;
    }
    for item in &report.outcomes {
        match &item.outcome {
            Outcome::Dispatched { worker } => match worker {
                Some(worker) => println!("✓ {} → {} ({worker})", item.id, item.partition),
                None => println!("✓ {} → {}", item.id, item.partition),
            },
            Outcome::Retry { failures, reason } => {
                println!("✗ {}: {reason} (attempt {failures}, will retry)", item.id)
            }
            Outcome::Quarantined { failures, reason } => {
                println!("✗ {}: quarantined after {failures} failures: {reason}", item.id)
            }
            Outcome::NotStarted => println!("… {}: cycle deadline reached, still queued", item.id),
        }
    }
    println!(
        "Dispatched {}, retrying {}, quarantined {}, deferred {} [{}]",
        report.dispatched(),
        report.retried(),
        report.quarantined(),
        report.deferred.len() + report.not_started(),
        report.capacity_label()
    );
}

pub async fn status(fleet: &Fleet, json: bool) -> anyhow::Result<()> {
    let status = fleet.engine.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Fleet:     {}", fleet.root.display());
    if status.state.paused {
        match status.state.paused_at {
            Some(at) => println!("State:     ⏸ paused by {} at {at}", status.state.paused_by),
            None => println!("State:     ⏸ paused by {}", status.state.paused_by),
        }
    } else {
        println!("State:     ▶ running");
    }
    if status.governed {
        let active = status
            .active
            .map_or_else(|| "unknown".to_string(), |n| n.to_string());
        println!("Workers:   {active} active of {} max", status.max_workers);
    } else {
        println!("Workers:   ungoverned");
    }
    println!("Batch:     {}", status.batch_size);
    println!("Ready:     {}", status.ready);
    if let Some(at) = status.state.last_dispatch_at {
        println!(
            "Last run:  {} dispatched at {at}",
            status.state.last_dispatch_count
        );
    }
    Ok(())
}

pub async fn list(fleet: &Fleet, json: bool) -> anyhow::Result<()> {
    let entries = fleet.engine.queue().list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    for (partition, items) in by_partition(&entries) {
        println!("{partition} ({})", items.len());
        for entry in items {
            println!("  {}", describe(entry));
        }
    }
    Ok(())
}

fn by_partition(entries: &[ListEntry]) -> BTreeMap<&str, Vec<&ListEntry>> {
    let mut groups: BTreeMap<&str, Vec<&ListEntry>> = BTreeMap::new();
    for entry in entries {
        let name = if entry.partition.is_empty() {
            "(unassigned)"
        } else {
            entry.partition.as_str()
        };
        groups.entry(name).or_default().push(entry);
    }
    groups
}

fn describe(entry: &ListEntry) -> String {
    let mut line = format!("{}  {}", entry.id, entry.title);
    match entry.state {
        ItemState::Quarantined => {
            line.push_str(&format!("  [quarantined, {} failures", entry.dispatch_failures));
            if let Some(reason) = &entry.last_failure {
                line.push_str(&format!(": {reason}"));
            }
            line.push(']');
        }
        _ if entry.blocked => line.push_str("  [blocked]"),
        _ if entry.dispatch_failures > 0 => {
            line.push_str(&format!("  [{} failed attempts]", entry.dispatch_failures))
        }
        _ => {}
    }
    line
}

pub fn pause(fleet: &Fleet, actor: &str) -> anyhow::Result<()> {
    if fleet.engine.pause(actor)? {
        println!("⏸ Scheduler paused");
    } else {
        println!("Scheduler already paused");
    }
    Ok(())
}

pub fn resume(fleet: &Fleet) -> anyhow::Result<()> {
    if fleet.engine.resume()? {
        println!("▶ Scheduler resumed");
    } else {
        println!("Scheduler was not paused");
    }
    Ok(())
}

pub async fn clear(fleet: &Fleet, item: Option<&str>) -> anyhow::Result<()> {
    let queue = fleet.engine.queue();
    if let Some(id) = item {
        if queue.remove(id).await? {
            println!("✓ Removed {id} from the queue");
        } else {
            println!("{id} was not queued");
        }
        return Ok(());
    }

    let report = queue.clear().await?;
    for (id, err) in &report.failed {
        println!("✗ {id}: {err}");
    }
    println!("✓ Cleared {} items", report.removed.len());
    if !report.failed.is_empty() {
        bail!("{} items could not be cleared", report.failed.len());
    }
    Ok(())
}
