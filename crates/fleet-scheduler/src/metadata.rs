//! Scheduler metadata block — launch parameters embedded in a work item's
//! description.
//!
//! The block sits at the end of the description, after a namespaced
//! delimiter line, one `key: value` per line:
//!
//! ```text
//! Fix the login redirect.
//!
//! ---gt:scheduler:v1---
//! target_rig: alpha
//! formula: mol-polish
//! var: issue=gt-12
//! enqueued_at: 2026-03-01T10:00:00Z
//! dispatch_failures: 1
//! last_failure: launch of gt-12 failed (exit status: 1): no such rig
//! ```
//!
//! Everything before the delimiter belongs to the user and is never touched.
//! Values are sanitised on write so user content cannot open a second block
//! or inject keys.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;

use fleet_runtime::LaunchRequest;

/// Delimiter written by the current codec.
pub const DELIMITER: &str = "---gt:scheduler:v1---";

/// Older delimiter, still read and stripped.
pub const LEGACY_DELIMITER: &str = "---gt:queue:v1---";

/// Parsed launch parameters plus circuit-breaker bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetadata {
    /// Partition the worker should run in.
    pub target: String,
    pub formula: Option<String>,
    pub instructions: Option<String>,
    pub vars: Vec<(String, String)>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub merge: Option<String>,
    /// Group (convoy) the item was attached to at enqueue time.
    pub group: Option<String>,
    pub base_branch: Option<String>,
    pub no_merge: bool,
    pub account: Option<String>,
    pub agent: Option<String>,
    pub hook_raw: bool,
    pub owned: bool,
    pub mode: Option<String>,
    pub dispatch_failures: u32,
    pub last_failure: Option<String>,
}

impl SchedulerMetadata {
    /// Fresh block for `target`, stamped with the current time.
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            enqueued_at: Some(Utc::now().trunc_subsecs(0)),
            ..Default::default()
        }
    }

    /// Why this block cannot be dispatched, if it cannot.
    pub fn defect(&self) -> Option<&'static str> {
        if self.target.is_empty() {
            return Some("scheduler metadata has no target partition");
        }
        None
    }

    pub fn is_valid(&self) -> bool {
        self.defect().is_none()
    }

    /// Launch request for `item` carrying these parameters.
    pub fn launch_request(&self, item: &str) -> LaunchRequest {
        LaunchRequest {
            item: item.to_string(),
            partition: self.target.clone(),
            formula: self.formula.clone(),
            instructions: self.instructions.clone(),
            vars: self.vars.clone(),
            merge: self.merge.clone(),
            base_branch: self.base_branch.clone(),
            no_merge: self.no_merge,
            account: self.account.clone(),
            agent: self.agent.clone(),
            hook_raw: self.hook_raw,
            mode: self.mode.clone(),
            ..Default::default()
        }
    }
}

/// Render the block alone, delimiter first.
pub fn format_block(meta: &SchedulerMetadata) -> String {
    let mut lines = vec![DELIMITER.to_string()];
    // Present optionals are written even when empty so decode sees `Some("")`.
    let mut push = |key: &str, value: Option<&str>| {
        if let Some(value) = value {
            lines.push(format!("{key}: {}", sanitize(value)));
        }
    };

    push("target_rig", (!meta.target.is_empty()).then_some(meta.target.as_str()));
    push("formula", meta.formula.as_deref());
    push("args", meta.instructions.as_deref());
    for (key, value) in &meta.vars {
        push("var", Some(format!("{key}={value}").as_str()));
    }
    let enqueued_at = meta
        .enqueued_at
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true));
    push("enqueued_at", enqueued_at.as_deref());
    push("merge", meta.merge.as_deref());
    push("convoy", meta.group.as_deref());
    push("base_branch", meta.base_branch.as_deref());
    push("no_merge", meta.no_merge.then_some("true"));
    push("account", meta.account.as_deref());
    push("agent", meta.agent.as_deref());
    push("hook_raw_bead", meta.hook_raw.then_some("true"));
    push("owned", meta.owned.then_some("true"));
    push("mode", meta.mode.as_deref());
    let failures = (meta.dispatch_failures > 0).then(|| meta.dispatch_failures.to_string());
    push("dispatch_failures", failures.as_deref());
    push("last_failure", meta.last_failure.as_deref());

    lines.join("\n")
}

/// Replace any existing block in `description` with a fresh one.
pub fn encode(description: &str, meta: &SchedulerMetadata) -> String {
    let base = strip(description);
    let block = format_block(meta);
    if base.is_empty() {
        block
    } else {
        format!("{base}\n{block}")
    }
}

/// Parse the block out of `description`.
///
/// `None` means the description carries no block at all. A block that is
/// present but unusable still decodes; check [`SchedulerMetadata::defect`].
pub fn decode(description: &str) -> Option<SchedulerMetadata> {
    let (idx, delimiter) = find_delimiter(description)?;
    let section = &description[idx + delimiter.len()..];

    let mut meta = SchedulerMetadata::default();
    for line in section.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let bare = line.trim();
        if bare.is_empty() {
            continue;
        }
        if bare == DELIMITER || bare == LEGACY_DELIMITER {
            break;
        }
        // Values are kept verbatim; only the key and flag values are trimmed.
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        let text = || Some(value.to_string());
        let flag = value.trim() == "true";

        match key.trim() {
            "target_rig" => meta.target = value.to_string(),
            "formula" => meta.formula = text(),
            "args" => meta.instructions = text(),
            "var" => meta.vars.push(split_var(value)),
            // Older blocks packed vars into one comma-separated line.
            "vars" => meta.vars.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(split_var)
                    .map(|(key, value)| (key.trim().to_string(), value)),
            ),
            "enqueued_at" => {
                meta.enqueued_at = DateTime::parse_from_rfc3339(value.trim())
                    .ok()
                    .map(|at| at.with_timezone(&Utc));
            }
            "merge" => meta.merge = text(),
            "convoy" => meta.group = text(),
            "base_branch" => meta.base_branch = text(),
            "no_merge" => meta.no_merge = flag,
            "account" => meta.account = text(),
            "agent" => meta.agent = text(),
            "hook_raw_bead" => meta.hook_raw = flag,
            "owned" => meta.owned = flag,
            "mode" => meta.mode = text(),
            // Unparseable counts read as zero; the quarantine label guards
            // items that already tripped.
            "dispatch_failures" => meta.dispatch_failures = value.trim().parse().unwrap_or(0),
            "last_failure" => meta.last_failure = text(),
            _ => {}
        }
    }
    Some(meta)
}

/// Remove the block, leaving the user's text. Idempotent.
pub fn strip(description: &str) -> String {
    match find_delimiter(description) {
        Some((idx, _)) => {
            let base = &description[..idx];
            base.strip_suffix('\n').unwrap_or(base).to_string()
        }
        None => description.to_string(),
    }
}

pub fn has_block(description: &str) -> bool {
    find_delimiter(description).is_some()
}

/// Earliest delimiter that starts a line. A delimiter quoted mid-line is
/// user text.
fn find_delimiter(description: &str) -> Option<(usize, &'static str)> {
    [DELIMITER, LEGACY_DELIMITER]
        .into_iter()
        .filter_map(|delimiter| {
            description
                .match_indices(delimiter)
                .map(|(idx, _)| idx)
                .find(|&idx| idx == 0 || description[..idx].ends_with('\n'))
                .map(|idx| (idx, delimiter))
        })
        .min_by_key(|(idx, _)| *idx)
}

fn sanitize(value: &str) -> String {
    value
        .replace(DELIMITER, "---gt_scheduler_v1---")
        .replace(LEGACY_DELIMITER, "---gt_queue_v1---")
        .replace(['\r', '\n'], " ")
}

fn split_var(raw: &str) -> (String, String) {
    match raw.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (raw.to_string(), String::new()),
    }
}
