//! Shared types used across fleet crates.

use serde::{Deserialize, Serialize};

/// Marks a work item as awaiting dispatch.
pub const LABEL_QUEUED: &str = "gt:queued";

/// Audit label left behind after a successful dispatch.
pub const LABEL_DISPATCHED: &str = "gt:queue-dispatched";

/// Terminal label: the scheduler will not retry this item automatically.
pub const LABEL_QUARANTINED: &str = "gt:dispatch-failed";

/// Lifecycle status of a work item, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Open,
    InProgress,
    Hooked,
    Pinned,
    Closed,
    #[serde(other)]
    Unknown,
}

impl ItemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ItemStatus::Open => "open",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Hooked => "hooked",
            ItemStatus::Pinned => "pinned",
            ItemStatus::Closed => "closed",
            ItemStatus::Unknown => "unknown",
        }
    }

    /// Work is attached to a live worker already.
    pub fn is_claimed(&self) -> bool {
        matches!(
            self,
            ItemStatus::InProgress | ItemStatus::Hooked | ItemStatus::Pinned
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A unit of trackable work, owned by the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl WorkItem {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status: ItemStatus::Open,
            description: String::new(),
            labels: Vec::new(),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Scheduler state derived from the reserved labels, if any.
    pub fn scheduler_state(&self) -> Option<ItemState> {
        ItemState::from_labels(&self.labels)
    }

    /// Queue membership: queued label on an open item, not quarantined.
    pub fn is_queue_member(&self) -> bool {
        self.status == ItemStatus::Open && self.scheduler_state() == Some(ItemState::Queued)
    }
}

/// Where a work item sits in the scheduler's lifecycle.
///
/// The store only knows label strings; this is the typed view of them.
/// Quarantine wins over the queue label so a half-applied quarantine
/// (label added, queue label not yet removed) is never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Dispatched,
    Quarantined,
}

impl ItemState {
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Option<Self> {
        let has = |want: &str| labels.iter().any(|l| l.as_ref() == want);
        if has(LABEL_QUARANTINED) {
            Some(ItemState::Quarantined)
        } else if has(LABEL_QUEUED) {
            Some(ItemState::Queued)
        } else if has(LABEL_DISPATCHED) {
            Some(ItemState::Dispatched)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ItemState::Queued => LABEL_QUEUED,
            ItemState::Dispatched => LABEL_DISPATCHED,
            ItemState::Quarantined => LABEL_QUARANTINED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_from_labels_prefers_quarantine() {
        let labels = vec![LABEL_QUEUED.to_string(), LABEL_QUARANTINED.to_string()];
        assert_eq!(ItemState::from_labels(&labels), Some(ItemState::Quarantined));
    }

    #[test]
    fn state_from_unrelated_labels_is_none() {
        assert_eq!(ItemState::from_labels(&["bug", "p1"]), None);
    }

    #[test]
    fn queued_but_closed_is_not_member() {
        let mut item = WorkItem::new("gt-1", "closed work");
        item.labels.push(LABEL_QUEUED.to_string());
        assert!(item.is_queue_member());
        item.status = ItemStatus::Closed;
        assert!(!item.is_queue_member());
    }

    #[test]
    fn status_parses_unknown_values() {
        let item: WorkItem =
            serde_json::from_str(r#"{"id":"gt-2","status":"deferred"}"#).unwrap();
        assert_eq!(item.status, ItemStatus::Unknown);
        assert!(item.labels.is_empty());
    }

    #[test]
    fn claimed_statuses() {
        assert!(ItemStatus::Hooked.is_claimed());
        assert!(ItemStatus::InProgress.is_claimed());
        assert!(!ItemStatus::Open.is_claimed());
        assert!(!ItemStatus::Closed.is_claimed());
    }
}
