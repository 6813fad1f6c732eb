//! The dispatch queue, materialised entirely as labels in the work-item store.
//!
//! Membership is "open + carries the queued label + not quarantined"; there
//! is no index of our own. Enqueueing is two writes in a fixed order:
//!
//! ```text
//!   description  <- user text + metadata block     (inert on its own)
//!   labels       <- +queued, -quarantined          (the commit point)
//! ```
//!
//! A crash between the two leaves metadata without the label, which the
//! dispatch path never sees. A failed label write restores the original
//! description.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use fleet_core::{
    FleetConfig, ItemState, ItemStatus, LABEL_QUARANTINED, LABEL_QUEUED, WorkItem,
};
use fleet_store::{LabelQuery, WorkItemStore};

use crate::error::{QueueError, QueueResult};
use crate::events::{Event, EventKind, EventSink};
use crate::metadata::{self, SchedulerMetadata};

/// A queue member as seen by the dispatch path.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub title: String,
    pub partition: String,
    pub description: String,
    /// `None` when the description has no metadata block.
    pub metadata: Option<SchedulerMetadata>,
}

impl QueueItem {
    pub fn from_work_item(item: WorkItem, config: &FleetConfig) -> Self {
        let metadata = metadata::decode(&item.description);
        let partition = metadata
            .as_ref()
            .map(|m| m.target.clone())
            .filter(|t| !t.is_empty())
            .or_else(|| config.partition_for_item(&item.id).map(str::to_string))
            .unwrap_or_default();
        Self {
            id: item.id,
            title: item.title,
            partition,
            description: item.description,
            metadata,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(id: &str, metadata: Option<SchedulerMetadata>) -> Self {
        Self {
            id: id.to_string(),
            title: id.to_string(),
            partition: metadata.as_ref().map(|m| m.target.clone()).unwrap_or_default(),
            description: String::new(),
            metadata,
        }
    }
}

/// One row of `schedule list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListEntry {
    pub id: String,
    pub title: String,
    pub partition: String,
    pub state: ItemState,
    /// Waiting on an open dependency, per the store.
    pub blocked: bool,
    pub dispatch_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Bypass the partition-ownership, status, and already-queued checks.
    pub force: bool,
    /// Validate and report without writing.
    pub dry_run: bool,
    pub actor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Queued,
    /// Dry run: every check passed, nothing written.
    WouldQueue,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub queued: Vec<String>,
    pub failed: Vec<(String, QueueError)>,
}

impl BatchReport {
    /// True when there was work and none of it succeeded.
    pub fn all_failed(&self) -> bool {
        self.queued.is_empty() && !self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ClearReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Queue operations over the work-item store.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn WorkItemStore>,
    events: Arc<dyn EventSink>,
    config: Arc<FleetConfig>,
}

impl Queue {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        events: Arc<dyn EventSink>,
        config: Arc<FleetConfig>,
    ) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Enqueue `id` with the given launch parameters.
    pub async fn add(
        &self,
        id: &str,
        meta: SchedulerMetadata,
        opts: &AddOptions,
    ) -> QueueResult<AddOutcome> {
        let item = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        self.validate(&item, &meta.target, opts.force)?;

        if opts.dry_run {
            debug!(item = %id, partition = %meta.target, "dry run: would queue");
            return Ok(AddOutcome::WouldQueue);
        }

        let original = item.description.clone();
        let updated = metadata::encode(&original, &meta);
        self.store.update_description(id, &updated).await?;

        if let Err(source) = self
            .store
            .update_labels(id, &[LABEL_QUEUED], &[LABEL_QUARANTINED])
            .await
        {
            warn!(item = %id, error = %source, "queue label write failed, restoring description");
            return match self.store.update_description(id, &original).await {
                Ok(()) => Err(QueueError::LabelWrite {
                    item: id.to_string(),
                    source,
                }),
                Err(restore) => {
                    error!(item = %id, error = %restore, "could not restore description");
                    Err(QueueError::RollbackFailed {
                        item: id.to_string(),
                        source,
                    })
                }
            };
        }

        info!(item = %id, partition = %meta.target, "work item queued");
        self.events
            .record(Event::new(EventKind::Enqueue, &opts.actor, id, &meta.target));
        Ok(AddOutcome::Queued)
    }

    fn validate(&self, item: &WorkItem, partition: &str, force: bool) -> QueueResult<()> {
        if !self.config.has_partition(partition) {
            return Err(QueueError::UnknownPartition(partition.to_string()));
        }
        if !force
            && let Some(owner) = self.config.partition_for_item(&item.id)
            && owner != partition
        {
            return Err(QueueError::CrossPartition {
                item: item.id.clone(),
                owner: owner.to_string(),
                partition: partition.to_string(),
            });
        }
        if item.status == ItemStatus::Closed {
            return Err(QueueError::Closed(item.id.clone()));
        }
        if force {
            return Ok(());
        }
        if item.status.is_claimed() {
            return Err(QueueError::Claimed {
                item: item.id.clone(),
                status: item.status,
            });
        }
        if item.is_queue_member() {
            return Err(QueueError::AlreadyQueued(item.id.clone()));
        }
        Ok(())
    }

    /// Enqueue many items into one partition. Each gets its own copy of `meta`.
    pub async fn add_batch(
        &self,
        ids: &[String],
        meta: &SchedulerMetadata,
        opts: &AddOptions,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            match self.add(id, meta.clone(), opts).await {
                Ok(_) => report.queued.push(id.clone()),
                Err(e) => {
                    warn!(item = %id, error = %e, "batch enqueue failed");
                    report.failed.push((id.clone(), e));
                }
            }
        }
        report
    }

    /// Ready queue members across all partitions, in store order.
    pub async fn load(&self) -> QueueResult<Vec<QueueItem>> {
        let items = self
            .store
            .query_by_label(LABEL_QUEUED, LabelQuery::Ready)
            .await?;
        Ok(items
            .into_iter()
            .filter(WorkItem::is_queue_member)
            .map(|item| QueueItem::from_work_item(item, &self.config))
            .collect())
    }

    /// Every queue member plus quarantined items, with a blocked flag.
    pub async fn list(&self) -> QueueResult<Vec<ListEntry>> {
        let ready: HashSet<String> = self
            .store
            .query_by_label(LABEL_QUEUED, LabelQuery::Ready)
            .await?
            .into_iter()
            .map(|item| item.id)
            .collect();
        let queued = self
            .store
            .query_by_label(LABEL_QUEUED, LabelQuery::All)
            .await?;
        let quarantined = self
            .store
            .query_by_label(LABEL_QUARANTINED, LabelQuery::All)
            .await?;

        let mut entries = Vec::new();
        for item in queued.into_iter().filter(WorkItem::is_queue_member) {
            let blocked = !ready.contains(&item.id);
            entries.push(self.entry(item, ItemState::Queued, blocked));
        }
        for item in quarantined
            .into_iter()
            .filter(|item| item.status != ItemStatus::Closed)
        {
            entries.push(self.entry(item, ItemState::Quarantined, false));
        }
        Ok(entries)
    }

    fn entry(&self, item: WorkItem, state: ItemState, blocked: bool) -> ListEntry {
        let queued = QueueItem::from_work_item(item, &self.config);
        let (dispatch_failures, last_failure) = queued
            .metadata
            .map(|m| (m.dispatch_failures, m.last_failure))
            .unwrap_or_default();
        ListEntry {
            id: queued.id,
            title: queued.title,
            partition: queued.partition,
            state,
            blocked,
            dispatch_failures,
            last_failure,
        }
    }

    /// Take one item out of the queue. Its metadata stays, inert.
    ///
    /// Returns `false` if the item was not queued.
    pub async fn remove(&self, id: &str) -> QueueResult<bool> {
        let item = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !item.has_label(LABEL_QUEUED) {
            return Ok(false);
        }
        self.store.remove_label(id, LABEL_QUEUED).await?;
        info!(item = %id, "removed from queue");
        Ok(true)
    }

    /// Remove the queued label from every carrier. Best effort.
    pub async fn clear(&self) -> QueueResult<ClearReport> {
        let items = self
            .store
            .query_by_label(LABEL_QUEUED, LabelQuery::All)
            .await?;
        let mut report = ClearReport::default();
        for item in items {
            match self.store.remove_label(&item.id, LABEL_QUEUED).await {
                Ok(()) => report.removed.push(item.id),
                Err(e) => {
                    warn!(item = %item.id, error = %e, "failed to clear queue label");
                    report.failed.push((item.id, e.to_string()));
                }
            }
        }
        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "queue cleared"
        );
        Ok(report)
    }
}
