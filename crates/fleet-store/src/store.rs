//! The work-item store interface consumed by the scheduler.

use async_trait::async_trait;

use fleet_core::{ItemStatus, WorkItem};

use crate::error::{StoreError, StoreResult};

/// Which carriers of a label a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelQuery {
    /// Open items not blocked on a dependency.
    Ready,
    /// Every item carrying the label, in any status.
    All,
}

/// Operations the scheduler needs from the external store.
///
/// Calls are synchronous from the caller's point of view and carry their
/// own retry semantics; the scheduler does not retry them.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Fetch one item. `Ok(None)` if the store does not know the id.
    async fn get(&self, id: &str) -> StoreResult<Option<WorkItem>>;

    /// Add and remove labels in one write.
    async fn update_labels(&self, id: &str, add: &[&str], remove: &[&str]) -> StoreResult<()>;

    /// Replace the free-text description.
    async fn update_description(&self, id: &str, text: &str) -> StoreResult<()>;

    /// Items carrying `label` across all partitions, in store order.
    async fn query_by_label(&self, label: &str, query: LabelQuery) -> StoreResult<Vec<WorkItem>>;

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self.get(id).await?.is_some())
    }

    async fn status(&self, id: &str) -> StoreResult<ItemStatus> {
        self.get(id)
            .await?
            .map(|item| item.status)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn add_label(&self, id: &str, label: &str) -> StoreResult<()> {
        self.update_labels(id, &[label], &[]).await
    }

    async fn remove_label(&self, id: &str, label: &str) -> StoreResult<()> {
        self.update_labels(id, &[], &[label]).await
    }
}
