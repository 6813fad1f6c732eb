//! In-memory work-item store with fault injection, for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use fleet_core::{ItemStatus, WorkItem};

use crate::error::{StoreError, StoreResult};
use crate::store::{LabelQuery, WorkItemStore};

/// Let `skip` writes through, then reject the next `remaining`.
#[derive(Debug, Clone, Copy)]
struct Fault {
    skip: u32,
    remaining: u32,
}

#[derive(Debug, Default)]
struct Inner {
    /// Items in insertion order.
    items: Vec<WorkItem>,
    blocked: HashSet<String>,
    label_faults: HashMap<String, Fault>,
    description_faults: HashMap<String, Fault>,
    writes: u64,
}

impl Inner {
    fn find_mut(&mut self, id: &str) -> StoreResult<&mut WorkItem> {
        self.items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// A [`WorkItemStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item. New ids append to the store order.
    pub fn insert(&self, item: WorkItem) {
        let mut inner = self.lock();
        match inner.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => inner.items.push(item),
        }
    }

    /// Snapshot of one item without going through the async trait.
    pub fn item(&self, id: &str) -> Option<WorkItem> {
        self.lock().items.iter().find(|i| i.id == id).cloned()
    }

    pub fn set_status(&self, id: &str, status: ItemStatus) {
        if let Ok(item) = self.lock().find_mut(id) {
            item.status = status;
        }
    }

    /// Mark an item as blocked on an open dependency.
    pub fn set_blocked(&self, id: &str, blocked: bool) {
        let mut inner = self.lock();
        if blocked {
            inner.blocked.insert(id.to_string());
        } else {
            inner.blocked.remove(id);
        }
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.lock().blocked.contains(id)
    }

    /// Reject the next `count` label writes for `id`.
    pub fn fail_label_writes(&self, id: &str, count: u32) {
        let fault = Fault {
            skip: 0,
            remaining: count,
        };
        self.lock().label_faults.insert(id.to_string(), fault);
    }

    /// Reject the next `count` description writes for `id`.
    pub fn fail_description_writes(&self, id: &str, count: u32) {
        self.fail_description_writes_after(id, 0, count);
    }

    /// Let `skip` description writes for `id` succeed, then reject `count`.
    pub fn fail_description_writes_after(&self, id: &str, skip: u32, count: u32) {
        let fault = Fault {
            skip,
            remaining: count,
        };
        self.lock().description_faults.insert(id.to_string(), fault);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn take_failure(faults: &mut HashMap<String, Fault>, id: &str) -> bool {
    let Some(fault) = faults.get_mut(id) else {
        return false;
    };
    if fault.skip > 0 {
        fault.skip -= 1;
        false
    } else if fault.remaining > 0 {
        fault.remaining -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl WorkItemStore for MemoryStore {
    async fn get(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        Ok(self.item(id))
    }

    async fn update_labels(&self, id: &str, add: &[&str], remove: &[&str]) -> StoreResult<()> {
        let mut inner = self.lock();
        if take_failure(&mut inner.label_faults, id) {
            return Err(StoreError::WriteRejected {
                id: id.to_string(),
                reason: "injected label write failure".to_string(),
            });
        }
        let item = inner.find_mut(id)?;
        item.labels.retain(|l| !remove.contains(&l.as_str()));
        for label in add {
            if !item.labels.iter().any(|l| l == label) {
                item.labels.push(label.to_string());
            }
        }
        inner.writes += 1;
        Ok(())
    }

    async fn update_description(&self, id: &str, text: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if take_failure(&mut inner.description_faults, id) {
            return Err(StoreError::WriteRejected {
                id: id.to_string(),
                reason: "injected description write failure".to_string(),
            });
        }
        inner.find_mut(id)?.description = text.to_string();
        inner.writes += 1;
        Ok(())
    }

    async fn query_by_label(&self, label: &str, query: LabelQuery) -> StoreResult<Vec<WorkItem>> {
        let inner = self.lock();
        Ok(inner
            .items
            .iter()
            .filter(|item| item.has_label(label))
            .filter(|item| match query {
                LabelQuery::All => true,
                LabelQuery::Ready => {
                    item.status == ItemStatus::Open && !inner.blocked.contains(&item.id)
                }
            })
            .cloned()
            .collect())
    }
}
