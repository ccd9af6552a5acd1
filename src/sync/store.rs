//! The durable queue contract and an in-memory implementation of it.
//!
//! The engine only ever talks to a [`QueueStore`]. [`crate::db::QueueRepository`]
//! is the SQLite-backed store used by the binaries; [`MemoryQueueStore`] keeps
//! everything in process and is what the engine tests run against.

use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::sync::Mutex;

use super::error::StoreError;
use crate::models::{SyncItem, SyncItemPatch};

/// Storage for queued and failed sync items.
///
/// An id lives in at most one of the two lists. `list` returns queued items in
/// insertion order; items brought back by `requeue_failed` go to the tail.
pub trait QueueStore: Send + Sync + 'static {
    fn enqueue(&self, item: &SyncItem) -> impl Future<Output = Result<String, StoreError>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<SyncItem>, StoreError>> + Send;

    fn count(&self) -> impl Future<Output = Result<usize, StoreError>> + Send;

    fn remove(&self, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update(
        &self,
        id: &str,
        patch: &SyncItemPatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Applies `patch` and moves the item from the queue to the failed list.
    fn mark_failed(
        &self,
        id: &str,
        patch: &SyncItemPatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_failed(&self) -> impl Future<Output = Result<Vec<SyncItem>, StoreError>> + Send;

    fn count_failed(&self) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Moves every failed item back to the tail of the queue, attempts untouched.
    fn requeue_failed(&self) -> impl Future<Output = Result<usize, StoreError>> + Send;

    fn clear_failed(&self) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Replaces both lists wholesale.
    fn replace_all(
        &self,
        queue: &[SyncItem],
        failed: &[SyncItem],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn last_sync_time(
        &self,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, StoreError>> + Send;

    fn set_last_sync_time(
        &self,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns the stored device id, storing `candidate` first if there is none.
    fn device_id_or_insert(
        &self,
        candidate: &str,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;
}

#[derive(Debug, Default)]
struct MemoryState {
    queue: Vec<SyncItem>,
    failed: Vec<SyncItem>,
    last_sync_time: Option<DateTime<Utc>>,
    device_id: Option<String>,
}

impl MemoryState {
    fn contains(&self, id: &str) -> bool {
        self.queue.iter().any(|i| i.id == id) || self.failed.iter().any(|i| i.id == id)
    }

    fn queued_position(&self, id: &str) -> Result<usize, StoreError> {
        self.queue
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Queue store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, item: &SyncItem) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        if state.contains(&item.id) {
            return Err(StoreError::Duplicate(item.id.clone()));
        }
        state.queue.push(item.clone());
        Ok(item.id.clone())
    }

    async fn list(&self) -> Result<Vec<SyncItem>, StoreError> {
        Ok(self.state.lock().await.queue.clone())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.queue.len())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let pos = state.queued_position(id)?;
        state.queue.remove(pos);
        Ok(())
    }

    async fn update(&self, id: &str, patch: &SyncItemPatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let pos = state.queued_position(id)?;
        state.queue[pos].apply(patch);
        Ok(())
    }

    async fn mark_failed(&self, id: &str, patch: &SyncItemPatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let pos = state.queued_position(id)?;
        let mut item = state.queue.remove(pos);
        item.apply(patch);
        state.failed.push(item);
        Ok(())
    }

    async fn list_failed(&self) -> Result<Vec<SyncItem>, StoreError> {
        Ok(self.state.lock().await.failed.clone())
    }

    async fn count_failed(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.failed.len())
    }

    async fn requeue_failed(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let failed = std::mem::take(&mut state.failed);
        let count = failed.len();
        state.queue.extend(failed);
        Ok(count)
    }

    async fn clear_failed(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let count = state.failed.len();
        state.failed.clear();
        Ok(count)
    }

    async fn replace_all(&self, queue: &[SyncItem], failed: &[SyncItem]) -> Result<(), StoreError> {
        let mut next = MemoryState::default();
        for item in queue {
            if next.contains(&item.id) {
                return Err(StoreError::Duplicate(item.id.clone()));
            }
            next.queue.push(item.clone());
        }
        for item in failed {
            if next.contains(&item.id) {
                return Err(StoreError::Duplicate(item.id.clone()));
            }
            next.failed.push(item.clone());
        }

        let mut state = self.state.lock().await;
        state.queue = next.queue;
        state.failed = next.failed;
        Ok(())
    }

    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state.lock().await.last_sync_time)
    }

    async fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.state.lock().await.last_sync_time = Some(at);
        Ok(())
    }

    async fn device_id_or_insert(&self, candidate: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .device_id
            .get_or_insert_with(|| candidate.to_string())
            .clone())
    }
}
