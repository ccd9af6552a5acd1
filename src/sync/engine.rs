//! The sync engine.
//!
//! Drains the durable queue against the farm API in batches. Each item gets one
//! remote call per cycle; failures bump `attempts` and the item either stays
//! queued for the next cycle or, at the retry ceiling, moves to the failed list.
//!
//! Cycles are started by:
//! - the periodic background timer (while online),
//! - a transition to online (after `reconnect_delay`),
//! - a fresh enqueue (after `enqueue_sync_delay`),
//! - [`SyncEngine::force_sync`] / [`SyncEngine::retry_failed_items`].
//!
//! At most one cycle runs at a time; overlapping triggers return immediately.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::backup::{BackupSettings, SyncBackup};
use super::conflict::resolve_conflict;
use super::connectivity::Connectivity;
use super::error::{SyncError, TransportError};
use super::events::{Notifier, SyncEvent};
use super::store::QueueStore;
use super::transport::{SyncRequest, Transport};
use crate::models::{LocalChange, SyncItem, SyncMetadata};

/// Tunables for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_base_url: String,
    pub batch_size: usize,
    pub max_retries: u32,
    pub sync_interval: Duration,
    pub item_delay: Duration,
    pub batch_delay: Duration,
    pub reconnect_delay: Duration,
    /// Delay before syncing a freshly queued item. `None` disables it.
    pub enqueue_sync_delay: Option<Duration>,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.example.com".to_string(),
            batch_size: 10,
            max_retries: 3,
            sync_interval: Duration::from_secs(30),
            item_delay: Duration::from_millis(200),
            batch_delay: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            enqueue_sync_delay: Some(Duration::from_secs(1)),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Who is making the changes.
#[derive(Debug, Clone, Default)]
pub struct EngineIdentity {
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
    /// When unset, a device id is generated once and kept in the store.
    pub device_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ResolvedIdentity {
    auth_token: Option<String>,
    user_id: Option<String>,
    device_id: String,
}

/// Outcome of one full pass over the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub successful: usize,
    pub failed: usize,
    /// Items settled by discarding the local version. Included in `successful`.
    pub conflicts: usize,
    pub total: usize,
    /// Item count of each batch, in processing order.
    pub batch_sizes: Vec<usize>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub queue_size: usize,
    pub failed_items: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryReport {
    pub retried: usize,
    pub summary: Option<SyncSummary>,
}

#[derive(Debug, Default)]
struct Tally {
    successful: usize,
    failed: usize,
    conflicts: usize,
}

/// Clears the in-progress flag when the cycle ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct EngineInner<S, T> {
    store: S,
    transport: T,
    config: RwLock<EngineConfig>,
    identity: RwLock<ResolvedIdentity>,
    notifier: Notifier,
    connectivity: Connectivity,
    syncing: AtomicBool,
    background: Mutex<Option<JoinHandle<()>>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the sync engine. Clones share the same queue and state.
pub struct SyncEngine<S, T> {
    inner: Arc<EngineInner<S, T>>,
}

impl<S, T> Clone for SyncEngine<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: QueueStore, T: Transport> SyncEngine<S, T> {
    /// Creates an engine over an existing store. No background work starts
    /// until [`SyncEngine::start`].
    pub async fn new(
        store: S,
        transport: T,
        config: EngineConfig,
        connectivity: Connectivity,
        identity: EngineIdentity,
    ) -> Result<Self, SyncError> {
        let device_id = match identity.device_id {
            Some(id) => id,
            None => {
                let candidate = format!("device_{}", Uuid::new_v4().simple());
                store.device_id_or_insert(&candidate).await?
            }
        };

        let pending = store.count().await?;
        tracing::info!(
            "Sync engine ready: {} pending item(s), device {}",
            pending,
            device_id
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                transport,
                config: RwLock::new(config),
                identity: RwLock::new(ResolvedIdentity {
                    auth_token: identity.auth_token,
                    user_id: identity.user_id,
                    device_id,
                }),
                notifier: Notifier::default(),
                connectivity,
                syncing: AtomicBool::new(false),
                background: Mutex::new(None),
                observer: Mutex::new(None),
            }),
        })
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    pub async fn config(&self) -> EngineConfig {
        self.inner.config.read().await.clone()
    }

    pub async fn device_id(&self) -> String {
        self.inner.identity.read().await.device_id.clone()
    }

    pub async fn set_auth_token(&self, token: Option<String>) {
        self.inner.identity.write().await.auth_token = token;
    }

    pub async fn set_user_id(&self, user_id: Option<String>) {
        self.inner.identity.write().await.user_id = user_id;
    }

    /// Starts the connectivity observer and, if online, the background timer
    /// plus an initial sync after `reconnect_delay`.
    pub async fn start(&self) {
        self.watch_connectivity().await;
        if self.is_online() {
            self.start_background_sync().await;
            let delay = self.inner.config.read().await.reconnect_delay;
            self.schedule_sync(delay);
        }
    }

    /// Stops every background task. In-flight cycles run to completion.
    pub async fn shutdown(&self) {
        self.stop_background_sync().await;
        if let Some(handle) = self.inner.observer.lock().await.take() {
            handle.abort();
        }
    }

    /// Records a local mutation and persists it.
    pub async fn queue_for_sync(&self, change: LocalChange) -> Result<SyncItem, SyncError> {
        let metadata = {
            let identity = self.inner.identity.read().await;
            SyncMetadata::new(identity.user_id.clone(), identity.device_id.clone())
        };
        let item = SyncItem::new(change, metadata);

        if let Err(e) = self.inner.store.enqueue(&item).await {
            tracing::error!("Failed to persist sync item {}: {}", item.id, e);
            return Err(e.into());
        }

        // the item is stored; a failed count only degrades the event
        let queue_size = match self.inner.store.count().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Failed to count sync queue: {}", e);
                1
            }
        };
        self.inner.notifier.notify(SyncEvent::Queued {
            item: item.clone(),
            queue_size,
        });
        tracing::info!("Queued item for sync: {} ({})", item.id, item.entity);

        if self.is_online() && !self.is_syncing() {
            if let Some(delay) = self.inner.config.read().await.enqueue_sync_delay {
                self.schedule_sync(delay);
            }
        }

        Ok(item)
    }

    /// Runs one full pass over the queue.
    ///
    /// Returns `Ok(None)` without side effects when offline, when another cycle
    /// is running, or when the queue is empty.
    pub async fn attempt_sync(&self) -> Result<Option<SyncSummary>, SyncError> {
        let inner = &self.inner;

        if !inner.connectivity.is_online() {
            tracing::debug!("Offline, skipping sync");
            return Ok(None);
        }
        if inner
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync already in progress");
            return Ok(None);
        }
        let _guard = SyncingGuard(&inner.syncing);

        let queue = inner.store.list().await.map_err(|e| {
            tracing::error!("Failed to load sync queue: {}", e);
            e
        })?;
        if queue.is_empty() {
            return Ok(None);
        }

        let config = inner.config.read().await.clone();
        let token = inner.identity.read().await.auth_token.clone();
        let started_at = Utc::now();
        if let Err(e) = inner.store.set_last_sync_time(started_at).await {
            tracing::warn!("Failed to record last sync time: {}", e);
        }

        inner.notifier.notify(SyncEvent::Started {
            queue_size: queue.len(),
        });
        tracing::info!("Starting sync of {} items...", queue.len());

        let mut tally = Tally::default();
        let mut batch_sizes = Vec::new();
        for (index, batch) in queue.chunks(config.batch_size.max(1)).enumerate() {
            if index > 0 && !config.batch_delay.is_zero() {
                tokio::time::sleep(config.batch_delay).await;
            }
            tracing::debug!("Syncing batch {} ({} items)", index + 1, batch.len());
            for item in batch {
                self.sync_item(item.clone(), &config, token.clone(), &mut tally)
                    .await;
                if !config.item_delay.is_zero() {
                    tokio::time::sleep(config.item_delay).await;
                }
            }
            batch_sizes.push(batch.len());
        }

        let summary = SyncSummary {
            successful: tally.successful,
            failed: tally.failed,
            conflicts: tally.conflicts,
            total: tally.successful + tally.failed,
            batch_sizes,
            timestamp: started_at,
        };

        inner.notifier.notify(SyncEvent::Completed {
            successful: summary.successful,
            failed: summary.failed,
            total: summary.total,
            timestamp: summary.timestamp,
        });
        tracing::info!(
            "Sync completed: {} successful, {} failed",
            summary.successful,
            summary.failed
        );

        Ok(Some(summary))
    }

    async fn sync_item(
        &self,
        mut item: SyncItem,
        config: &EngineConfig,
        token: Option<String>,
        tally: &mut Tally,
    ) {
        let inner = &self.inner;
        let request = SyncRequest::for_item(&item, &config.api_base_url, token);

        let result = match tokio::time::timeout(
            config.request_timeout,
            inner.transport.send(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(config.request_timeout)),
        };

        match result {
            Ok(_) => {
                item.synced = true;
                if let Err(e) = inner.store.remove(&item.id).await {
                    tracing::error!("Synced item {} could not be removed: {}", item.id, e);
                }
                tracing::debug!("Synced {} ({} {})", item.id, item.action, item.entity);
                tally.successful += 1;
                inner.notifier.notify(SyncEvent::ItemSynced { item });
            }
            Err(TransportError::Conflict { url, server }) => {
                let resolution = resolve_conflict(&item, server);
                tracing::warn!(
                    "Conflict on {} for {}, keeping server version ({})",
                    url,
                    item.id,
                    resolution.resolution
                );
                item.synced = true;
                if let Err(e) = inner.store.remove(&item.id).await {
                    tracing::error!("Conflicted item {} could not be removed: {}", item.id, e);
                }
                tally.successful += 1;
                tally.conflicts += 1;
                inner.notifier.notify(SyncEvent::ItemSynced { item });
            }
            Err(e) => {
                let error = e.to_string();
                let patch = item.record_failure(error.clone(), Utc::now());
                tally.failed += 1;

                if item.has_reached(config.max_retries) {
                    if let Err(e) = inner.store.mark_failed(&item.id, &patch).await {
                        tracing::error!("Failed to retire sync item {}: {}", item.id, e);
                    }
                    tracing::warn!(
                        "Giving up on {} after {} attempts: {}",
                        item.id,
                        item.attempts,
                        error
                    );
                    inner
                        .notifier
                        .notify(SyncEvent::ItemFailed { item, error });
                } else {
                    if let Err(e) = inner.store.update(&item.id, &patch).await {
                        tracing::error!("Failed to record attempt for {}: {}", item.id, e);
                    }
                    tracing::warn!(
                        "Failed to sync {} (attempt {}/{}): {}",
                        item.id,
                        item.attempts,
                        config.max_retries,
                        error
                    );
                }
            }
        }
    }

    /// Manual trigger. Still a no-op while a cycle is running.
    pub async fn force_sync(&self) -> Result<Option<SyncSummary>, SyncError> {
        if self.is_syncing() {
            tracing::info!("Sync already in progress");
            return Ok(None);
        }
        tracing::info!("Force syncing...");
        self.attempt_sync().await
    }

    /// Puts every failed item back in the queue, attempts preserved, then syncs
    /// if online.
    pub async fn retry_failed_items(&self) -> Result<RetryReport, SyncError> {
        let retried = self.inner.store.requeue_failed().await?;
        if retried == 0 {
            return Ok(RetryReport {
                retried,
                summary: None,
            });
        }

        tracing::info!("Requeued {} failed item(s)", retried);
        let summary = if self.is_online() {
            self.attempt_sync().await?
        } else {
            None
        };

        Ok(RetryReport { retried, summary })
    }

    pub async fn clear_failed_items(&self) -> Result<usize, SyncError> {
        let count = self.inner.store.clear_failed().await?;
        if count > 0 {
            tracing::info!("Dismissed {} failed item(s)", count);
        }
        Ok(count)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            is_syncing: self.is_syncing(),
            queue_size: self.inner.store.count().await?,
            failed_items: self.inner.store.count_failed().await?,
            last_sync_time: self.inner.store.last_sync_time().await?,
            is_online: self.is_online(),
        })
    }

    /// (Re)starts the periodic timer.
    pub async fn start_background_sync(&self) {
        let interval = self.inner.config.read().await.sync_interval;
        let mut slot = self.inner.background.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }

        let engine = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !engine.is_online() || engine.is_syncing() {
                    continue;
                }
                match engine.inner.store.count().await {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Background sync could not read the queue: {}", e);
                        continue;
                    }
                }
                // Run the cycle on its own task so stopping the timer never
                // interrupts it.
                engine.schedule_sync(Duration::ZERO);
            }
        }));
        tracing::debug!("Background sync every {:?}", interval);
    }

    pub async fn stop_background_sync(&self) {
        if let Some(handle) = self.inner.background.lock().await.take() {
            handle.abort();
            tracing::debug!("Background sync stopped");
        }
    }

    pub async fn is_background_sync_running(&self) -> bool {
        self.inner
            .background
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Spawns the task that reacts to online/offline transitions.
    pub async fn watch_connectivity(&self) {
        let mut rx = self.inner.connectivity.subscribe();
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online {
                    tracing::info!("Device online, attempting sync...");
                    engine.start_background_sync().await;
                    let delay = engine.inner.config.read().await.reconnect_delay;
                    engine.schedule_sync(delay);
                } else {
                    tracing::info!("Device offline, pausing sync...");
                    engine.stop_background_sync().await;
                }
            }
        });

        if let Some(old) = self.inner.observer.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Runs `attempt_sync` on a new task after `delay`.
    pub fn schedule_sync(&self, delay: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = engine.attempt_sync().await {
                tracing::error!("Sync cycle failed: {}", e);
            }
        })
    }

    pub async fn export_backup(&self) -> Result<SyncBackup, SyncError> {
        let config = self.inner.config.read().await.clone();
        Ok(SyncBackup::new(
            self.inner.store.list().await?,
            self.inner.store.list_failed().await?,
            self.inner.store.last_sync_time().await?,
            BackupSettings {
                sync_interval: Some(config.sync_interval.as_millis() as u64),
                max_retries: Some(config.max_retries),
                batch_size: Some(config.batch_size),
            },
        ))
    }

    /// Replaces the queue and failed list with the backup's contents.
    pub async fn restore_backup(&self, mut backup: SyncBackup) -> Result<(), SyncError> {
        let retired = backup.drop_retired_from_queue();
        if retired > 0 {
            tracing::debug!("Dropped {} queue entries already in the failed list", retired);
        }
        backup.validate()?;

        self.inner
            .store
            .replace_all(&backup.sync_queue, &backup.failed_items)
            .await?;
        if let Some(at) = backup.last_sync_time {
            self.inner.store.set_last_sync_time(at).await?;
        }

        let mut interval_changed = false;
        if let Some(settings) = &backup.settings {
            let mut config = self.inner.config.write().await;
            if let Some(ms) = settings.sync_interval.filter(|ms| *ms > 0) {
                let interval = Duration::from_millis(ms);
                interval_changed = interval != config.sync_interval;
                config.sync_interval = interval;
            }
            if let Some(max_retries) = settings.max_retries.filter(|n| *n > 0) {
                config.max_retries = max_retries;
            }
            if let Some(batch_size) = settings.batch_size.filter(|n| *n > 0) {
                config.batch_size = batch_size;
            }
        }

        if interval_changed && self.is_background_sync_running().await {
            self.start_background_sync().await;
        }

        tracing::info!(
            "Sync backup restored: {} queued, {} failed",
            backup.sync_queue.len(),
            backup.failed_items.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncAction, SyncItemPatch};
    use crate::sync::{MemoryQueueStore, StoreError, SyncResponse};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast::error::TryRecvError;

    /// Transport that replays scripted results, then falls back to a default.
    struct StubTransport {
        script: std::sync::Mutex<VecDeque<Result<SyncResponse, TransportError>>>,
        fallback: Result<SyncResponse, TransportError>,
        delay: Duration,
        calls: AtomicUsize,
        requests: std::sync::Mutex<Vec<SyncRequest>>,
    }

    impl StubTransport {
        fn succeeding() -> Self {
            Self::with_fallback(Ok(SyncResponse {
                success: true,
                ..Default::default()
            }))
        }

        fn failing() -> Self {
            Self::with_fallback(Err(TransportError::Status {
                status: 500,
                reason: "Internal Server Error".to_string(),
            }))
        }

        fn with_fallback(fallback: Result<SyncResponse, TransportError>) -> Self {
            Self {
                script: std::sync::Mutex::new(VecDeque::new()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                requests: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn then(self, result: Result<SyncResponse, TransportError>) -> Self {
            self.script.lock().unwrap().push_back(result);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl Transport for Arc<StubTransport> {
        async fn send(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn server_error() -> Result<SyncResponse, TransportError> {
        Err(TransportError::Network("connection refused".to_string()))
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            api_base_url: "http://farm.test".to_string(),
            item_delay: Duration::ZERO,
            batch_delay: Duration::ZERO,
            reconnect_delay: Duration::from_millis(10),
            enqueue_sync_delay: None,
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    async fn engine_with(
        transport: Arc<StubTransport>,
        config: EngineConfig,
        online: bool,
    ) -> SyncEngine<MemoryQueueStore, Arc<StubTransport>> {
        SyncEngine::new(
            MemoryQueueStore::new(),
            transport,
            config,
            Connectivity::new(online),
            EngineIdentity {
                auth_token: Some("token-1".to_string()),
                user_id: Some("farmer-1".to_string()),
                device_id: None,
            },
        )
        .await
        .unwrap()
    }

    /// Memory store whose reads and writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryQueueStore,
        fail_list: AtomicBool,
        fail_count: AtomicBool,
        fail_writes: AtomicBool,
    }

    fn disk_error() -> StoreError {
        StoreError::Io(std::io::Error::other("disk unavailable"))
    }

    impl FlakyStore {
        fn check(&self, flag: &AtomicBool) -> Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                Err(disk_error())
            } else {
                Ok(())
            }
        }
    }

    impl QueueStore for FlakyStore {
        async fn enqueue(&self, item: &SyncItem) -> Result<String, StoreError> {
            self.inner.enqueue(item).await
        }

        async fn list(&self) -> Result<Vec<SyncItem>, StoreError> {
            self.check(&self.fail_list)?;
            self.inner.list().await
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.check(&self.fail_count)?;
            self.inner.count().await
        }

        async fn remove(&self, id: &str) -> Result<(), StoreError> {
            self.inner.remove(id).await
        }

        async fn update(&self, id: &str, patch: &SyncItemPatch) -> Result<(), StoreError> {
            self.check(&self.fail_writes)?;
            self.inner.update(id, patch).await
        }

        async fn mark_failed(&self, id: &str, patch: &SyncItemPatch) -> Result<(), StoreError> {
            self.check(&self.fail_writes)?;
            self.inner.mark_failed(id, patch).await
        }

        async fn list_failed(&self) -> Result<Vec<SyncItem>, StoreError> {
            self.inner.list_failed().await
        }

        async fn count_failed(&self) -> Result<usize, StoreError> {
            self.inner.count_failed().await
        }

        async fn requeue_failed(&self) -> Result<usize, StoreError> {
            self.inner.requeue_failed().await
        }

        async fn clear_failed(&self) -> Result<usize, StoreError> {
            self.inner.clear_failed().await
        }

        async fn replace_all(
            &self,
            queue: &[SyncItem],
            failed: &[SyncItem],
        ) -> Result<(), StoreError> {
            self.inner.replace_all(queue, failed).await
        }

        async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.last_sync_time().await
        }

        async fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.set_last_sync_time(at).await
        }

        async fn device_id_or_insert(&self, candidate: &str) -> Result<String, StoreError> {
            self.inner.device_id_or_insert(candidate).await
        }
    }

    async fn flaky_engine(
        transport: Arc<StubTransport>,
        config: EngineConfig,
    ) -> SyncEngine<FlakyStore, Arc<StubTransport>> {
        SyncEngine::new(
            FlakyStore::default(),
            transport,
            config,
            Connectivity::new(true),
            EngineIdentity::default(),
        )
        .await
        .unwrap()
    }

    fn egg_change(n: u32) -> LocalChange {
        LocalChange::new("egg_record", SyncAction::Create, json!({"flockId": "f-1", "count": n}))
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for_completed(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.name() == "completed" {
                    return event;
                }
            }
        })
        .await
        .expect("no completed event")
    }

    #[tokio::test]
    async fn test_offline_items_drain_after_reconnect() {
        let transport = Arc::new(StubTransport::succeeding());
        let engine = engine_with(transport.clone(), fast_config(), false).await;
        let mut rx = engine.subscribe();

        for n in 0..5 {
            engine.queue_for_sync(egg_change(n)).await.unwrap();
        }
        assert!(engine.attempt_sync().await.unwrap().is_none());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        engine.connectivity().set_online(true);
        let summary = engine.attempt_sync().await.unwrap().unwrap();

        assert_eq!(summary.successful, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.total, 5);
        assert!(engine.store().list().await.unwrap().is_empty());

        let synced: Vec<SyncItem> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::ItemSynced { item } => Some(item),
                _ => None,
            })
            .collect();
        assert_eq!(synced.len(), 5);
        assert!(synced.iter().all(|i| i.synced));
    }

    #[tokio::test]
    async fn test_always_failing_item_retires_after_max_retries() {
        let transport = Arc::new(StubTransport::failing());
        let engine = engine_with(transport.clone(), fast_config(), true).await;
        let mut rx = engine.subscribe();

        let item = engine.queue_for_sync(egg_change(1)).await.unwrap();

        for cycle in 1..=3 {
            let summary = engine.attempt_sync().await.unwrap().unwrap();
            assert_eq!(summary.failed, 1, "cycle {}", cycle);
        }

        assert!(engine.store().list().await.unwrap().is_empty());
        let failed = engine.store().list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, item.id);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(
            failed[0].last_error.as_deref(),
            Some("HTTP 500: Internal Server Error")
        );

        let failed_events: Vec<SyncEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.name() == "item-failed")
            .collect();
        assert_eq!(failed_events.len(), 1);

        // no longer part of any batch
        assert!(engine.attempt_sync().await.unwrap().is_none());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_run_one_pass() {
        let transport = Arc::new(StubTransport::succeeding().with_delay(Duration::from_millis(20)));
        let engine = engine_with(transport.clone(), fast_config(), true).await;
        for n in 0..3 {
            engine.queue_for_sync(egg_change(n)).await.unwrap();
        }

        let (a, b) = tokio::join!(engine.attempt_sync(), engine.attempt_sync());
        let ran: Vec<SyncSummary> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();

        assert_eq!(ran.len(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_retry_failed_items_preserves_attempts() {
        let transport = Arc::new(
            StubTransport::succeeding()
                .then(server_error())
                .then(server_error())
                .then(server_error()),
        );
        let engine = engine_with(transport.clone(), fast_config(), true).await;
        engine.queue_for_sync(egg_change(1)).await.unwrap();

        for _ in 0..3 {
            engine.attempt_sync().await.unwrap();
        }
        assert_eq!(engine.store().count_failed().await.unwrap(), 1);

        engine.connectivity().set_online(false);
        let report = engine.retry_failed_items().await.unwrap();
        assert_eq!(report.retried, 1);
        assert!(report.summary.is_none());

        let queued = engine.store().list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 3);
        assert_eq!(engine.store().count_failed().await.unwrap(), 0);

        engine.connectivity().set_online(true);
        let summary = engine.attempt_sync().await.unwrap().unwrap();
        assert_eq!(summary.successful, 1);
        assert!(engine.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_items_syncs_when_online() {
        let transport = Arc::new(
            StubTransport::succeeding()
                .then(server_error())
                .then(server_error())
                .then(server_error()),
        );
        let engine = engine_with(transport, fast_config(), true).await;
        engine.queue_for_sync(egg_change(1)).await.unwrap();
        for _ in 0..3 {
            engine.attempt_sync().await.unwrap();
        }

        let report = engine.retry_failed_items().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.summary.unwrap().successful, 1);

        let empty = engine.retry_failed_items().await.unwrap();
        assert_eq!(empty.retried, 0);
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_noop() {
        let transport = Arc::new(StubTransport::succeeding());
        let engine = engine_with(transport.clone(), fast_config(), true).await;
        let mut rx = engine.subscribe();

        assert!(engine.attempt_sync().await.unwrap().is_none());
        assert!(engine.attempt_sync().await.unwrap().is_none());

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_twelve_items_run_in_two_batches() {
        let transport = Arc::new(StubTransport::succeeding());
        let engine = engine_with(transport.clone(), fast_config(), true).await;
        let mut rx = engine.subscribe();

        let mut queued = Vec::new();
        for n in 0..12 {
            queued.push(engine.queue_for_sync(egg_change(n)).await.unwrap().id);
        }
        let summary = engine.attempt_sync().await.unwrap().unwrap();

        assert_eq!(summary.batch_sizes, vec![10, 2]);
        assert_eq!(summary.total, 12);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 12);

        // first batch is the oldest ten, the last two follow
        let sent: Vec<String> = transport
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.item_id.clone())
            .collect();
        assert_eq!(sent, queued);

        let events = drain(&mut rx);
        match events.last() {
            Some(SyncEvent::Completed {
                successful, total, ..
            }) => {
                assert_eq!(*successful, 12);
                assert_eq!(*total, 12);
            }
            other => panic!("expected completed, got {:?}", other),
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::Started { queue_size: 12 })));
    }

    #[tokio::test]
    async fn test_item_succeeds_on_third_attempt() {
        let transport = Arc::new(
            StubTransport::succeeding()
                .then(server_error())
                .then(server_error()),
        );
        let engine = engine_with(transport, fast_config(), true).await;
        let mut rx = engine.subscribe();
        engine.queue_for_sync(egg_change(1)).await.unwrap();

        engine.attempt_sync().await.unwrap();
        engine.attempt_sync().await.unwrap();
        assert_eq!(engine.store().list().await.unwrap()[0].attempts, 2);
        engine.attempt_sync().await.unwrap();

        let synced = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                SyncEvent::ItemSynced { item } => Some(item),
                _ => None,
            })
            .unwrap();
        assert!(synced.synced);
        assert_eq!(synced.attempts, 2);
        assert!(engine.store().list().await.unwrap().is_empty());
        assert_eq!(engine.store().count_failed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_in_batch_does_not_stop_other_items() {
        let transport = Arc::new(
            StubTransport::succeeding()
                .then(Ok(SyncResponse::default()))
                .then(server_error()),
        );
        let engine = engine_with(transport.clone(), fast_config(), true).await;
        for n in 0..3 {
            engine.queue_for_sync(egg_change(n)).await.unwrap();
        }

        let summary = engine.attempt_sync().await.unwrap().unwrap();
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);

        let remaining = engine.store().list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload["count"], 1);
        assert_eq!(remaining[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_conflict_discards_local_version() {
        let transport = Arc::new(StubTransport::succeeding().then(Err(
            TransportError::Conflict {
                url: "http://farm.test/api/dairy/cows".to_string(),
                server: Some(json!({"id": "cow-1", "name": "Daisy"})),
            },
        )));
        let engine = engine_with(transport, fast_config(), true).await;
        engine
            .queue_for_sync(LocalChange::new(
                "dairy_cow",
                SyncAction::Update,
                json!({"id": "cow-1", "name": "Bessie"}),
            ))
            .await
            .unwrap();

        let summary = engine.attempt_sync().await.unwrap().unwrap();
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.successful, 1);
        assert!(engine.store().list().await.unwrap().is_empty());
        assert_eq!(engine.store().count_failed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout_counts_as_failure() {
        let transport =
            Arc::new(StubTransport::succeeding().with_delay(Duration::from_millis(500)));
        let config = EngineConfig {
            request_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        let engine = engine_with(transport, config, true).await;
        engine.queue_for_sync(egg_change(1)).await.unwrap();

        let summary = engine.attempt_sync().await.unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        let item = &engine.store().list().await.unwrap()[0];
        assert!(item.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_requests_carry_token_and_metadata() {
        let transport = Arc::new(StubTransport::succeeding());
        let engine = engine_with(transport.clone(), fast_config(), true).await;
        let mut rx = engine.subscribe();

        let item = engine.queue_for_sync(egg_change(7)).await.unwrap();
        assert_eq!(item.metadata.user_id.as_deref(), Some("farmer-1"));
        assert_eq!(item.metadata.device_id, engine.device_id().await);
        assert!(item.metadata.device_id.starts_with("device_"));

        match rx.try_recv().unwrap() {
            SyncEvent::Queued { item: queued, queue_size } => {
                assert_eq!(queued.id, item.id);
                assert_eq!(queue_size, 1);
            }
            other => panic!("expected queued, got {:?}", other),
        }

        engine.set_auth_token(Some("token-2".to_string())).await;
        engine.attempt_sync().await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].bearer_token.as_deref(), Some("token-2"));
        assert_eq!(requests[0].url, "http://farm.test/api/poultry/egg-records");
    }

    #[tokio::test]
    async fn test_enqueue_schedules_sync_when_online() {
        let transport = Arc::new(StubTransport::succeeding());
        let config = EngineConfig {
            enqueue_sync_delay: Some(Duration::from_millis(10)),
            ..fast_config()
        };
        let engine = engine_with(transport, config, true).await;
        let mut rx = engine.subscribe();

        engine.queue_for_sync(egg_change(1)).await.unwrap();

        match wait_for_completed(&mut rx).await {
            SyncEvent::Completed { successful, .. } => assert_eq!(successful, 1),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_reconnect_triggers_sync_and_offline_stops_timer() {
        let transport = Arc::new(StubTransport::succeeding());
        let engine = engine_with(transport, fast_config(), false).await;
        let mut rx = engine.subscribe();
        engine.start().await;
        assert!(!engine.is_background_sync_running().await);

        engine.queue_for_sync(egg_change(1)).await.unwrap();
        engine.connectivity().set_online(true);

        wait_for_completed(&mut rx).await;
        assert!(engine.store().list().await.unwrap().is_empty());
        assert!(engine.is_background_sync_running().await);

        engine.connectivity().set_online(false);
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.is_background_sync_running().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_timer_drains_queue() {
        let transport = Arc::new(StubTransport::succeeding());
        let config = EngineConfig {
            sync_interval: Duration::from_millis(30),
            ..fast_config()
        };
        let engine = engine_with(transport, config, true).await;
        let mut rx = engine.subscribe();

        engine.queue_for_sync(egg_change(1)).await.unwrap();
        engine.start_background_sync().await;

        wait_for_completed(&mut rx).await;
        assert!(engine.store().list().await.unwrap().is_empty());

        engine.stop_background_sync().await;
        assert!(!engine.is_background_sync_running().await);
    }

    #[tokio::test]
    async fn test_status() {
        let transport = Arc::new(StubTransport::failing());
        let config = EngineConfig {
            max_retries: 1,
            ..fast_config()
        };
        let engine = engine_with(transport, config, true).await;

        let status = engine.status().await.unwrap();
        assert_eq!(status.queue_size, 0);
        assert!(status.last_sync_time.is_none());
        assert!(status.is_online);

        engine.queue_for_sync(egg_change(1)).await.unwrap();
        engine.queue_for_sync(egg_change(2)).await.unwrap();
        engine.attempt_sync().await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.failed_items, 2);
        assert!(status.last_sync_time.is_some());
        assert!(!status.is_syncing);

        assert_eq!(engine.clear_failed_items().await.unwrap(), 2);
        assert_eq!(engine.status().await.unwrap().failed_items, 0);
    }

    #[tokio::test]
    async fn test_backup_round_trip_restores_queue_and_settings() {
        let transport = Arc::new(StubTransport::failing());
        let config = EngineConfig {
            max_retries: 1,
            ..fast_config()
        };
        let source = engine_with(transport, config, true).await;
        source.queue_for_sync(egg_change(1)).await.unwrap();
        source.attempt_sync().await.unwrap();
        source.queue_for_sync(egg_change(2)).await.unwrap();

        let json = source.export_backup().await.unwrap().to_json_pretty().unwrap();

        let target = engine_with(Arc::new(StubTransport::succeeding()), fast_config(), false).await;
        target
            .restore_backup(SyncBackup::from_json(&json).unwrap())
            .await
            .unwrap();

        assert_eq!(target.store().list().await.unwrap().len(), 1);
        assert_eq!(target.store().list_failed().await.unwrap().len(), 1);
        assert!(target.status().await.unwrap().last_sync_time.is_some());
        assert_eq!(target.config().await.max_retries, 1);
    }

    #[tokio::test]
    async fn test_force_sync() {
        let transport = Arc::new(StubTransport::succeeding());
        let engine = engine_with(transport, fast_config(), true).await;
        engine.queue_for_sync(egg_change(1)).await.unwrap();

        let summary = engine.force_sync().await.unwrap().unwrap();
        assert_eq!(summary.successful, 1);
        assert!(engine.force_sync().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_read_failure_releases_sync_flag() {
        let transport = Arc::new(StubTransport::succeeding());
        let engine = flaky_engine(transport.clone(), fast_config()).await;
        engine.queue_for_sync(egg_change(1)).await.unwrap();

        engine.store().fail_list.store(true, Ordering::SeqCst);
        let err = engine.attempt_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Io(_))));
        assert!(!engine.is_syncing());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        // the engine keeps working once the store recovers
        engine.store().fail_list.store(false, Ordering::SeqCst);
        let summary = engine.attempt_sync().await.unwrap().unwrap();
        assert_eq!(summary.successful, 1);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_attempt_write_failure_does_not_abort_cycle() {
        let transport = Arc::new(StubTransport::failing());
        let engine = flaky_engine(transport.clone(), fast_config()).await;
        let mut rx = engine.subscribe();
        engine.queue_for_sync(egg_change(1)).await.unwrap();
        engine.queue_for_sync(egg_change(2)).await.unwrap();

        engine.store().fail_writes.store(true, Ordering::SeqCst);
        let summary = engine.attempt_sync().await.unwrap().unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(drain(&mut rx).iter().any(|e| e.name() == "completed"));
        // nothing was recorded, both items are still queued untouched
        let queued = engine.store().list().await.unwrap();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|i| i.attempts == 0));
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_retire_failure_keeps_item_queued() {
        let transport = Arc::new(StubTransport::failing());
        let config = EngineConfig {
            max_retries: 1,
            ..fast_config()
        };
        let engine = flaky_engine(transport, config).await;
        let mut rx = engine.subscribe();
        engine.queue_for_sync(egg_change(1)).await.unwrap();

        engine.store().fail_writes.store(true, Ordering::SeqCst);
        let summary = engine.attempt_sync().await.unwrap().unwrap();

        assert_eq!(summary.failed, 1);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.name() == "item-failed"));
        assert!(events.iter().any(|e| e.name() == "completed"));
        assert_eq!(engine.store().count().await.unwrap(), 1);
        assert_eq!(engine.store().count_failed().await.unwrap(), 0);

        // next cycle retires it for real
        engine.store().fail_writes.store(false, Ordering::SeqCst);
        engine.attempt_sync().await.unwrap();
        assert_eq!(engine.store().count_failed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_failure_after_enqueue_still_queues() {
        let transport = Arc::new(StubTransport::succeeding());
        let engine = flaky_engine(transport, fast_config()).await;
        let mut rx = engine.subscribe();

        engine.store().fail_count.store(true, Ordering::SeqCst);
        let item = engine.queue_for_sync(egg_change(1)).await.unwrap();

        match rx.try_recv().unwrap() {
            SyncEvent::Queued { item: queued, queue_size } => {
                assert_eq!(queued.id, item.id);
                assert_eq!(queue_size, 1);
            }
            other => panic!("expected queued, got {:?}", other),
        }
        assert_eq!(engine.store().list().await.unwrap()[0].id, item.id);
    }

    #[tokio::test]
    async fn test_restore_prefers_failed_copy_of_duplicated_item() {
        let engine = engine_with(Arc::new(StubTransport::succeeding()), fast_config(), false).await;
        let metadata = SyncMetadata::new(None, "device-1");
        let mut retired = SyncItem::new(egg_change(1), metadata.clone());
        retired.attempts = 3;
        let pending = SyncItem::new(egg_change(2), metadata);

        let backup = SyncBackup::new(
            vec![retired.clone(), pending.clone()],
            vec![retired.clone()],
            None,
            BackupSettings::default(),
        );
        engine.restore_backup(backup).await.unwrap();

        assert_eq!(engine.store().list().await.unwrap(), vec![pending]);
        assert_eq!(engine.store().list_failed().await.unwrap(), vec![retired]);
    }
}
