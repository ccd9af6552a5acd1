//! Offline-first sync queue.
//!
//! Local mutations are recorded as [`SyncItem`](crate::models::SyncItem)s in a
//! durable [`QueueStore`] and replayed against the farm API by the
//! [`SyncEngine`] whenever the device is online.
//!
//! # Usage
//!
//! ```no_run
//! use farmsync::models::{LocalChange, SyncAction};
//! use farmsync::sync::{
//!     Connectivity, EngineConfig, EngineIdentity, HttpTransport, MemoryQueueStore, SyncEngine,
//! };
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::new(
//!     MemoryQueueStore::new(),
//!     HttpTransport::new(Duration::from_secs(30))?,
//!     EngineConfig::default(),
//!     Connectivity::default(),
//!     EngineIdentity::default(),
//! )
//! .await?;
//!
//! engine
//!     .queue_for_sync(LocalChange::new(
//!         "egg_record",
//!         SyncAction::Create,
//!         serde_json::json!({"flockId": "f-1", "count": 212}),
//!     ))
//!     .await?;
//! engine.force_sync().await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod store;
pub mod transport;

pub use backup::{BackupSettings, SyncBackup, BACKUP_TYPE, BACKUP_VERSION};
pub use conflict::{resolve_conflict, ConflictResolution, SERVER_WINS};
pub use connectivity::{spawn_health_probe, Connectivity};
pub use engine::{EngineConfig, EngineIdentity, RetryReport, SyncEngine, SyncStatus, SyncSummary};
pub use error::{StoreError, SyncError, TransportError};
pub use events::{Notifier, SyncEvent};
pub use store::{MemoryQueueStore, QueueStore};
pub use transport::{
    check_server, endpoint_for_entity, HttpMethod, HttpTransport, SyncRequest, SyncResponse,
    Transport,
};
