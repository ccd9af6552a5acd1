//! JSON backup of the sync queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::error::SyncError;
use crate::models::SyncItem;

pub const BACKUP_TYPE: &str = "farm_sync_backup";
pub const BACKUP_VERSION: &str = "1.0";

/// Engine settings carried in a backup. `sync_interval` is in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSettings {
    #[serde(default)]
    pub sync_interval: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBackup {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub sync_queue: Vec<SyncItem>,
    #[serde(default)]
    pub failed_items: Vec<SyncItem>,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settings: Option<BackupSettings>,
}

impl SyncBackup {
    pub fn new(
        sync_queue: Vec<SyncItem>,
        failed_items: Vec<SyncItem>,
        last_sync_time: Option<DateTime<Utc>>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            kind: BACKUP_TYPE.to_string(),
            version: BACKUP_VERSION.to_string(),
            created: Utc::now(),
            sync_queue,
            failed_items,
            last_sync_time,
            settings: Some(settings),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let mut backup: SyncBackup =
            serde_json::from_str(json).map_err(|e| SyncError::InvalidBackup(e.to_string()))?;
        backup.drop_retired_from_queue();
        backup.validate()?;
        Ok(backup)
    }

    /// Removes queue entries that also sit in the failed list.
    ///
    /// Older backups keep a retired item in both lists; the failed copy wins.
    /// Returns how many entries were dropped.
    pub fn drop_retired_from_queue(&mut self) -> usize {
        let failed: HashSet<&str> = self.failed_items.iter().map(|i| i.id.as_str()).collect();
        let before = self.sync_queue.len();
        self.sync_queue.retain(|item| !failed.contains(item.id.as_str()));
        before - self.sync_queue.len()
    }

    pub fn to_json_pretty(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self).map_err(|e| SyncError::InvalidBackup(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.kind != BACKUP_TYPE {
            return Err(SyncError::InvalidBackup(format!(
                "unexpected backup type '{}'",
                self.kind
            )));
        }

        let mut seen = HashSet::new();
        for item in self.sync_queue.iter().chain(&self.failed_items) {
            if !seen.insert(item.id.as_str()) {
                return Err(SyncError::InvalidBackup(format!(
                    "item {} appears more than once",
                    item.id
                )));
            }
        }
        Ok(())
    }
}
