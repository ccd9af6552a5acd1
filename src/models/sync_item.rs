use chrono::{DateTime, Utc};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::sync_action::SyncAction;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Attribution sent along with every mutation so the server knows who made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub user_id: Option<String>,
    pub device_id: String,
    pub app_version: String,
}

impl SyncMetadata {
    pub fn new(user_id: Option<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id,
            device_id: device_id.into(),
            app_version: APP_VERSION.to_string(),
        }
    }
}

/// A local mutation as reported by the record-keeping side, before it is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
    #[serde(default = "default_entity")]
    pub entity: String,
    #[serde(default)]
    pub action: SyncAction,
    #[serde(default, alias = "data")]
    pub payload: Value,
}

fn default_entity() -> String {
    "unknown".to_string()
}

impl LocalChange {
    pub fn new(entity: impl Into<String>, action: SyncAction, payload: Value) -> Self {
        Self {
            entity: entity.into(),
            action,
            payload,
        }
    }
}

/// One pending mutation in the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub id: String,
    pub entity: String,
    pub action: SyncAction,
    #[serde(alias = "data")]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    pub metadata: SyncMetadata,
}

impl SyncItem {
    pub fn new(change: LocalChange, metadata: SyncMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: generate_item_id(now),
            entity: change.entity,
            action: change.action,
            payload: change.payload,
            timestamp: now,
            attempts: 0,
            synced: false,
            last_error: None,
            last_attempt: None,
            metadata,
        }
    }

    /// Counts a failed attempt and returns the patch to persist.
    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> SyncItemPatch {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.last_attempt = Some(at);

        SyncItemPatch {
            attempts: Some(self.attempts),
            last_error: self.last_error.clone(),
            last_attempt: self.last_attempt,
            payload: None,
        }
    }

    pub fn has_reached(&self, max_retries: u32) -> bool {
        self.attempts >= max_retries
    }

    pub fn apply(&mut self, patch: &SyncItemPatch) {
        if let Some(attempts) = patch.attempts {
            // attempts only ever move forward
            self.attempts = self.attempts.max(attempts);
        }
        if let Some(error) = &patch.last_error {
            self.last_error = Some(error.clone());
        }
        if let Some(at) = patch.last_attempt {
            self.last_attempt = Some(at);
        }
        if let Some(payload) = &patch.payload {
            self.payload = payload.clone();
        }
    }
}

impl fmt::Display for SyncItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (attempts: {})",
            self.id, self.action, self.entity, self.attempts
        )?;
        if let Some(error) = &self.last_error {
            write!(f, " last error: {}", error)?;
        }
        Ok(())
    }
}

/// Partial update for a stored item. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncItemPatch {
    pub attempts: Option<u32>,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub payload: Option<Value>,
}

/// `sync_{unix_millis}_{9 random chars}`
pub fn generate_item_id(now: DateTime<Utc>) -> String {
    let suffix = Alphanumeric
        .sample_string(&mut rand::rng(), 9)
        .to_lowercase();
    format!("sync_{}_{}", now.timestamp_millis(), suffix)
}
