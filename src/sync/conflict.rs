//! Conflict resolution.
//!
//! The remote farm API is authoritative. When it reports a conflict (HTTP 409)
//! for a queued mutation, the local version is discarded and whatever the
//! server holds stands. There is no merge.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::SyncItem;

/// Record of one resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub item_id: String,
    pub entity: String,
    pub resolution: &'static str,
    /// The local payload that was dropped.
    pub discarded: Value,
    /// The server's version, when it sent one back.
    pub accepted: Option<Value>,
    pub resolved_at: DateTime<Utc>,
}

pub const SERVER_WINS: &str = "server-wins";

pub fn resolve_conflict(local: &SyncItem, server: Option<Value>) -> ConflictResolution {
    ConflictResolution {
        item_id: local.id.clone(),
        entity: local.entity.clone(),
        resolution: SERVER_WINS,
        discarded: local.payload.clone(),
        accepted: server,
        resolved_at: Utc::now(),
    }
}
