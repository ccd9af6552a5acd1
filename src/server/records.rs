//! In-memory record storage for the reference farm API.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Result of writing a record.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Stored { id: String },
    /// The server already holds a different version; carries that version.
    Conflict { current: Value },
}

/// Records keyed by resource path (`dairy/cows`) and record id.
#[derive(Debug, Default)]
pub struct RecordStore {
    resources: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new record. Creating an id that already exists is a conflict.
    pub async fn create(&self, resource: &str, mut record: Value) -> WriteOutcome {
        let id = record_id(&record).unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut resources = self.resources.write().await;
        let records = resources.entry(resource.to_string()).or_default();

        if let Some(current) = records.get(&id) {
            return WriteOutcome::Conflict {
                current: current.clone(),
            };
        }

        if let Value::Object(map) = &mut record {
            map.insert("id".to_string(), Value::String(id.clone()));
            map.insert("version".to_string(), Value::from(1));
        }
        records.insert(id.clone(), record);
        WriteOutcome::Stored { id }
    }

    /// Upserts a record. A `version` older than the stored one is a conflict.
    pub async fn update(&self, resource: &str, mut record: Value) -> Option<WriteOutcome> {
        let id = record_id(&record)?;
        let mut resources = self.resources.write().await;
        let records = resources.entry(resource.to_string()).or_default();

        let stored_version = records.get(&id).and_then(version).unwrap_or(0);
        if let Some(incoming) = version(&record) {
            if incoming < stored_version {
                let current = records.get(&id).cloned().unwrap_or(Value::Null);
                return Some(WriteOutcome::Conflict { current });
            }
        }

        if let Value::Object(map) = &mut record {
            map.insert("version".to_string(), Value::from(stored_version + 1));
            map.insert(
                "updatedAt".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        records.insert(id.clone(), record);
        Some(WriteOutcome::Stored { id })
    }

    /// Deletes a record. Deleting something already gone still succeeds.
    pub async fn delete(&self, resource: &str, record: &Value) -> Option<String> {
        let id = record_id(record)?;
        if let Some(records) = self.resources.write().await.get_mut(resource) {
            records.remove(&id);
        }
        Some(id)
    }

    pub async fn get(&self, resource: &str, id: &str) -> Option<Value> {
        self.resources
            .read()
            .await
            .get(resource)
            .and_then(|records| records.get(id).cloned())
    }
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn version(record: &Value) -> Option<u64> {
    record.get("version").and_then(Value::as_u64)
}
