//! Remote calls against the farm API.
//!
//! The engine builds a [`SyncRequest`] per item and hands it to a [`Transport`].
//! [`HttpTransport`] is the real thing; tests plug in their own.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

use super::error::TransportError;
use crate::models::{SyncAction, SyncItem};

/// Resource path for each entity type. Unknown entities go to `/api/sync`.
pub fn endpoint_for_entity(entity: &str) -> &'static str {
    match entity {
        "dairy_cow" => "/api/dairy/cows",
        "poultry_flock" => "/api/poultry/flocks",
        "milk_record" => "/api/dairy/milk-records",
        "egg_record" => "/api/poultry/egg-records",
        "feed_inventory" => "/api/inventory/feed",
        "health_record" => "/api/health/records",
        "financial_record" => "/api/financial/records",
        "task" => "/api/tasks",
        _ => "/api/sync",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<SyncAction> for HttpMethod {
    fn from(action: SyncAction) -> Self {
        match action {
            SyncAction::Create => HttpMethod::Post,
            SyncAction::Update => HttpMethod::Put,
            SyncAction::Delete => HttpMethod::Delete,
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One outgoing call for one sync item.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub item_id: String,
    pub method: HttpMethod,
    pub url: String,
    pub body: Value,
    pub bearer_token: Option<String>,
}

impl SyncRequest {
    /// Maps an item to its request: create posts the payload, update puts it,
    /// delete sends only `{id}`.
    pub fn for_item(item: &SyncItem, base_url: &str, bearer_token: Option<String>) -> Self {
        let url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            endpoint_for_entity(&item.entity)
        );

        let body = match item.action {
            SyncAction::Create | SyncAction::Update => item.payload.clone(),
            SyncAction::Delete => {
                json!({ "id": item.payload.get("id").cloned().unwrap_or(Value::Null) })
            }
        };

        Self {
            item_id: item.id.clone(),
            method: item.action.into(),
            url,
            body,
            bearer_token,
        }
    }
}

/// What the farm API answers on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Sends one request to the remote endpoint.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: SyncRequest,
    ) -> impl Future<Output = Result<SyncResponse, TransportError>> + Send;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("farmsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.into(), &request.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&request.body);

        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            let server = response.json::<Value>().await.ok();
            return Err(TransportError::Conflict {
                url: request.url,
                server,
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        // Some endpoints answer 204 or a non-JSON body; that still counts as success.
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(serde_json::from_slice(&bytes).unwrap_or(SyncResponse {
            success: true,
            ..Default::default()
        }))
    }
}

/// Returns true if `GET {base}/health` answers with a 2xx within `timeout`.
pub async fn check_server(base_url: &str, timeout: Duration) -> bool {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return false,
    };

    match client.get(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            tracing::debug!("Health check against {} failed: {}", url, e);
            false
        }
    }
}
