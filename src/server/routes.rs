//! HTTP surface of the reference farm API.
//!
//! - `GET /health`: health check (no auth required)
//! - `POST /api/{*resource}`: create a record
//! - `PUT /api/{*resource}`: update a record (body must carry `id`)
//! - `DELETE /api/{*resource}`: delete a record (body `{id}`)
//!
//! Writes answer `{success, id, timestamp}`, or `409` with the server's
//! version of the record when the write conflicts.

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use super::records::{RecordStore, WriteOutcome};

/// Bearer tokens accepted by the API. Empty means no auth.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    tokens: HashSet<String>,
}

impl TokenSet {
    /// Parses a comma separated list, ignoring blanks.
    pub fn parse(list: &str) -> Self {
        Self {
            tokens: list
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    fn allows(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<RecordStore>,
    pub tokens: Arc<TokenSet>,
}

impl AppState {
    pub fn new(tokens: TokenSet) -> Self {
        Self {
            records: Arc::new(RecordStore::new()),
            tokens: Arc::new(tokens),
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ApiError {
    error: &'static str,
    message: &'static str,
}

fn api_error(status: StatusCode, error: &'static str, message: &'static str) -> Response {
    (status, Json(ApiError { error, message })).into_response()
}

/// Authentication middleware
async fn auth_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.tokens.is_empty() {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(token) => token,
            None => {
                return api_error(
                    StatusCode::UNAUTHORIZED,
                    "invalid_auth",
                    "Authorization header must use Bearer scheme",
                )
            }
        },
        None => {
            return api_error(
                StatusCode::UNAUTHORIZED,
                "missing_auth",
                "Authorization header required",
            )
        }
    };

    if state.tokens.allows(token) {
        next.run(request).await
    } else {
        api_error(StatusCode::UNAUTHORIZED, "invalid_token", "Invalid token")
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Successful write response
#[derive(Serialize)]
struct WriteResponse {
    success: bool,
    id: String,
    timestamp: String,
}

fn written(status: StatusCode, id: String) -> Response {
    (
        status,
        Json(WriteResponse {
            success: true,
            id,
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
        .into_response()
}

fn outcome_response(resource: &str, outcome: WriteOutcome, status: StatusCode) -> Response {
    match outcome {
        WriteOutcome::Stored { id } => {
            tracing::debug!("Stored {}/{}", resource, id);
            written(status, id)
        }
        WriteOutcome::Conflict { current } => {
            tracing::info!("Conflicting write on {}", resource);
            (StatusCode::CONFLICT, Json(current)).into_response()
        }
    }
}

async fn create_record(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !body.is_object() {
        return api_error(
            StatusCode::BAD_REQUEST,
            "invalid_body",
            "Request body must be a JSON object",
        );
    }
    let outcome = state.records.create(&resource, body).await;
    outcome_response(&resource, outcome, StatusCode::CREATED)
}

async fn update_record(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match state.records.update(&resource, body).await {
        Some(outcome) => outcome_response(&resource, outcome, StatusCode::OK),
        None => api_error(StatusCode::BAD_REQUEST, "missing_id", "Record id required"),
    }
}

async fn delete_record(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match state.records.delete(&resource, &body).await {
        Some(id) => written(StatusCode::OK, id),
        None => api_error(StatusCode::BAD_REQUEST, "missing_id", "Record id required"),
    }
}

/// Builds the router. Callers add tracing layers as they see fit.
pub fn router(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(health));

    // Protected routes (auth required when tokens are configured)
    let protected_routes = Router::new()
        .route(
            "/api/{*resource}",
            post(create_record).put(update_record).delete(delete_record),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
