//! Axum router and request handlers.
//!
//! Routes:
//! - `GET  /healthz`                  - Storage, cache and KeyDB health
//! - `GET  /metrics`                  - Prometheus metrics
//! - `GET  /api/storage/get/{*key}`   - Signed object download
//! - `PUT  /api/storage/put/{*key}`   - Signed object upload

use anyhow::Context as _;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use tracing::{debug, error, instrument, warn};

use super::AppState;
use crate::error::StorageError;
use crate::storage::signing::{ProxyOp, SignatureError};
use crate::storage::{GetOptions, PutOptions};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/storage/get/{*key}", get(handle_proxy_get))
        .route(
            "/api/storage/put/{*key}",
            put(handle_proxy_put).layer(DefaultBodyLimit::disable()),
        )
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SignedQuery {
    expires: i64,
    signature: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn verify(state: &AppState, op: ProxyOp, key: &str, query: &SignedQuery) -> Result<(), AppError> {
    state
        .signer
        .verify(op, key, query.expires, &query.signature)
        .map_err(|e| {
            warn!(%key, op = op.as_str(), error = %e, "rejected proxy request");
            AppError::Forbidden(e)
        })
}

/// `GET /api/storage/get/{*key}?expires=..&signature=..`
#[instrument(skip(state, query), fields(%key))]
async fn handle_proxy_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, AppError> {
    verify(&state, ProxyOp::Get, &key, &query)?;
    let storage = state.resolver.get_storage().await?;
    let data = storage.get(&key, &GetOptions::default()).await?;
    debug!(len = data.len(), "proxy download");
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

/// `PUT /api/storage/put/{*key}?expires=..&signature=..`
#[instrument(skip(state, query, body), fields(%key, len = body.len()))]
async fn handle_proxy_put(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    verify(&state, ProxyOp::Put, &key, &query)?;
    let storage = state.resolver.get_storage().await?;
    storage.put(&key, body, &PutOptions::default()).await?;
    Ok(StatusCode::OK.into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    crate::health::health_handler(axum::extract::State(state.health_state())).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .context("metrics encoding failed")?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Missing, expired or forged proxy signature.
    Forbidden(SignatureError),
    NotFound(String),
    BadRequest(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Forbidden(e) => (StatusCode::FORBIDDEN, e.to_string()).into_response(),
            AppError::NotFound(key) => {
                (StatusCode::NOT_FOUND, format!("object not found: {key}")).into_response()
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { key } => AppError::NotFound(key),
            StorageError::InvalidConfig(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.into()),
        }
    }
}
