// src/api.rs
//! HTTP surface for UI/CLI collaborators: source CRUD, lifecycle commands,
//! status reporting, and manual triggers. The monitoring core itself never
//! depends on this layer.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::registry::{JobRegistry, Lifecycle, RegistryError, Schedule};
use crate::scheduler::{Scheduler, Triggered};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<dyn JobRegistry>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sources", get(list_sources).post(create_source))
        .route("/sources/{id}/status", get(source_status))
        .route("/sources/{id}/trigger", post(trigger_source))
        .route("/sources/{id}/pause", post(pause_source))
        .route("/sources/{id}/resume", post(resume_source))
        .route("/sources/{id}", delete(delete_source))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => {
                ApiError(StatusCode::NOT_FOUND, format!("source not found: {id}"))
            }
            RegistryError::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into(),
        }
    }
}

impl From<(StatusCode, String)> for ApiError {
    fn from((code, msg): (StatusCode, String)) -> Self {
        ApiError(code, msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

async fn list_sources(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sources = state.registry.list().await?;
    Ok(Json(sources))
}

#[derive(serde::Deserialize)]
struct CreateSourceReq {
    url: String,
    #[serde(default)]
    label: Option<String>,
    /// `"60s"`, `"15m"`, `"2h"`, or `"daily@HH:MM"`.
    schedule: String,
}

async fn create_source(
    State(state): State<AppState>,
    Json(req): Json<CreateSourceReq>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        return Err(ApiError(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("url must be http(s): {}", req.url),
        ));
    }
    let schedule = Schedule::parse(&req.schedule)
        .map_err(|e| ApiError(StatusCode::UNPROCESSABLE_ENTITY, format!("{e:#}")))?;
    let label = req.label.unwrap_or_else(|| req.url.clone());
    let source = state.registry.create(req.url, label, schedule).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

async fn source_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.scheduler.status(&id).await?;
    Ok(Json(status))
}

async fn trigger_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.scheduler.trigger_now(&id).await?;
    let (code, label) = match outcome {
        Triggered::Started(_) => (StatusCode::ACCEPTED, "started"),
        Triggered::Busy => (StatusCode::CONFLICT, "busy"),
        Triggered::NotActive => (StatusCode::CONFLICT, "not_active"),
    };
    Ok((code, Json(serde_json::json!({ "trigger": label }))))
}

async fn pause_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.set_lifecycle(&id, Lifecycle::Paused).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.set_lifecycle(&id, Lifecycle::Active).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.delete_source(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
