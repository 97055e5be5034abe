use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::{ApiResult, FileService};

pub struct AppState {
    pub service: Arc<dyn FileService>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let status = state.service.status().await;

    let health_info = serde_json::json!({
        "status": "healthy",
        "phase": status.phase,
        "quorum": {
            "registered": status.registered_nodes,
            "required": status.required_nodes,
            "reached": status.registered_nodes >= status.required_nodes,
        },
        "files": status.files,
    });

    Ok((StatusCode::OK, Json(health_info)).into_response())
}

pub async fn cluster_status(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    Ok(Json(state.service.status().await).into_response())
}

pub async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    Ok(Json(state.service.nodes().await).into_response())
}

pub async fn list_files(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    Ok(Json(state.service.files().await).into_response())
}

pub async fn put_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    tracing::info!("HTTP upload of {} ({} bytes)", name, body.len());

    let summary = state.service.upload(&name, body).await?;

    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let data = state.service.download(&name).await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

pub async fn shutdown(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    state.service.shutdown().await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "shutting down" })),
    )
        .into_response())
}
