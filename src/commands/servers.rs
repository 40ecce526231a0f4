//! Backend management endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use super::auth::Caller;
use super::response::{ApiError, Envelope};
use super::AppState;
use crate::gateway::AddBackendRequest;

/// `GET /v1/list/mcp_server`
pub async fn list_backends(State(state): State<AppState>, caller: Caller) -> Json<Envelope> {
    let servers = state.gateway.list_backends(&caller.user_id).await;
    Envelope::ok(json!({ "servers": servers }))
}

/// `GET /v1/list/mcp_server_config/{id}`
pub async fn get_backend_config(
    State(state): State<AppState>,
    caller: Caller,
    Path(backend_id): Path<String>,
) -> Result<Json<Envelope>, ApiError> {
    let config = state
        .gateway
        .get_backend_config(&caller.user_id, &backend_id)?;
    Ok(Envelope::ok(json!({ "server_config": config })))
}

/// `GET /v1/list/mcp_server_tools/{id}`
pub async fn get_tool_catalog(
    State(state): State<AppState>,
    caller: Caller,
    Path(backend_id): Path<String>,
) -> Result<Json<Envelope>, ApiError> {
    let catalog = state
        .gateway
        .get_tool_catalog(&caller.user_id, &backend_id)
        .await?;
    Ok(Envelope::ok(json!({
        "tools": catalog.tools,
        "tools_config": catalog.to_bedrock_tool_config(),
    })))
}

/// `POST /v1/add/mcp_server`
pub async fn add_backend(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<AddBackendRequest>, JsonRejection>,
) -> Result<Json<Envelope>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let catalog = state.gateway.add_backend(&caller.user_id, request).await?;
    Ok(Envelope::with_msg(
        "backend added",
        json!({
            "server_id": catalog.backend_id,
            "tools": catalog.tools,
        }),
    ))
}

/// `DELETE /v1/remove/mcp_server/{id}`
pub async fn remove_backend(
    State(state): State<AppState>,
    caller: Caller,
    Path(backend_id): Path<String>,
) -> Result<Json<Envelope>, ApiError> {
    state
        .gateway
        .remove_backend(&caller.user_id, &backend_id)
        .await?;
    Ok(Envelope::with_msg("backend removed", Value::Null))
}
