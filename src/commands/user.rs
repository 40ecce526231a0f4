//! Health and caller-info endpoints.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use super::auth::Caller;
use super::response::Envelope;
use super::AppState;

/// `GET /health`, unauthenticated.
pub async fn health(State(state): State<AppState>) -> Json<Envelope> {
    Envelope::ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.gateway.registry().len(),
    }))
}

/// `GET /v1/user/info`
pub async fn user_info(State(state): State<AppState>, caller: Caller) -> Json<Envelope> {
    let info = state
        .gateway
        .user_info(&caller.user_id, caller.identity)
        .await;
    Envelope::ok(json!(info))
}
