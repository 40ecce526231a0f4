//! HTTP commands exposed to chat frontends.
//!
//! A thin JSON layer over [`Gateway`]: each handler resolves the caller,
//! runs one facade operation and wraps the result in the
//! `{errno, msg, data}` envelope.

pub mod auth;
pub mod response;
pub mod servers;
pub mod user;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;
pub use auth::{Caller, IdentityResolver};
pub use response::{ApiError, Envelope};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub auth: Arc<IdentityResolver>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, api_key: Option<String>) -> Self {
        Self {
            gateway,
            auth: Arc::new(IdentityResolver::new(api_key)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(user::health))
        .route("/v1/user/info", get(user::user_info))
        .route("/v1/list/mcp_server", get(servers::list_backends))
        .route(
            "/v1/list/mcp_server_config/{id}",
            get(servers::get_backend_config),
        )
        .route(
            "/v1/list/mcp_server_tools/{id}",
            get(servers::get_tool_catalog),
        )
        .route("/v1/add/mcp_server", post(servers::add_backend))
        .route("/v1/remove/mcp_server/{id}", delete(servers::remove_backend))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test_support::FakeConnector;
    use crate::gateway::{ConfigStore, MemoryStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let config = Arc::new(ConfigStore::new(Arc::new(MemoryStore::new())));
        let gateway = Arc::new(Gateway::new(config, Arc::new(FakeConnector::new())));
        router(AppState::new(gateway, Some("secret".into())))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer secret")
            .header("x-user-id", "alice");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_v1_requires_api_key() {
        let app = app();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/list/mcp_server")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/list/mcp_server")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_backend_lifecycle_over_http() {
        let app = app();

        let (status, body) = send(
            &app,
            "POST",
            "/v1/add/mcp_server",
            Some(json!({
                "server_id": "fs1",
                "server_desc": "Files",
                "command": "npx",
                "args": ["-y", "server-filesystem"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["errno"], 0);
        assert_eq!(body["data"]["tools"][0]["name"], "fs1___search");

        let (_, body) = send(&app, "GET", "/v1/list/mcp_server", None).await;
        assert_eq!(body["data"]["servers"][0]["id"], "fs1");
        assert_eq!(body["data"]["servers"][0]["display_name"], "Files");

        let (_, body) = send(&app, "GET", "/v1/list/mcp_server_config/fs1", None).await;
        assert_eq!(body["data"]["server_config"]["command"], "npx");

        let (_, body) = send(&app, "GET", "/v1/list/mcp_server_tools/fs1", None).await;
        assert_eq!(
            body["data"]["tools_config"]["tools"][1]["toolSpec"]["name"],
            "fs1___fetch"
        );

        let (status, body) = send(
            &app,
            "POST",
            "/v1/add/mcp_server",
            Some(json!({"server_id": "fs1", "command": "npx"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errno"], -1);
        assert_eq!(body["data"]["code"], "duplicate_id");

        let (status, _) = send(&app, "DELETE", "/v1/remove/mcp_server/fs1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "DELETE", "/v1/remove/mcp_server/fs1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["data"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_bad_add_bodies() {
        let app = app();

        let (status, body) = send(&app, "POST", "/v1/add/mcp_server", Some(json!({"args": 5}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["errno"], -1);

        let (status, body) = send(
            &app,
            "POST",
            "/v1/add/mcp_server",
            Some(json!({"server_id": "1bad", "command": "npx"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["data"]["code"], "invalid_config");
    }

    #[tokio::test]
    async fn test_user_info_reports_session() {
        let app = app();
        let (status, body) = send(&app, "GET", "/v1/user/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["user_id"], "alice");
        assert_eq!(body["data"]["identity"]["identity_source"], "header");
    }
}
