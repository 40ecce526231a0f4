//! Response envelope and API errors.
//!
//! Every endpoint answers `{errno, msg, data}`: `errno` is 0 on success and
//! -1 on failure, with the HTTP status carrying the failure class.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub errno: i32,
    pub msg: String,
    pub data: Value,
}

impl Envelope {
    pub fn ok(data: Value) -> Json<Self> {
        Self::with_msg("ok", data)
    }

    pub fn with_msg(msg: &str, data: Value) -> Json<Self> {
        Json(Self {
            errno: 0,
            msg: msg.to_string(),
            data,
        })
    }
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required: send 'Authorization: Bearer <token>'")]
    AuthRequired,

    #[error("invalid API key")]
    AuthInvalid,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Gateway(e) => match e {
                GatewayError::DuplicateId { .. } | GatewayError::SharedBackend { .. } => {
                    StatusCode::CONFLICT
                }
                GatewayError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
                GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
                GatewayError::Connect { .. } | GatewayError::Orchestration { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                GatewayError::Persistence { .. } | GatewayError::Storage { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Gateway(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        let body = Envelope {
            errno: -1,
            msg: self.to_string(),
            data: json!({ "code": self.code() }),
        };
        (status, Json(body)).into_response()
    }
}
