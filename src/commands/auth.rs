//! Caller identity.
//!
//! Every `/v1` request carries a bearer token. When the gateway has an API
//! key the token must match it. The user id is taken from, in order: the
//! `user_identity` query parameter, the `x-amzn-oidc-identity` header (set
//! by an ALB with OIDC), the `X-User-ID` header, and finally a fingerprint
//! of the token itself.

use std::collections::{BTreeMap, HashMap};

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Uri};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::response::ApiError;
use super::AppState;

const OIDC_IDENTITY_HEADER: &str = "x-amzn-oidc-identity";
const USER_ID_HEADER: &str = "x-user-id";
const USER_IDENTITY_PARAM: &str = "user_identity";

/// Validates bearer tokens and derives user ids.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    api_key: Option<String>,
}

impl IdentityResolver {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn resolve(&self, headers: &HeaderMap, uri: &Uri) -> Result<Caller, ApiError> {
        let token = bearer_token(headers).ok_or(ApiError::AuthRequired)?;
        if let Some(expected) = &self.api_key {
            if !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
                return Err(ApiError::AuthInvalid);
            }
        }

        let query = Query::<HashMap<String, String>>::try_from_uri(uri)
            .map(|Query(q)| q)
            .unwrap_or_default();

        let (user_id, source) = if let Some(id) = non_empty(query.get(USER_IDENTITY_PARAM)) {
            (id.to_string(), "query")
        } else if let Some(id) = header_value(headers, OIDC_IDENTITY_HEADER) {
            (id, "oidc")
        } else if let Some(id) = header_value(headers, USER_ID_HEADER) {
            (id, "header")
        } else {
            (token_fingerprint(&token), "token")
        };

        let identity = BTreeMap::from([("identity_source".to_string(), source.to_string())]);
        Ok(Caller { user_id, identity })
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    /// Where the id came from, kept on the session for diagnostics.
    pub identity: BTreeMap<String, String>,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state.auth.resolve(&parts.headers, &parts.uri)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Stable anonymous id: `anon-` plus 16 hex chars of SHA-256(token).
fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("anon-{hex}")
}
