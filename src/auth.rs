//! Optional bearer/api-key authentication middleware for the HTTP surface.
//!
//! Grounded on the orchestrator's original `auth_middleware` (header
//! extraction, constant-time key comparison via `subtle`); adapted to the
//! new `config::ApiConfig` and to being optional rather than mandatory,
//! since this core's HTTP surface is "interfaces only" (SPEC_FULL.md
//! §4.15) and may run unauthenticated in local/dev deployments.

use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
}

/// When `config.enable_auth` is false this is a no-op passthrough. When
/// enabled, accepts either an `x-api-key` header or a `Bearer` token in
/// `authorization`, compared against the configured key in constant time.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if !auth_state.config.enable_auth {
        return Ok(next.run(request).await);
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let provided_key = if let Some(header_value) = headers.get("x-api-key") {
        header_value.to_str().map_err(|_| {
            warn!("malformed x-api-key header for path {path}");
            unauthorized()
        })?
    } else if let Some(header_value) = headers.get("authorization") {
        let auth_str = header_value.to_str().map_err(|_| {
            warn!("malformed authorization header for path {path}");
            unauthorized()
        })?;
        auth_str.strip_prefix("Bearer ").ok_or_else(|| {
            warn!("authorization header missing Bearer prefix for path {path}");
            unauthorized()
        })?
    } else {
        warn!("missing API key for path {path}");
        return Err(unauthorized());
    };

    match &auth_state.config.api_key {
        Some(expected_key) => {
            if provided_key.as_bytes().ct_eq(expected_key.as_bytes()).into() {
                Ok(next.run(request).await)
            } else {
                warn!("authentication failed for path {path}: invalid key");
                Err(unauthorized())
            }
        }
        None => {
            warn!("auth enabled but no API key configured");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response())
        }
    }
}
