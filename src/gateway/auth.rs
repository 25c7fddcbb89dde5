//! Shared-key authentication middleware.
//!
//! Mutating routes require `x-api-key: <configured key>`. The check is
//! skipped entirely when `gateway.auth_disabled` is set (integration
//! tests).

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::state::AppState;
use super::types::ApiError;

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.auth_disabled {
        return Ok(next.run(request).await);
    }
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(key) if key == state.api_key => Ok(next.run(request).await),
        Some(_) => Err(ApiError::unauthorized("Invalid API Key")),
        None => Err(ApiError::unauthorized("Missing x-api-key header")),
    }
}
