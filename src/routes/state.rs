//! PUT /session/state

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::types::SuccessResponse;

/// Overwrite the session state with the `X-Session-State` request header.
///
/// Mounted outside the session middleware, which rewrites that header.
pub async fn change_state(
    State(state): State<Arc<crate::AppState>>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let success = state.manager.change_state(&headers).await?;
    Ok(Json(SuccessResponse { success }))
}
