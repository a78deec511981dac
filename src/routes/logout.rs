//! POST /session/logout

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::types::SuccessResponse;

/// Destroy the session and expire the client cookie.
pub async fn logout(
    State(state): State<Arc<crate::AppState>>,
    headers: HeaderMap,
) -> Result<(HeaderMap, Json<SuccessResponse>), AppError> {
    let mut response = HeaderMap::new();
    state.manager.destroy(&headers, &mut response).await?;
    Ok((response, Json(SuccessResponse { success: true })))
}
