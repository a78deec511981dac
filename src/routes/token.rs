//! POST /session/token

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::types::{SessionInfo, TokenGrant};

/// Store the granted tokens under a freshly rotated session id.
pub async fn exchange(
    State(state): State<Arc<crate::AppState>>,
    headers: HeaderMap,
    Json(body): Json<TokenGrant>,
) -> Result<(HeaderMap, Json<SessionInfo>), AppError> {
    if body.access_token.is_empty() || body.user_id.is_empty() {
        return Err(AppError::BadRequest("Missing access_token or user_id".into()));
    }

    let mut response = HeaderMap::new();
    let session = state
        .manager
        .session_auth(
            &headers,
            &mut response,
            &body.access_token,
            &body.refresh_token,
            &body.user_id,
        )
        .await?;

    Ok((response, Json(SessionInfo::from(&session))))
}
