//! GET /session, GET + POST /session/code

use axum::Json;
use axum::extract::State;
use std::sync::Arc;

use crate::error::AppError;
use crate::session::{AuthCode, Session};
use crate::types::{CodeChallengeRequest, SessionInfo, SuccessResponse};

/// Describe the session bound to this request.
pub async fn current(session: Session) -> Json<SessionInfo> {
    Json(SessionInfo::from(&session))
}

/// Record an authorization request; the session moves to `InAuth`.
pub async fn save_code(
    State(state): State<Arc<crate::AppState>>,
    session: Session,
    Json(body): Json<CodeChallengeRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    if body.code.is_empty() || body.code_challenge.is_empty() {
        return Err(AppError::BadRequest("Missing code or code_challenge".into()));
    }

    let manager = &state.manager;
    if let Some(verifier) = body.code_verifier.as_deref().filter(|v| !v.is_empty()) {
        manager.update_code_verifier(session.id(), verifier).await?;
    }
    manager
        .save_aca(
            session.id(),
            &body.code_challenge,
            &body.code_challenge_method,
            &body.code,
            &body.redirect_uri,
        )
        .await?;

    Ok(Json(SuccessResponse { success: true }))
}

/// The still-usable authorization code, or `{}`.
pub async fn auth_code(
    State(state): State<Arc<crate::AppState>>,
    session: Session,
) -> Json<AuthCode> {
    Json(state.manager.get_auth_code(session.id()).await)
}
