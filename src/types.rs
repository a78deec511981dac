//! Shared request/response DTOs.

use serde::{Deserialize, Serialize};

use crate::session::{Session, SessionState};

/// GET /health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,
    pub active_sessions: usize,
}

/// Public view of the request's session. Never carries the id or tokens.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub state: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        let state = session.state();
        let authenticated = state == SessionState::Authed;
        Self {
            state: state.to_string(),
            authenticated,
            user_id: authenticated
                .then(|| session.attrs.user_id().map(String::from))
                .flatten(),
        }
    }
}

/// POST /session/code request body.
#[derive(Debug, Deserialize)]
pub struct CodeChallengeRequest {
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub code: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub code_verifier: Option<String>,
}

/// POST /session/token request body: tokens issued by the authorization service.
#[derive(Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
}

/// Generic success response.
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}
