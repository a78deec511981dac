//! Error types with Axum response mapping.
//!
//! `BackendError` is what storage implementations return. `SessionError` is
//! what the manager surfaces to the HTTP layer. `AppError` covers route and
//! guard failures. Each variant maps to a status + JSON body.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors raised by a session storage backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("{op} failed: {message}")]
    Storage { op: &'static str, message: String },

    #[error("malformed session document: {0}")]
    Serialization(String),
}

impl BackendError {
    pub fn storage(op: &'static str, message: impl Into<String>) -> Self {
        BackendError::Storage {
            op,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

/// Errors surfaced by the session manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session id")]
    UnknownSessionId,

    #[error("invalid session id")]
    InvalidSessionId,

    #[error("unknown session store type {0:?}")]
    UnknownProvider(String),

    #[error("missing or invalid session manager configuration: {0}")]
    InvalidConfiguration(String),

    #[error("missing value for the new state in header x-session-state")]
    MissingState,

    #[error("{op} for session {sid}: {source}")]
    Backend {
        op: &'static str,
        sid: String,
        #[source]
        source: BackendError,
    },
}

impl SessionError {
    /// Wrap a backend failure with the operation and session id.
    pub fn backend(op: &'static str, sid: &str, source: BackendError) -> Self {
        SessionError::Backend {
            op,
            sid: sid.to_string(),
            source,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::UnknownSessionId | SessionError::InvalidSessionId => {
                StatusCode::UNAUTHORIZED
            }
            SessionError::MissingState => StatusCode::BAD_REQUEST,
            SessionError::UnknownProvider(_)
            | SessionError::InvalidConfiguration(_)
            | SessionError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            SessionError::UnknownSessionId => json!({"error": "Unknown session id"}),
            SessionError::InvalidSessionId => json!({"error": "Invalid session id"}),
            SessionError::MissingState => json!({
                "error": "Missing session state",
                "message": "Header X-Session-State must carry the new state"
            }),
            // Storage details stay in the logs.
            _ => json!({"error": "Internal Server Error"}),
        };

        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

/// Route-level errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Forbidden")]
    Blacklisted,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Blacklisted => {
                (StatusCode::FORBIDDEN, axum::Json(json!({"error": "Forbidden"}))).into_response()
            }
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, axum::Json(json!({"error": msg}))).into_response()
            }
            AppError::Session(err) => err.into_response(),
        }
    }
}
