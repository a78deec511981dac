//! Axum session middleware layer.
//!
//! Resolves (or creates) the request's session through the manager, binds
//! the snapshot into request extensions, copies its state into the
//! `X-Session-State` request header for downstream handlers, and appends
//! any pending `Set-Cookie` headers to the response.

use axum::Json;
use axum::extract::{FromRequestParts, Request};
use axum::http::header::{CONNECTION, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::sync::Arc;

use super::cookie;
use super::manager::{SESSION_STATE_HEADER, SessionManager};
use super::{Session, SessionState};
use crate::error::SessionError;

/// Extract the session bound by [`session_middleware`].
impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = SessionError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Session>().cloned().ok_or_else(|| {
            SessionError::InvalidConfiguration("session middleware not configured".into())
        })
    }
}

/// Axum middleware function for session handling.
pub async fn session_middleware(
    manager: Arc<SessionManager>,
    mut req: Request,
    next: Next,
) -> Response {
    let mut pending = HeaderMap::new();
    let session = match manager.acquire(req.headers(), &mut pending).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "failed to resolve session");
            let mut response = (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response();
            let headers = response.headers_mut();
            set_hardening_headers(headers);
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
            return response;
        }
    };

    let state = session.state();
    match HeaderValue::from_str(state.as_str()) {
        Ok(value) => {
            req.headers_mut()
                .insert(HeaderName::from_static(SESSION_STATE_HEADER), value);
        }
        Err(_) => {
            tracing::warn!(sid = %session.id(), "session state is not a valid header value");
            req.headers_mut().remove(SESSION_STATE_HEADER);
        }
    }
    let clear_marker = state != SessionState::Authed;
    req.extensions_mut().insert(session);

    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    set_hardening_headers(headers);
    merge_cookies(headers, pending, &manager.config().cookie_name, clear_marker);
    response
}

/// Put the middleware's cookies ahead of the handler's.
///
/// A handler that set the session cookie itself (rotation, logout) wins over
/// the binding made on entry, and a rebound session keeps its auth marker.
fn merge_cookies(headers: &mut HeaderMap, pending: HeaderMap, cookie_name: &str, clear_marker: bool) {
    let from_handler: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    let handler_cookie = from_handler
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|c| cookie::set_cookie_pair(c).filter(|(name, _)| *name == cookie_name))
        .map(|(_, value)| value)
        .last();

    headers.remove(SET_COOKIE);
    if handler_cookie.is_none() {
        for value in pending.get_all(SET_COOKIE) {
            headers.append(SET_COOKIE, value.clone());
        }
    }
    let rebound = handler_cookie.is_some_and(|value| !value.is_empty());
    if clear_marker
        && !rebound
        && let Ok(value) = HeaderValue::from_str(&cookie::make_auth_marker_delete())
    {
        headers.append(SET_COOKIE, value);
    }
    for value in from_handler {
        headers.append(SET_COOKIE, value);
    }
}

fn set_hardening_headers(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("deny"),
    );
}
