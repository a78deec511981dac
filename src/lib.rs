//! Session Warden: server-side HTTP sessions for an OAuth 2.0 PKCE front end.
//!
//! Opaque session ids travel in a cookie; records live in a pluggable
//! backend (in-memory or DynamoDB). Ids rotate when a session authenticates,
//! idle sessions are reaped periodically, and abusive client IPs are
//! blacklisted until their DNS checks out.

pub mod blacklist;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod ocsf;
pub mod routes;
pub mod session;
pub mod types;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post, put};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::session::manager::SessionManager;
use crate::session::middleware::session_middleware;

/// Shared application state available to all route handlers.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<SessionManager>,
}

/// Build the Axum router with all middleware and routes.
pub fn create_app(state: Arc<AppState>) -> Router {
    let manager = state.manager.clone();

    // Routes bound to a session through the middleware
    let session_routes = Router::new()
        .route("/session", get(routes::session::current))
        .route(
            "/session/code",
            get(routes::session::auth_code).post(routes::session::save_code),
        )
        .route("/session/token", post(routes::token::exchange))
        .route("/session/logout", post(routes::logout::logout))
        .layer(from_fn(move |req, next| {
            let manager = manager.clone();
            session_middleware(manager, req, next)
        }));

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/session/state", put(routes::state::change_state))
        .merge(session_routes)
        .layer(from_fn_with_state(
            state.manager.clone(),
            crate::middleware::blacklist::reject_blacklisted,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
