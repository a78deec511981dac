//! Test utilities: app builder over a manually driven clock, request helpers.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::Request;
use axum::http::header::SET_COOKIE;
use axum::response::Response;
use session_warden::blacklist::StaticVerifier;
use session_warden::clock::ManualClock;
use session_warden::config::Config;
use session_warden::session::AnyBackend;
use session_warden::session::manager::SessionManager;
use session_warden::session::memory::InMemoryBackend;
use session_warden::session::registry::{BackendRegistry, Provider};
use session_warden::{AppState, create_app};
use std::sync::Arc;

pub const T0: i64 = 1_700_000_000;

/// Address the fake verifier accepts as a legitimate crawler.
pub const CRAWLER_IP: &str = "66.249.66.1";

pub struct TestApp {
    pub app: axum::Router,
    pub state: Arc<AppState>,
    pub clock: ManualClock,
}

impl TestApp {
    pub fn manager(&self) -> &SessionManager {
        &self.state.manager
    }
}

/// Build a test app with the in-memory backend and default config.
pub fn build_test_app() -> TestApp {
    build_test_app_with_config(Config::test_default())
}

/// Build a test app with a custom Config.
pub fn build_test_app_with_config(config: Config) -> TestApp {
    let clock = ManualClock::new(T0);
    let backend = InMemoryBackend::with_max_lifetime(config.max_lifetime)
        .with_clock(Arc::new(clock.clone()))
        .with_verifier(Arc::new(StaticVerifier::new([CRAWLER_IP])));

    let mut registry = BackendRegistry::new();
    registry.register(Provider::Memory, AnyBackend::Memory(backend));
    let manager = SessionManager::new(Provider::Memory, config.clone(), &registry)
        .expect("manager builds");

    let state = Arc::new(AppState {
        config,
        manager: Arc::new(manager),
    });
    TestApp {
        app: create_app(state.clone()),
        state,
        clock,
    }
}

/// Build a request, optionally carrying a `Cookie` header.
pub fn request(method: &str, uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header("Cookie", cookie);
    }
    builder.body(Body::empty()).unwrap()
}

/// Build a JSON request, optionally carrying a `Cookie` header.
pub fn json_request(
    method: &str,
    uri: &str,
    cookie: Option<&str>,
    body: &serde_json::Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header("Cookie", cookie);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// All `Set-Cookie` values on a response.
pub fn set_cookies(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(String::from)
        .collect()
}

/// The `name=value` pair of the session cookie set on a response.
pub fn session_cookie(response: &Response, name: &str) -> Option<String> {
    set_cookies(response)
        .into_iter()
        .find(|c| c.starts_with(&format!("{name}=")))
        .and_then(|c| c.split(';').next().map(String::from))
}

/// Session id from a `name=value` cookie pair.
pub fn sid_of(pair: &str) -> &str {
    pair.split_once('=').map(|(_, v)| v).unwrap_or_default()
}

/// Read response body as JSON.
pub async fn body_json(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
