//! Integration tests for the session routes and middleware.
//!
//! Uses Tower's `oneshot()` to test the full Axum app including middleware.

mod common;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::from_fn;
use axum::routing::get;
use common::{
    CRAWLER_IP, body_json, build_test_app, build_test_app_with_config, json_request, request,
    session_cookie, set_cookies, sid_of,
};
use serde_json::json;
use session_warden::blacklist::QUARANTINE_SECS;
use session_warden::config::Config;
use session_warden::session::id::ENCODED_LEN;
use session_warden::session::middleware::session_middleware;
use std::net::SocketAddr;
use tower::ServiceExt;

fn cookie_headers(pair: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("cookie", pair.parse().unwrap());
    headers
}

// ───── session binding ─────

#[tokio::test]
async fn test_cookieless_request_mints_session() {
    let t = build_test_app();

    let resp = t.app.clone().oneshot(request("GET", "/session", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-xss-protection"], "1; mode=block");
    assert_eq!(resp.headers()["x-frame-options"], "deny");

    let cookies = set_cookies(&resp);
    let session = cookies
        .iter()
        .find(|c| c.starts_with("ivmid="))
        .expect("session cookie");
    let sid = sid_of(session.split(';').next().unwrap());
    assert_eq!(sid.len(), ENCODED_LEN);
    assert_eq!(
        session,
        &format!("ivmid={sid}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=3600")
    );
    // Unauthenticated sessions clear the external auth marker
    assert!(cookies.iter().any(|c| c.starts_with("ia=deleted;")));

    let body = body_json(resp).await;
    assert_eq!(body["state"], "New");
    assert_eq!(body["authenticated"], false);
    assert_eq!(t.manager().active_sessions().await, 1);
}

#[tokio::test]
async fn test_replayed_cookie_keeps_session() {
    let t = build_test_app();

    let resp = t.app.clone().oneshot(request("GET", "/session", None)).await.unwrap();
    let cookie = session_cookie(&resp, "ivmid").unwrap();

    let resp = t
        .app
        .clone()
        .oneshot(request("GET", "/session", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(session_cookie(&resp, "ivmid").is_none());
    assert!(t.manager().exists(&cookie_headers(&cookie)).await);
    assert_eq!(t.manager().active_sessions().await, 1);
}

#[tokio::test]
async fn test_unknown_cookie_gets_fresh_session() {
    let t = build_test_app();
    let stale = "ivmid=...xxx...";
    assert!(!t.manager().exists(&cookie_headers(stale)).await);

    let resp = t
        .app
        .clone()
        .oneshot(request("GET", "/session", Some(stale)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(session_cookie(&resp, "ivmid").as_deref(), Some(stale));
    assert_eq!(body_json(resp).await["state"], "New");
    assert!(t.manager().exists(&cookie_headers(stale)).await);
}

#[tokio::test]
async fn test_state_is_forwarded_to_handlers() {
    let t = build_test_app();
    let manager = t.state.manager.clone();
    let app = Router::new()
        .route(
            "/echo",
            get(|headers: HeaderMap| async move {
                headers
                    .get("x-session-state")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        )
        .layer(from_fn(move |req, next| {
            session_middleware(manager.clone(), req, next)
        }));

    // A client-supplied value is overwritten
    let req = Request::builder()
        .uri("/echo")
        .header("X-Session-State", "Authed")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"New");
}

// ───── authorization flow ─────

#[tokio::test]
async fn test_auth_code_round_trip_and_expiry() {
    let t = build_test_app();
    let resp = t.app.clone().oneshot(request("GET", "/session", None)).await.unwrap();
    let cookie = session_cookie(&resp, "ivmid").unwrap();

    let body = json!({
        "code_challenge": "CH",
        "code_challenge_method": "S256",
        "code": "AC",
        "redirect_uri": "https://app/cb",
        "code_verifier": "verifier-1"
    });
    let resp = t
        .app
        .clone()
        .oneshot(json_request("POST", "/session/code", Some(&cookie), &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = t
        .app
        .clone()
        .oneshot(request("GET", "/session", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["state"], "InAuth");

    let resp = t
        .app
        .clone()
        .oneshot(request("GET", "/session/code", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(
        body_json(resp).await,
        json!({"auth_code": "AC", "code_challenger": "CH", "code_challenger_method": "S256"})
    );

    t.clock.advance(61);
    let resp = t
        .app
        .clone()
        .oneshot(request("GET", "/session/code", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await, json!({}));
}

#[tokio::test]
async fn test_save_code_rejects_missing_fields() {
    let t = build_test_app();
    let body = json!({
        "code_challenge": "",
        "code_challenge_method": "S256",
        "code": "AC",
        "redirect_uri": "https://app/cb"
    });
    let resp = t
        .app
        .clone()
        .oneshot(json_request("POST", "/session/code", None, &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_token_exchange_rotates_session_id() {
    let t = build_test_app();
    let resp = t.app.clone().oneshot(request("GET", "/session", None)).await.unwrap();
    let old_cookie = session_cookie(&resp, "ivmid").unwrap();
    t.manager()
        .save_aca(sid_of(&old_cookie), "CH", "S256", "AC", "https://app/cb")
        .await
        .unwrap();

    let grant = json!({"access_token": "at1", "refresh_token": "rt1", "user_id": "u42"});
    let resp = t
        .app
        .clone()
        .oneshot(json_request("POST", "/session/token", Some(&old_cookie), &grant))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let new_cookie = session_cookie(&resp, "ivmid").expect("rotated cookie");
    assert_ne!(new_cookie, old_cookie);
    let body = body_json(resp).await;
    assert_eq!(body["state"], "Authed");
    assert_eq!(body["user_id"], "u42");

    assert!(!t.manager().exists(&cookie_headers(&old_cookie)).await);
    let at = t
        .manager()
        .get_auth_session_attribute(&cookie_headers(&new_cookie), "at")
        .await
        .unwrap();
    assert_eq!(at, Some(json!("at1")));

    let resp = t
        .app
        .clone()
        .oneshot(request("GET", "/session", Some(&new_cookie)))
        .await
        .unwrap();
    // Authenticated sessions keep the auth marker
    assert!(!set_cookies(&resp).iter().any(|c| c.starts_with("ia=")));
    let body = body_json(resp).await;
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["user_id"], "u42");
}

#[tokio::test]
async fn test_token_exchange_with_stale_cookie_binds_rotated_session() {
    let t = build_test_app();
    let grant = json!({"access_token": "at1", "refresh_token": "rt1", "user_id": "u42"});
    let resp = t
        .app
        .clone()
        .oneshot(json_request("POST", "/session/token", Some("ivmid=stale-id"), &grant))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let cookies = set_cookies(&resp);
    let bindings: Vec<&String> = cookies.iter().filter(|c| c.starts_with("ivmid=")).collect();
    assert_eq!(bindings.len(), 1);
    assert!(!bindings[0].starts_with("ivmid=stale-id;"));
    // The rotated session is authenticated, so the auth marker stays
    assert!(!cookies.iter().any(|c| c.starts_with("ia=")));

    let new_cookie = session_cookie(&resp, "ivmid").unwrap();
    assert!(!t.manager().exists(&cookie_headers("ivmid=stale-id")).await);
    let resp = t
        .app
        .clone()
        .oneshot(request("GET", "/session", Some(&new_cookie)))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["state"], "Authed");
    assert_eq!(body["user_id"], "u42");
}

#[tokio::test]
async fn test_token_exchange_without_cookie_is_unauthorized() {
    let t = build_test_app();
    let grant = json!({"access_token": "at1", "refresh_token": "rt1", "user_id": "u42"});
    let resp = t
        .app
        .clone()
        .oneshot(json_request("POST", "/session/token", None, &grant))
        .await
        .unwrap();
    // The middleware minted a session, but the handler only sees the request cookie
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ───── state + logout ─────

#[tokio::test]
async fn test_change_state_requires_header() {
    let t = build_test_app();
    let resp = t.app.clone().oneshot(request("GET", "/session", None)).await.unwrap();
    let cookie = session_cookie(&resp, "ivmid").unwrap();

    let resp = t
        .app
        .clone()
        .oneshot(request("PUT", "/session/state", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .method("PUT")
        .uri("/session/state")
        .header("Cookie", &cookie)
        .header("X-Session-State", "InAuth")
        .body(Body::empty())
        .unwrap();
    let resp = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["success"], true);

    let resp = t
        .app
        .clone()
        .oneshot(request("GET", "/session", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["state"], "InAuth");
}

#[tokio::test]
async fn test_logout_destroys_session() {
    let t = build_test_app();
    let resp = t.app.clone().oneshot(request("GET", "/session", None)).await.unwrap();
    let cookie = session_cookie(&resp, "ivmid").unwrap();

    let resp = t
        .app
        .clone()
        .oneshot(request("POST", "/session/logout", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let expired = set_cookies(&resp)
        .into_iter()
        .find(|c| c.starts_with("ivmid=;"))
        .expect("deletion cookie");
    assert!(expired.contains("Max-Age=0"));
    assert!(expired.contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    assert!(!t.manager().exists(&cookie_headers(&cookie)).await);
}

#[tokio::test]
async fn test_logout_with_stale_cookie_ends_with_deletion() {
    let t = build_test_app();
    let resp = t
        .app
        .clone()
        .oneshot(request("POST", "/session/logout", Some("ivmid=stale-id")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let cookies = set_cookies(&resp);
    let bindings: Vec<&String> = cookies.iter().filter(|c| c.starts_with("ivmid=")).collect();
    assert_eq!(bindings.len(), 1);
    assert!(bindings[0].starts_with("ivmid=;"));
    assert!(bindings[0].contains("Max-Age=0"));
    assert!(!t.manager().exists(&cookie_headers("ivmid=stale-id")).await);
}

#[tokio::test]
async fn test_session_failure_closes_connection() {
    let mut config = Config::test_default();
    // Not representable in a Set-Cookie header, so binding a new session fails
    config.cookie_name = "ivm\nid".into();
    let t = build_test_app_with_config(config);

    let resp = t.app.clone().oneshot(request("GET", "/session", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers()["connection"], "close");
    assert_eq!(resp.headers()["x-xss-protection"], "1; mode=block");
    assert_eq!(resp.headers()["x-frame-options"], "deny");
    assert!(set_cookies(&resp).is_empty());
    assert_eq!(body_json(resp).await["error"], "Internal Server Error");
}

// ───── maintenance ─────

#[tokio::test]
async fn test_gc_removes_idle_sessions() {
    let mut config = Config::test_default();
    config.max_lifetime = 1;
    let t = build_test_app_with_config(config);

    let resp = t.app.clone().oneshot(request("GET", "/session", None)).await.unwrap();
    let cookie = session_cookie(&resp, "ivmid").unwrap();
    assert!(cookie.len() > "ivmid=".len());

    t.clock.advance(2);
    t.manager().gc().await;
    assert!(!t.manager().exists(&cookie_headers(&cookie)).await);

    let resp = t.app.clone().oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(body_json(resp).await["active_sessions"], 0);
}

#[tokio::test]
async fn test_health_reports_backend() {
    let t = build_test_app();
    let resp = t.app.clone().oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // Health is outside the session layer
    assert!(set_cookies(&resp).is_empty());
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "memory");
    assert_eq!(body["active_sessions"], 0);
}

// ───── blacklist ─────

#[tokio::test]
async fn test_blacklisted_ip_is_refused_until_rehabilitated() {
    let mut config = Config::test_default();
    config.trusted_proxy_hops = 1;
    let t = build_test_app_with_config(config);
    assert!(
        t.manager()
            .add_blacklisting(CRAWLER_IP, "/wp-login.php", json!({"hits": 50}))
            .await
    );

    // The trusted proxy appends the address it saw; the left part is client input
    let forwarded = |ip: &str| {
        Request::builder()
            .uri("/session")
            .header("X-Forwarded-For", format!("1.2.3.4, {ip}"))
            .body(Body::empty())
            .unwrap()
    };

    let resp = t.app.clone().oneshot(forwarded(CRAWLER_IP)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["error"], "Forbidden");

    let resp = t.app.clone().oneshot(forwarded("198.51.100.4")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    t.clock.advance(QUARANTINE_SECS + 1);
    t.manager().blc().await;
    let resp = t.app.clone().oneshot(forwarded(CRAWLER_IP)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_forged_forwarded_header_does_not_bypass_blacklist() {
    let t = build_test_app();
    t.manager()
        .add_blacklisting(CRAWLER_IP, "/wp-login.php", json!(null))
        .await;

    let peer: SocketAddr = format!("{CRAWLER_IP}:40000").parse().unwrap();
    let mut req = Request::builder()
        .uri("/session")
        .header("X-Forwarded-For", "1.2.3.4")
        .body(Body::empty())
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(peer));

    let resp = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}
