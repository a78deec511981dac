//! Blacklist guard: refuse requests from blacklisted client addresses.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::AppError;
use crate::session::manager::SessionManager;

/// Axum middleware returning 403 for blacklisted client IPs.
pub async fn reject_blacklisted(
    State(manager): State<Arc<SessionManager>>,
    req: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let trusted_hops = manager.config().trusted_proxy_hops;
    if let Some(ip) = client_ip(req.headers(), peer, trusted_hops)
        && manager.is_blacklisted(&ip).await
    {
        tracing::info!(ip = %ip, path = %req.uri().path(), "request from blacklisted ip refused");
        return Err(AppError::Blacklisted);
    }
    Ok(next.run(req).await)
}

/// Client address as seen by the outermost trusted proxy.
///
/// Each of the `trusted_hops` proxies appends the address it received the
/// request from, so only the right-most `trusted_hops` entries of
/// `X-Forwarded-For` are trustworthy; anything left of them is client input.
/// Without trusted proxies, or with fewer entries than proxies, the socket
/// peer is used.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted_hops: usize) -> Option<String> {
    let peer_ip = || peer.map(|addr| addr.ip().to_string());
    if trusted_hops == 0 {
        return peer_ip();
    }
    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect();
    hops.len()
        .checked_sub(trusted_hops)
        .map(|i| hops[i])
        .filter(|ip| !ip.is_empty())
        .map(String::from)
        .or_else(peer_ip)
}
