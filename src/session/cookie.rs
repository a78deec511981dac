//! Session cookie parsing and `Set-Cookie` construction.
//!
//! Cookie value is the URL-encoded session id. The id is opaque and
//! unguessable, so the value carries no signature.

use axum::http::HeaderMap;
use axum::http::header;

/// External auth marker cookie cleared for non-authenticated sessions.
pub const AUTH_MARKER_COOKIE: &str = "ia";

const EPOCH_EXPIRES: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// Value of cookie `name` across all `Cookie` headers, still URL-encoded.
pub fn find_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|h| parse_cookie(h, name))
}

/// Decoded session id from the request, `None` when absent or empty.
pub fn session_id(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = find_cookie(headers, name)?;
    if raw.is_empty() {
        return None;
    }
    match urlencoding::decode(raw) {
        Ok(sid) if !sid.is_empty() => Some(sid.into_owned()),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "session cookie is not valid percent-encoding");
            None
        }
    }
}

/// `Set-Cookie` binding the client to `session_id`.
pub fn make_set_cookie(name: &str, session_id: &str, max_age: i64) -> String {
    [
        format!("{}={}", name, urlencoding::encode(session_id)),
        "Path=/".into(),
        "HttpOnly".into(),
        "Secure".into(),
        "SameSite=Strict".into(),
        format!("Max-Age={max_age}"),
    ]
    .join("; ")
}

/// `Set-Cookie` invalidating the client's copy of the session cookie.
pub fn make_delete_cookie(name: &str) -> String {
    [
        format!("{name}="),
        "Path=/".into(),
        format!("Expires={EPOCH_EXPIRES}"),
        "Max-Age=0".into(),
        "HttpOnly".into(),
        "Secure".into(),
    ]
    .join("; ")
}

/// `Set-Cookie` clearing any lingering auth marker cookie.
pub fn make_auth_marker_delete() -> String {
    format!("{AUTH_MARKER_COOKIE}=deleted; Path=/; Expires={EPOCH_EXPIRES}")
}

/// Name and value of a `Set-Cookie` header value.
pub fn set_cookie_pair(set_cookie: &str) -> Option<(&str, &str)> {
    let pair = set_cookie.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    Some((name.trim(), value.trim()))
}

/// Parse a specific cookie from a Cookie header value.
fn parse_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    for part in header.split(';') {
        let trimmed = part.trim();
        if let Some(value) = trimmed.strip_prefix(name)
            && let Some(value) = value.strip_prefix('=')
        {
            return Some(value);
        }
    }
    None
}
