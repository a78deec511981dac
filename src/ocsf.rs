//! OCSF (Open Cybersecurity Schema Framework) structured event logging.
//!
//! Session lifecycle and blacklist actions are emitted via `tracing::info!`
//! under the `ocsf` target as structured JSON. Never panics.

use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

// OCSF event class UIDs
pub const CLASS_AUTHENTICATION: u32 = 3002;
pub const CLASS_NETWORK_ACTIVITY: u32 = 4001;

// Authentication activity IDs
pub const ACTIVITY_LOGON: u32 = 1;
pub const ACTIVITY_LOGOFF: u32 = 2;
pub const ACTIVITY_OTHER: u32 = 99;

// Network activity IDs
pub const ACTIVITY_REFUSE: u32 = 5;

// Status IDs
pub const STATUS_SUCCESS: u32 = 1;

// Severity IDs
pub const SEVERITY_INFORMATIONAL: u32 = 1;
pub const SEVERITY_LOW: u32 = 2;
pub const SEVERITY_MEDIUM: u32 = 3;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn severity_name(id: u32) -> &'static str {
    match id {
        SEVERITY_INFORMATIONAL => "Informational",
        SEVERITY_LOW => "Low",
        SEVERITY_MEDIUM => "Medium",
        _ => "Unknown",
    }
}

fn metadata() -> serde_json::Value {
    json!({
        "product": {
            "name": "session-warden",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Short, non-replayable form of a session id for audit trails.
fn sid_prefix(sid: &str) -> &str {
    sid.get(..8).unwrap_or(sid)
}

/// Emit an OCSF event as structured JSON via tracing. Never panics.
fn emit(event: &serde_json::Value) {
    if let Ok(json) = serde_json::to_string(event) {
        tracing::info!(target: "ocsf", "{}", json);
    }
}

fn session_event_body(activity_id: u32, sid: &str, message: &str) -> serde_json::Value {
    let activity_name = match activity_id {
        ACTIVITY_LOGON => "Logon",
        ACTIVITY_LOGOFF => "Logoff",
        _ => "Other",
    };
    json!({
        "class_uid": CLASS_AUTHENTICATION,
        "class_name": "Authentication",
        "activity_id": activity_id,
        "activity_name": activity_name,
        "severity_id": SEVERITY_INFORMATIONAL,
        "severity": severity_name(SEVERITY_INFORMATIONAL),
        "status_id": STATUS_SUCCESS,
        "status": "Success",
        "time": now_millis(),
        "metadata": metadata(),
        "session": { "uid": sid_prefix(sid) },
        "message": message,
    })
}

/// Emit a session lifecycle event: `Other` for creation, `Logoff` for destruction.
pub fn session_event(activity_id: u32, sid: &str, message: &str) {
    emit(&session_event_body(activity_id, sid, message));
}

fn authentication_event_body(old_sid: &str, new_sid: &str, uid: &str) -> serde_json::Value {
    json!({
        "class_uid": CLASS_AUTHENTICATION,
        "class_name": "Authentication",
        "activity_id": ACTIVITY_LOGON,
        "activity_name": "Logon",
        "severity_id": SEVERITY_INFORMATIONAL,
        "severity": severity_name(SEVERITY_INFORMATIONAL),
        "status_id": STATUS_SUCCESS,
        "status": "Success",
        "time": now_millis(),
        "metadata": metadata(),
        "actor": {
            "user": { "uid": uid, "type_id": 1, "type": "User" }
        },
        "session": {
            "uid": sid_prefix(new_sid),
            "previous_uid": sid_prefix(old_sid),
        },
        "message": "Session authenticated with id rotation",
    })
}

/// Emit an OCSF Authentication (3001) event for a rotated session.
pub fn authentication_event(old_sid: &str, new_sid: &str, uid: &str) {
    emit(&authentication_event_body(old_sid, new_sid, uid));
}

fn blacklist_event_body(ip: &str, listed: bool, message: &str) -> serde_json::Value {
    let (activity_id, activity_name, severity_id) = if listed {
        (ACTIVITY_REFUSE, "Refuse", SEVERITY_MEDIUM)
    } else {
        (ACTIVITY_OTHER, "Other", SEVERITY_LOW)
    };
    json!({
        "class_uid": CLASS_NETWORK_ACTIVITY,
        "class_name": "Network Activity",
        "activity_id": activity_id,
        "activity_name": activity_name,
        "severity_id": severity_id,
        "severity": severity_name(severity_id),
        "status_id": STATUS_SUCCESS,
        "status": "Success",
        "time": now_millis(),
        "metadata": metadata(),
        "src_endpoint": { "ip": ip },
        "message": message,
    })
}

/// Emit a blacklist change: `listed` for additions, otherwise rehabilitation.
pub fn blacklist_event(ip: &str, listed: bool, message: &str) {
    emit(&blacklist_event_body(ip, listed, message));
}
