//! IP blacklist entries and rehabilitation checks.
//!
//! Entries older than the quarantine window are re-examined by the backend
//! sweep; an entry is retired when its reverse and forward DNS agree.

pub mod dns;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use dns::DnsVerifier;

/// Age after which a blacklisted IP is eligible for rehabilitation (3 days).
pub const QUARANTINE_SECS: i64 = 3 * 24 * 3600;

/// One blacklisted address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    /// Seconds since the Unix epoch.
    pub created: i64,
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    pub details: serde_json::Value,
}

impl BlacklistEntry {
    pub fn new(created: i64, request_uri: &str, details: serde_json::Value) -> Self {
        Self {
            created,
            request_uri: request_uri.to_string(),
            details,
        }
    }

    /// Whether the entry has aged past the quarantine window.
    pub fn is_quarantine_over(&self, now: i64) -> bool {
        self.created < now - QUARANTINE_SECS
    }
}

/// Decides whether a blacklisted address belongs to an identifiable host.
#[async_trait]
pub trait HostVerifier: Send + Sync {
    /// `true` only when the address verifies; any doubt yields `false`.
    async fn verify(&self, ip: &str) -> bool;
}

/// Verifier backed by a fixed set of known-good addresses.
#[derive(Debug, Default, Clone)]
pub struct StaticVerifier {
    legit: HashSet<String>,
}

impl StaticVerifier {
    pub fn new<I, S>(legit: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            legit: legit.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl HostVerifier for StaticVerifier {
    async fn verify(&self, ip: &str) -> bool {
        self.legit.contains(ip)
    }
}
