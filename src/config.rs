//! Session manager configuration via environment variables.

use std::env;

use crate::error::SessionError;
use crate::session::registry::Provider;

/// Default period of the blacklist sweep, in seconds.
pub const DEFAULT_BL_CLEAN_INTERVAL: i64 = 3600;

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub cookie_name: String,
    /// Seconds of inactivity after which a session expires.
    pub max_lifetime: i64,
    pub visit_cookie_name: Option<String>,
    pub project_id: String,
    /// Seconds between blacklist sweeps; `0` falls back to the default.
    pub bl_clean_interval: i64,
    pub session_backend: Provider,
    pub session_collection: String,
    pub blacklist_collection: String,
    pub dynamodb_endpoint: String,
    /// Reverse proxies in front of the service that append to `X-Forwarded-For`.
    /// With `0` the client address is the socket peer.
    pub trusted_proxy_hops: usize,
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required: `COOKIE_NAME`. `PROJECT_ID` becomes required once
    /// `SESSION_BACKEND=dynamodb` (checked by [`Config::validate`]).
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SessionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cookie_name = lookup("COOKIE_NAME")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SessionError::InvalidConfiguration("COOKIE_NAME is required".into()))?;

        let session_backend = match lookup("SESSION_BACKEND") {
            Some(name) => name.parse()?,
            None => Provider::Memory,
        };

        Ok(Self {
            cookie_name,
            max_lifetime: parse_or(&lookup, "MAX_LIFETIME", 3600)?,
            visit_cookie_name: lookup("VISIT_COOKIE_NAME").filter(|v| !v.is_empty()),
            project_id: lookup("PROJECT_ID").unwrap_or_default(),
            bl_clean_interval: parse_or(&lookup, "BL_CLEAN_INTERVAL", DEFAULT_BL_CLEAN_INTERVAL)?,
            session_backend,
            session_collection: lookup("SESSION_COLLECTION_NAME")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "sessions".into()),
            blacklist_collection: lookup("BLACKLIST_COLLECTION_NAME")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "blacklist".into()),
            dynamodb_endpoint: lookup("DYNAMODB_ENDPOINT").unwrap_or_default(),
            trusted_proxy_hops: parse_or(&lookup, "TRUSTED_PROXY_HOPS", 0)?,
            port: parse_or(&lookup, "PORT", 3001)?,
        })
    }

    /// Check the configuration against the selected backend.
    pub fn validate(&self, provider: Provider) -> Result<(), SessionError> {
        if self.cookie_name.is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "cookie name must not be empty".into(),
            ));
        }
        if self.max_lifetime <= 0 {
            return Err(SessionError::InvalidConfiguration(
                "max lifetime must be positive".into(),
            ));
        }
        if provider == Provider::DocumentStore && self.project_id.is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "project id is required for the document store".into(),
            ));
        }
        Ok(())
    }

    /// Blacklist sweep period, applying the default for `0`.
    pub fn bl_clean_interval_secs(&self) -> u64 {
        if self.bl_clean_interval <= 0 {
            DEFAULT_BL_CLEAN_INTERVAL as u64
        } else {
            self.bl_clean_interval as u64
        }
    }

    /// DynamoDB table holding session documents.
    pub fn session_table(&self) -> String {
        format!("{}-{}", self.project_id, self.session_collection)
    }

    /// DynamoDB table holding blacklist documents.
    pub fn blacklist_table(&self) -> String {
        format!("{}-{}", self.project_id, self.blacklist_collection)
    }
}

/// Configuration for testing; all fields settable directly.
impl Config {
    pub fn test_default() -> Self {
        Self {
            cookie_name: "ivmid".into(),
            max_lifetime: 3600,
            visit_cookie_name: Some("iv".into()),
            project_id: "test-project".into(),
            bl_clean_interval: DEFAULT_BL_CLEAN_INTERVAL,
            session_backend: Provider::Memory,
            session_collection: "sessions".into(),
            blacklist_collection: "blacklist".into(),
            dynamodb_endpoint: String::new(),
            trusted_proxy_hops: 0,
            port: 3001,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, SessionError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| SessionError::InvalidConfiguration(format!("{key} has invalid value {raw:?}"))),
        _ => Ok(default),
    }
}
