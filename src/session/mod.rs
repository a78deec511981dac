//! Server-side session management.
//!
//! Provides the `SessionBackend` trait for pluggable storage, the session
//! record and its attribute map, and the in-memory and DynamoDB backends.

pub mod cookie;
pub mod dynamodb;
pub mod id;
pub mod manager;
pub mod memory;
pub mod middleware;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use crate::error::BackendError;

/// Recognized attribute keys.
pub mod keys {
    pub const STATE: &str = "state";
    pub const CODE_VERIFIER: &str = "code_verifier";
    pub const CODE_CHALLENGER: &str = "code_challenger";
    pub const CODE_CHALLENGER_METHOD: &str = "code_challenger_method";
    pub const AUTH_CODE: &str = "auth_code";
    pub const CODE_EXPIRE: &str = "code_expire";
    pub const REDIRECT_URI: &str = "redirect_uri";
    pub const ACCESS_TOKEN: &str = "at";
    pub const REFRESH_TOKEN: &str = "rt";
    pub const USER_ID: &str = "uid";
}

/// Seconds an issued authorization code stays usable.
pub const AUTH_CODE_TTL_SECS: i64 = 60;

/// Result of [`SessionBackend::get_auth_code`]: `auth_code`,
/// `code_challenger` and `code_challenger_method`, or empty.
pub type AuthCode = HashMap<String, String>;

/// Position of a session in the authorization flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    New,
    InAuth,
    Authed,
    /// Any other value written through `update_session_state`.
    Other(String),
}

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::New => "New",
            SessionState::InAuth => "InAuth",
            SessionState::Authed => "Authed",
            SessionState::Other(s) => s,
        }
    }
}

impl From<&str> for SessionState {
    fn from(value: &str) -> Self {
        match value {
            "New" | "new" => SessionState::New,
            "InAuth" => SessionState::InAuth,
            "Authed" => SessionState::Authed,
            other => SessionState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session attributes stored server-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionData {
    #[serde(flatten)]
    pub data: HashMap<String, serde_json::Value>,
}

impl SessionData {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Attributes of a freshly created session.
    pub fn initial() -> Self {
        let mut data = Self::new();
        data.set(keys::STATE, SessionState::New.as_str().into());
        data
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// String attribute; `None` when absent or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Integer attribute; `None` when absent or not an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_i64())
    }

    pub fn state(&self) -> Option<SessionState> {
        self.get_str(keys::STATE).map(SessionState::from)
    }

    pub fn code_verifier(&self) -> Option<&str> {
        self.get_str(keys::CODE_VERIFIER)
    }

    pub fn code_challenger(&self) -> Option<&str> {
        self.get_str(keys::CODE_CHALLENGER)
    }

    pub fn code_challenger_method(&self) -> Option<&str> {
        self.get_str(keys::CODE_CHALLENGER_METHOD)
    }

    pub fn auth_code(&self) -> Option<&str> {
        self.get_str(keys::AUTH_CODE)
    }

    pub fn code_expire(&self) -> Option<i64> {
        self.get_i64(keys::CODE_EXPIRE)
    }

    pub fn redirect_uri(&self) -> Option<&str> {
        self.get_str(keys::REDIRECT_URI)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.get_str(keys::ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.get_str(keys::REFRESH_TOKEN)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get_str(keys::USER_ID)
    }

    /// Write the code challenge attributes and move to `InAuth`.
    pub fn apply_code_challenge(
        &mut self,
        challenge: &str,
        method: &str,
        code: &str,
        redirect_uri: &str,
        code_expire: i64,
    ) {
        self.set(keys::CODE_CHALLENGER, challenge.into());
        self.set(keys::CODE_CHALLENGER_METHOD, method.into());
        self.set(keys::AUTH_CODE, code.into());
        self.set(keys::CODE_EXPIRE, code_expire.into());
        self.set(keys::REDIRECT_URI, redirect_uri.into());
        self.set(keys::STATE, SessionState::InAuth.as_str().into());
    }

    /// Write the token set and move to `Authed`.
    pub fn apply_tokens(&mut self, at: &str, rt: &str, uid: &str) {
        self.set(keys::ACCESS_TOKEN, at.into());
        self.set(keys::REFRESH_TOKEN, rt.into());
        self.set(keys::USER_ID, uid.into());
        self.set(keys::STATE, SessionState::Authed.as_str().into());
    }

    /// The usable authorization code, if the session is `InAuth` and the
    /// code deadline is strictly in the future.
    pub fn auth_code_at(&self, now: i64) -> AuthCode {
        let mut out = AuthCode::new();
        if self.state() != Some(SessionState::InAuth) {
            return out;
        }
        if !self.code_expire().is_some_and(|deadline| deadline > now) {
            return out;
        }
        if let (Some(code), Some(challenge), Some(method)) = (
            self.auth_code(),
            self.code_challenger(),
            self.code_challenger_method(),
        ) {
            out.insert(keys::AUTH_CODE.into(), code.into());
            out.insert(keys::CODE_CHALLENGER.into(), challenge.into());
            out.insert(keys::CODE_CHALLENGER_METHOD.into(), method.into());
        }
        out
    }
}

/// A session record as returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    /// Seconds since the Unix epoch.
    pub last_accessed: i64,
    pub attrs: SessionData,
    fresh: bool,
}

impl Session {
    /// A new record in state `New`.
    pub fn new(id: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            last_accessed: now,
            attrs: SessionData::initial(),
            fresh: true,
        }
    }

    /// A record loaded from storage.
    pub fn existing(id: impl Into<String>, last_accessed: i64, attrs: SessionData) -> Self {
        Self {
            id: id.into(),
            last_accessed,
            attrs,
            fresh: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn last_accessed(&self) -> i64 {
        self.last_accessed
    }

    /// Whether the backend created this record during the call that returned it.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Current state; a record without one reads as `New`.
    pub fn state(&self) -> SessionState {
        self.attrs.state().unwrap_or(SessionState::New)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.attrs.get(key)
    }

    pub fn is_expired(&self, now: i64, max_lifetime: i64) -> bool {
        now - self.last_accessed > max_lifetime
    }
}

/// Pluggable session storage backend.
///
/// Since the trait uses RPITIT it is not object-safe; [`AnyBackend`]
/// dispatches manually. Every future may be dropped to cancel the
/// outstanding I/O.
pub trait SessionBackend: Send + Sync {
    /// Persist a new record under `sid` with state `New`.
    fn new_session(
        &self,
        sid: &str,
    ) -> impl Future<Output = Result<Session, BackendError>> + Send;

    /// Return the live record and refresh its access time, or create a
    /// fresh one under the same id.
    fn find_or_create(
        &self,
        sid: &str,
    ) -> impl Future<Output = Result<Session, BackendError>> + Send;

    /// Whether a live (non-expired) record exists. Never fails.
    fn exists(&self, sid: &str) -> impl Future<Output = bool> + Send;

    /// Remove a record. Removing an absent id succeeds.
    fn destroy_sid(&self, sid: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Delete every record idle for longer than `max_lifetime` seconds.
    /// Failures are logged, never returned.
    fn session_gc(&self, max_lifetime: i64) -> impl Future<Output = ()> + Send;

    /// Set the access time to now. No-op for an absent id.
    fn update_time_accessed(
        &self,
        sid: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn update_session_state(
        &self,
        sid: &str,
        state: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn update_code_verifier(
        &self,
        sid: &str,
        verifier: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Atomically store challenge, method, code, redirect uri, a code
    /// deadline of now + 60s, and state `InAuth`.
    fn save_code_challenge_and_method(
        &self,
        sid: &str,
        challenge: &str,
        method: &str,
        code: &str,
        redirect_uri: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// The usable authorization code, or an empty map on any failure.
    fn get_auth_code(&self, sid: &str) -> impl Future<Output = AuthCode> + Send;

    /// Atomically store the token set and state `Authed`.
    fn update_auth_session(
        &self,
        sid: &str,
        at: &str,
        rt: &str,
        uid: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Number of live records.
    fn active_sessions(&self) -> impl Future<Output = usize> + Send;

    /// Remove every record.
    fn flush(&self) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Read one attribute, refreshing the access time.
    fn get_attribute(
        &self,
        sid: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, BackendError>> + Send;

    /// Write one attribute, refreshing the access time.
    fn set_attribute(
        &self,
        sid: &str,
        key: &str,
        value: serde_json::Value,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Remove one attribute, refreshing the access time.
    fn delete_attribute(
        &self,
        sid: &str,
        key: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Upsert a blacklist entry created now; `false` when the write failed.
    fn blacklisting(
        &self,
        ip: &str,
        path: &str,
        details: serde_json::Value,
    ) -> impl Future<Output = bool> + Send;

    fn is_ip_exist_in_bl(&self, ip: &str) -> impl Future<Output = bool> + Send;

    /// Retire quarantined entries whose reverse and forward DNS agree.
    fn bl_clean(&self) -> impl Future<Output = ()> + Send;
}

/// Type-erased session backend supporting both InMemory and DynamoDB.
pub enum AnyBackend {
    Memory(memory::InMemoryBackend),
    DynamoDb(dynamodb::DynamoDbBackend),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            AnyBackend::Memory($b) => $call,
            AnyBackend::DynamoDb($b) => $call,
        }
    };
}

impl SessionBackend for AnyBackend {
    async fn new_session(&self, sid: &str) -> Result<Session, BackendError> {
        dispatch!(self, b => b.new_session(sid).await)
    }

    async fn find_or_create(&self, sid: &str) -> Result<Session, BackendError> {
        dispatch!(self, b => b.find_or_create(sid).await)
    }

    async fn exists(&self, sid: &str) -> bool {
        dispatch!(self, b => b.exists(sid).await)
    }

    async fn destroy_sid(&self, sid: &str) -> Result<(), BackendError> {
        dispatch!(self, b => b.destroy_sid(sid).await)
    }

    async fn session_gc(&self, max_lifetime: i64) {
        dispatch!(self, b => b.session_gc(max_lifetime).await)
    }

    async fn update_time_accessed(&self, sid: &str) -> Result<(), BackendError> {
        dispatch!(self, b => b.update_time_accessed(sid).await)
    }

    async fn update_session_state(&self, sid: &str, state: &str) -> Result<(), BackendError> {
        dispatch!(self, b => b.update_session_state(sid, state).await)
    }

    async fn update_code_verifier(&self, sid: &str, verifier: &str) -> Result<(), BackendError> {
        dispatch!(self, b => b.update_code_verifier(sid, verifier).await)
    }

    async fn save_code_challenge_and_method(
        &self,
        sid: &str,
        challenge: &str,
        method: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<(), BackendError> {
        dispatch!(self, b => b
            .save_code_challenge_and_method(sid, challenge, method, code, redirect_uri)
            .await)
    }

    async fn get_auth_code(&self, sid: &str) -> AuthCode {
        dispatch!(self, b => b.get_auth_code(sid).await)
    }

    async fn update_auth_session(
        &self,
        sid: &str,
        at: &str,
        rt: &str,
        uid: &str,
    ) -> Result<(), BackendError> {
        dispatch!(self, b => b.update_auth_session(sid, at, rt, uid).await)
    }

    async fn active_sessions(&self) -> usize {
        dispatch!(self, b => b.active_sessions().await)
    }

    async fn flush(&self) -> Result<(), BackendError> {
        dispatch!(self, b => b.flush().await)
    }

    async fn get_attribute(
        &self,
        sid: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, BackendError> {
        dispatch!(self, b => b.get_attribute(sid, key).await)
    }

    async fn set_attribute(
        &self,
        sid: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), BackendError> {
        dispatch!(self, b => b.set_attribute(sid, key, value).await)
    }

    async fn delete_attribute(&self, sid: &str, key: &str) -> Result<(), BackendError> {
        dispatch!(self, b => b.delete_attribute(sid, key).await)
    }

    async fn blacklisting(&self, ip: &str, path: &str, details: serde_json::Value) -> bool {
        dispatch!(self, b => b.blacklisting(ip, path, details).await)
    }

    async fn is_ip_exist_in_bl(&self, ip: &str) -> bool {
        dispatch!(self, b => b.is_ip_exist_in_bl(ip).await)
    }

    async fn bl_clean(&self) {
        dispatch!(self, b => b.bl_clean().await)
    }
}
