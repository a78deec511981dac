//! Session manager: binds requests to sessions and drives the auth state machine.
//!
//! Every public operation that touches the backend runs under one coarse
//! async mutex, so a cookie write and the backend write it depends on are
//! never interleaved with another request's. The blacklist sweep is the
//! exception: it only touches blacklist entries and may spend seconds in DNS.

use axum::http::header::SET_COOKIE;
use axum::http::{Extensions, HeaderMap, HeaderValue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::{MissedTickBehavior, interval};

use super::registry::{BackendRegistry, Provider};
use super::{AnyBackend, AuthCode, Session, SessionBackend, SessionState, cookie, id};
use crate::config::Config;
use crate::error::{BackendError, SessionError};
use crate::ocsf;

/// Request header carrying a session state.
pub const SESSION_STATE_HEADER: &str = "x-session-state";

pub struct SessionManager {
    config: Config,
    provider: Provider,
    backend: Arc<AnyBackend>,
    lock: Mutex<()>,
}

impl SessionManager {
    /// Build a manager over the backend registered for `provider`.
    pub fn new(
        provider: Provider,
        config: Config,
        registry: &BackendRegistry,
    ) -> Result<Self, SessionError> {
        let backend = registry
            .get(provider)
            .ok_or_else(|| SessionError::UnknownProvider(provider.to_string()))?;
        config.validate(provider)?;

        tracing::info!(
            provider = %provider,
            cookie = %config.cookie_name,
            visit_cookie = config.visit_cookie_name.as_deref().unwrap_or("-"),
            max_lifetime = config.max_lifetime,
            "session manager ready"
        );
        Ok(Self {
            config,
            provider,
            backend,
            lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Resolve the request's session, creating one when needed.
    ///
    /// Without a cookie a new id is minted. With a cookie the record is found
    /// or recreated under the same id. Whenever a record is created, a
    /// `Set-Cookie` binding it is appended to `response`.
    pub async fn acquire(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
    ) -> Result<Session, SessionError> {
        let _guard = self.lock.lock().await;

        let session = match cookie::session_id(request, &self.config.cookie_name) {
            None => {
                let sid = id::generate();
                self.backend
                    .new_session(&sid)
                    .await
                    .map_err(|e| SessionError::backend("new_session", &sid, e))?
            }
            Some(sid) => self
                .backend
                .find_or_create(&sid)
                .await
                .map_err(|e| SessionError::backend("find_or_create", &sid, e))?,
        };

        if session.is_fresh() {
            self.bind_cookie(response, session.id())?;
            ocsf::session_event(ocsf::ACTIVITY_OTHER, session.id(), "Session created");
        }
        Ok(session)
    }

    /// Remove the request's session and invalidate the client cookie.
    pub async fn destroy(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
    ) -> Result<(), SessionError> {
        let sid = self.require_sid(request)?;
        let _guard = self.lock.lock().await;

        self.backend
            .destroy_sid(&sid)
            .await
            .map_err(|e| SessionError::backend("destroy_sid", &sid, e))?;
        append_cookie(response, cookie::make_delete_cookie(&self.config.cookie_name))?;

        ocsf::session_event(ocsf::ACTIVITY_LOGOFF, &sid, "Session destroyed");
        Ok(())
    }

    /// Whether the cookie refers to a live session.
    pub async fn exists(&self, request: &HeaderMap) -> bool {
        let Some(sid) = cookie::session_id(request, &self.config.cookie_name) else {
            return false;
        };
        let _guard = self.lock.lock().await;
        self.backend.exists(&sid).await
    }

    /// Write the state carried in `X-Session-State` to the request's session.
    pub async fn change_state(&self, request: &HeaderMap) -> Result<bool, SessionError> {
        let state = request
            .get(SESSION_STATE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SessionError::MissingState)?;
        let sid = self.require_sid(request)?;
        let _guard = self.lock.lock().await;

        self.backend
            .update_session_state(&sid, state)
            .await
            .map_err(|e| map_backend("update_session_state", &sid, e))?;
        tracing::debug!(sid = %sid, state, "session state changed");
        Ok(true)
    }

    /// Authenticate the request's session under a fresh id.
    ///
    /// The old record is destroyed before the new one is created, so a
    /// failure part-way leaves the client without a session rather than
    /// with a pre-login id carrying tokens.
    pub async fn session_auth(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
        at: &str,
        rt: &str,
        uid: &str,
    ) -> Result<Session, SessionError> {
        let old_sid = self.require_sid(request)?;
        let _guard = self.lock.lock().await;

        if !self.backend.exists(&old_sid).await {
            return Err(SessionError::InvalidSessionId);
        }
        self.backend
            .destroy_sid(&old_sid)
            .await
            .map_err(|e| SessionError::backend("destroy_sid", &old_sid, e))?;

        let sid = id::generate();
        let mut session = self
            .backend
            .new_session(&sid)
            .await
            .map_err(|e| SessionError::backend("new_session", &sid, e))?;
        self.backend
            .update_auth_session(&sid, at, rt, uid)
            .await
            .map_err(|e| SessionError::backend("update_auth_session", &sid, e))?;
        session.attrs.apply_tokens(at, rt, uid);

        self.bind_cookie(response, &sid)?;
        ocsf::authentication_event(&old_sid, &sid, uid);
        Ok(session)
    }

    /// Read one attribute of an existing session.
    pub async fn get_auth_session_attribute(
        &self,
        request: &HeaderMap,
        name: &str,
    ) -> Result<Option<serde_json::Value>, SessionError> {
        let sid = self.require_sid(request)?;
        let _guard = self.lock.lock().await;

        if !self.backend.exists(&sid).await {
            return Err(SessionError::InvalidSessionId);
        }
        self.backend
            .get_attribute(&sid, name)
            .await
            .map_err(|e| map_backend("get_attribute", &sid, e))
    }

    /// Attribute of the session bound to the request, as a string.
    ///
    /// Reads the snapshot the middleware stored in `extensions`; empty when
    /// there is no session or no such attribute.
    pub fn get_auth_sess_at(extensions: &Extensions, name: &str) -> String {
        match extensions.get::<Session>().and_then(|s| s.get(name)) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Blacklist `ip`; the audit event is emitted only once the entry is stored.
    pub async fn add_blacklisting(&self, ip: &str, path: &str, details: serde_json::Value) -> bool {
        let _guard = self.lock.lock().await;
        let listed = self.backend.blacklisting(ip, path, details).await;
        if listed {
            ocsf::blacklist_event(ip, true, "IP added to blacklist");
        }
        listed
    }

    pub async fn is_blacklisted(&self, ip: &str) -> bool {
        let _guard = self.lock.lock().await;
        self.backend.is_ip_exist_in_bl(ip).await
    }

    pub async fn active_sessions(&self) -> usize {
        let _guard = self.lock.lock().await;
        self.backend.active_sessions().await
    }

    pub async fn update_code_verifier(&self, sid: &str, verifier: &str) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        self.backend
            .update_code_verifier(sid, verifier)
            .await
            .map_err(|e| map_backend("update_code_verifier", sid, e))
    }

    /// Save the authorization request and move the session to `InAuth`.
    pub async fn save_aca(
        &self,
        sid: &str,
        challenge: &str,
        method: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        self.backend
            .save_code_challenge_and_method(sid, challenge, method, code, redirect_uri)
            .await
            .map_err(|e| map_backend("save_code_challenge_and_method", sid, e))?;
        tracing::debug!(sid, "authorization code issued");
        Ok(())
    }

    pub async fn get_auth_code(&self, sid: &str) -> AuthCode {
        let _guard = self.lock.lock().await;
        self.backend.get_auth_code(sid).await
    }

    /// Reap sessions idle for longer than the configured lifetime.
    pub async fn gc(&self) {
        let _guard = self.lock.lock().await;
        self.backend.session_gc(self.config.max_lifetime).await;
    }

    /// Sweep the blacklist for rehabilitated addresses.
    pub async fn blc(&self) {
        self.backend.bl_clean().await;
    }

    /// Spawn the GC and blacklist-clean workers.
    ///
    /// Send `true` on the returned channel (or drop it) to stop both.
    pub fn start_maintenance(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let gc_period = Duration::from_secs(self.config.max_lifetime.max(1) as u64);
        let manager = Arc::clone(self);
        tokio::spawn(run_periodic("session-gc", gc_period, shutdown_rx.clone(), move || {
            let manager = Arc::clone(&manager);
            async move { manager.gc().await }
        }));

        let blc_period = Duration::from_secs(self.config.bl_clean_interval_secs());
        let manager = Arc::clone(self);
        tokio::spawn(run_periodic("blacklist-clean", blc_period, shutdown_rx, move || {
            let manager = Arc::clone(&manager);
            async move { manager.blc().await }
        }));

        shutdown_tx
    }

    /// State of the request's session without creating one.
    pub async fn current_state(&self, request: &HeaderMap) -> Option<SessionState> {
        let sid = cookie::session_id(request, &self.config.cookie_name)?;
        let _guard = self.lock.lock().await;
        if !self.backend.exists(&sid).await {
            return None;
        }
        match self.backend.get_attribute(&sid, super::keys::STATE).await {
            Ok(Some(serde_json::Value::String(s))) => Some(SessionState::from(s.as_str())),
            Ok(_) => Some(SessionState::New),
            Err(e) => {
                tracing::warn!(sid = %sid, error = %e, "state lookup failed");
                None
            }
        }
    }

    fn require_sid(&self, request: &HeaderMap) -> Result<String, SessionError> {
        cookie::session_id(request, &self.config.cookie_name).ok_or(SessionError::UnknownSessionId)
    }

    fn bind_cookie(&self, response: &mut HeaderMap, sid: &str) -> Result<(), SessionError> {
        append_cookie(
            response,
            cookie::make_set_cookie(&self.config.cookie_name, sid, self.config.max_lifetime),
        )
    }
}

/// Tick `task` every `period` until shutdown is signalled.
async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tracing::info!(worker = name, period_secs = period.as_secs(), "maintenance worker started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => task().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!(worker = name, "maintenance worker stopped");
}

fn append_cookie(headers: &mut HeaderMap, cookie: String) -> Result<(), SessionError> {
    let value = HeaderValue::from_str(&cookie).map_err(|e| {
        SessionError::InvalidConfiguration(format!("cookie is not a valid header value: {e}"))
    })?;
    headers.append(SET_COOKIE, value);
    Ok(())
}

/// Backend errors on an id the client sent: not-found means a bad id.
fn map_backend(op: &'static str, sid: &str, err: BackendError) -> SessionError {
    if err.is_not_found() {
        SessionError::InvalidSessionId
    } else {
        SessionError::backend(op, sid, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::{QUARANTINE_SECS, StaticVerifier};
    use crate::clock::ManualClock;
    use crate::session::keys;
    use crate::session::memory::InMemoryBackend;
    use axum::http::header::COOKIE;
    use serde_json::json;

    const T0: i64 = 1_700_000_000;

    fn manager_with(config: Config) -> (SessionManager, ManualClock) {
        let clock = ManualClock::new(T0);
        let backend = InMemoryBackend::with_max_lifetime(config.max_lifetime)
            .with_clock(Arc::new(clock.clone()))
            .with_verifier(Arc::new(StaticVerifier::new(["66.249.66.1"])));
        let mut registry = BackendRegistry::new();
        registry.register(Provider::Memory, AnyBackend::Memory(backend));
        let manager = SessionManager::new(Provider::Memory, config, &registry).unwrap();
        (manager, clock)
    }

    fn manager() -> (SessionManager, ManualClock) {
        manager_with(Config::test_default())
    }

    /// `Cookie` request headers replaying the value of a `Set-Cookie`.
    fn replay(response: &HeaderMap) -> HeaderMap {
        let set_cookie = response
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .find(|v| v.starts_with("ivmid="))
            .expect("session cookie");
        let pair = set_cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(pair).unwrap());
        headers
    }

    fn cookie_for(sid: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&format!("ivmid={sid}")).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_cookieless_request_creates_session_and_cookie() {
        let (manager, _) = manager();
        let mut response = HeaderMap::new();
        let session = manager.acquire(&HeaderMap::new(), &mut response).await.unwrap();

        assert_eq!(session.id().len(), id::ENCODED_LEN);
        assert_eq!(session.state(), SessionState::New);
        assert_eq!(
            response[SET_COOKIE],
            format!(
                "ivmid={}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=3600",
                session.id()
            )
        );
        assert_eq!(manager.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_cookie_round_trip_returns_same_session() {
        let (manager, _) = manager();
        let mut first = HeaderMap::new();
        let created = manager.acquire(&HeaderMap::new(), &mut first).await.unwrap();

        let mut second = HeaderMap::new();
        let found = manager.acquire(&replay(&first), &mut second).await.unwrap();
        assert_eq!(found.id(), created.id());
        assert!(!found.is_fresh());
        assert!(second.get(SET_COOKIE).is_none());
        assert_eq!(manager.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_cookie_recreates_under_same_id() {
        let (manager, _) = manager();
        let request = cookie_for("...xxx...");
        assert!(!manager.exists(&request).await);

        let mut response = HeaderMap::new();
        let session = manager.acquire(&request, &mut response).await.unwrap();
        assert_eq!(session.id(), "...xxx...");
        assert_eq!(session.state(), SessionState::New);
        assert!(response[SET_COOKIE].to_str().unwrap().starts_with("ivmid=...xxx...;"));
        assert!(manager.exists(&request).await);
    }

    #[tokio::test]
    async fn test_authorization_code_expires() {
        let (manager, clock) = manager();
        let mut response = HeaderMap::new();
        let session = manager.acquire(&HeaderMap::new(), &mut response).await.unwrap();
        let sid = session.id();

        manager.update_code_verifier(sid, "verifier").await.unwrap();
        manager
            .save_aca(sid, "CH", "S256", "AC", "https://app/cb")
            .await
            .unwrap();
        let request = replay(&response);
        assert_eq!(manager.current_state(&request).await, Some(SessionState::InAuth));

        let code = manager.get_auth_code(sid).await;
        let expected: AuthCode = [
            ("auth_code", "AC"),
            ("code_challenger", "CH"),
            ("code_challenger_method", "S256"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(code, expected);

        clock.advance(61);
        assert!(manager.get_auth_code(sid).await.is_empty());
    }

    #[tokio::test]
    async fn test_session_auth_rotates_id() {
        let (manager, _) = manager();
        let mut response = HeaderMap::new();
        let old = manager.acquire(&HeaderMap::new(), &mut response).await.unwrap();
        manager
            .save_aca(old.id(), "CH", "S256", "AC", "https://app/cb")
            .await
            .unwrap();
        let old_request = replay(&response);

        let mut auth_response = HeaderMap::new();
        let authed = manager
            .session_auth(&old_request, &mut auth_response, "at1", "rt1", "u42")
            .await
            .unwrap();

        assert_ne!(authed.id(), old.id());
        assert!(!manager.exists(&old_request).await);

        let new_request = replay(&auth_response);
        assert!(manager.exists(&new_request).await);
        assert_eq!(manager.current_state(&new_request).await, Some(SessionState::Authed));
        for (key, expected) in [(keys::ACCESS_TOKEN, "at1"), (keys::REFRESH_TOKEN, "rt1"), (keys::USER_ID, "u42")] {
            assert_eq!(
                manager.get_auth_session_attribute(&new_request, key).await.unwrap(),
                Some(json!(expected))
            );
        }
        assert_eq!(manager.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_session_auth_requires_existing_session() {
        let (manager, _) = manager();
        let mut response = HeaderMap::new();
        let err = manager
            .session_auth(&HeaderMap::new(), &mut response, "a", "r", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownSessionId));

        let err = manager
            .session_auth(&cookie_for("ghost"), &mut response, "a", "r", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidSessionId));
        assert!(response.get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_destroy_invalidates_cookie() {
        let (manager, _) = manager();
        let mut response = HeaderMap::new();
        manager.acquire(&HeaderMap::new(), &mut response).await.unwrap();
        let request = replay(&response);

        let mut logout = HeaderMap::new();
        manager.destroy(&request, &mut logout).await.unwrap();
        assert!(!manager.exists(&request).await);
        let cookie = logout[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("ivmid=;"));
        assert!(cookie.contains("Max-Age=0"));

        // Destroying again is still fine
        assert!(manager.destroy(&request, &mut logout).await.is_ok());
        assert!(matches!(
            manager.destroy(&HeaderMap::new(), &mut logout).await,
            Err(SessionError::UnknownSessionId)
        ));
    }

    #[tokio::test]
    async fn test_change_state() {
        let (manager, _) = manager();
        let mut response = HeaderMap::new();
        manager.acquire(&HeaderMap::new(), &mut response).await.unwrap();
        let mut request = replay(&response);

        assert!(matches!(
            manager.change_state(&request).await,
            Err(SessionError::MissingState)
        ));
        request.insert(SESSION_STATE_HEADER, HeaderValue::from_static(""));
        assert!(matches!(
            manager.change_state(&request).await,
            Err(SessionError::MissingState)
        ));

        request.insert(SESSION_STATE_HEADER, HeaderValue::from_static("Locked"));
        assert!(manager.change_state(&request).await.unwrap());
        assert_eq!(
            manager.current_state(&request).await,
            Some(SessionState::Other("Locked".into()))
        );

        let mut ghost = cookie_for("ghost");
        ghost.insert(SESSION_STATE_HEADER, HeaderValue::from_static("Authed"));
        assert!(matches!(
            manager.change_state(&ghost).await,
            Err(SessionError::InvalidSessionId)
        ));
    }

    #[tokio::test]
    async fn test_attribute_access_guards() {
        let (manager, _) = manager();
        assert!(matches!(
            manager.get_auth_session_attribute(&HeaderMap::new(), "uid").await,
            Err(SessionError::UnknownSessionId)
        ));
        assert!(matches!(
            manager.get_auth_session_attribute(&cookie_for("ghost"), "uid").await,
            Err(SessionError::InvalidSessionId)
        ));
    }

    #[tokio::test]
    async fn test_get_auth_sess_at_reads_bound_session() {
        let mut extensions = Extensions::new();
        assert_eq!(SessionManager::get_auth_sess_at(&extensions, "uid"), "");

        let mut session = Session::new("sid", T0);
        session.attrs.apply_tokens("at1", "rt1", "u42");
        session.attrs.set("visits", json!(3));
        extensions.insert(session);
        assert_eq!(SessionManager::get_auth_sess_at(&extensions, "uid"), "u42");
        assert_eq!(SessionManager::get_auth_sess_at(&extensions, "visits"), "3");
        assert_eq!(SessionManager::get_auth_sess_at(&extensions, "missing"), "");
    }

    #[tokio::test]
    async fn test_gc_reaps_expired_sessions() {
        let mut config = Config::test_default();
        config.max_lifetime = 1;
        let (manager, clock) = manager_with(config);
        let mut response = HeaderMap::new();
        manager.acquire(&HeaderMap::new(), &mut response).await.unwrap();
        let request = replay(&response);

        clock.advance(2);
        manager.gc().await;
        assert!(!manager.exists(&request).await);
        assert_eq!(manager.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_blacklist_pass_through() {
        let (manager, clock) = manager();
        assert!(
            manager
                .add_blacklisting("66.249.66.1", "/wp-login.php", json!({"hits": 12}))
                .await
        );
        assert!(manager.is_blacklisted("66.249.66.1").await);
        assert!(!manager.is_blacklisted("10.0.0.1").await);

        clock.advance(QUARANTINE_SECS + 1);
        manager.blc().await;
        assert!(!manager.is_blacklisted("66.249.66.1").await);
    }

    #[test]
    fn test_unregistered_provider_is_rejected() {
        let registry = BackendRegistry::new();
        let err = SessionManager::new(Provider::RemoteKv, Config::test_default(), &registry)
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::UnknownProvider(_)));
        assert!(matches!(
            Provider::try_from(42u8),
            Err(SessionError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_empty_cookie_name_is_invalid() {
        let mut registry = BackendRegistry::new();
        registry.register(Provider::Memory, AnyBackend::Memory(InMemoryBackend::new()));
        let mut config = Config::test_default();
        config.cookie_name.clear();
        let err = SessionManager::new(Provider::Memory, config, &registry)
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::InvalidConfiguration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_workers_tick_and_stop() {
        let mut config = Config::test_default();
        config.max_lifetime = 5;
        let (manager, clock) = manager_with(config);
        let manager = Arc::new(manager);
        let mut response = HeaderMap::new();
        manager.acquire(&HeaderMap::new(), &mut response).await.unwrap();

        let shutdown = manager.start_maintenance();
        clock.advance(10);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(manager.active_sessions().await, 0);

        shutdown.send(true).unwrap();
        tokio::task::yield_now().await;
    }
}
