//! In-memory session backend for development and testing.
//!
//! Records live in an arena-allocated doubly linked list ordered by access
//! recency (most recent at the head) plus an id → slot index. Touching a
//! record moves it to the head, so expired records always collect at the
//! tail and GC stops at the first live one. A single mutex guards the list,
//! the index and the blacklist together.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use super::{AUTH_CODE_TTL_SECS, AuthCode, Session, SessionBackend, SessionData, keys};
use crate::blacklist::{BlacklistEntry, DnsVerifier, HostVerifier};
use crate::clock::{self, SharedClock};
use crate::error::BackendError;

const DEFAULT_MAX_LIFETIME: i64 = 3600;

struct Node {
    id: String,
    last_accessed: i64,
    attrs: SessionData,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Node {
    fn snapshot(&self) -> Session {
        Session::existing(self.id.clone(), self.last_accessed, self.attrs.clone())
    }
}

#[derive(Default)]
struct Store {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    blacklist: HashMap<String, BlacklistEntry>,
}

impl Store {
    fn slot(&self, idx: usize) -> Option<&Node> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Node> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.slot(idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev.and_then(|p| self.slot_mut(p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.slot_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
        if let Some(node) = self.slot_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.slot_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head.and_then(|h| self.slot_mut(h)) {
            Some(h) => h.prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.link_front(idx);
        }
    }

    fn remove(&mut self, idx: usize) -> Option<Node> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.index.remove(&node.id);
        Some(node)
    }

    /// Insert a fresh record at the head, replacing any record with the same id.
    fn insert(&mut self, session: &Session) {
        if let Some(&old) = self.index.get(&session.id) {
            self.remove(old);
        }
        let node = Node {
            id: session.id.clone(),
            last_accessed: session.last_accessed,
            attrs: session.attrs.clone(),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(session.id.clone(), idx);
        self.link_front(idx);
    }

    /// Slot of a record that has not outlived `max_lifetime`.
    fn live(&self, sid: &str, now: i64, max_lifetime: i64) -> Option<usize> {
        let idx = *self.index.get(sid)?;
        let node = self.slot(idx)?;
        (now - node.last_accessed <= max_lifetime).then_some(idx)
    }

    /// Refresh the access time (never backwards) and move to the head.
    fn touch(&mut self, idx: usize, now: i64) {
        if let Some(node) = self.slot_mut(idx) {
            node.last_accessed = node.last_accessed.max(now);
        }
        self.move_to_front(idx);
    }

    fn clear_sessions(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }
}

/// In-memory session store.
///
/// Records are lost on restart and not shared across processes.
pub struct InMemoryBackend {
    store: Mutex<Store>,
    max_lifetime: i64,
    clock: SharedClock,
    verifier: OnceLock<Arc<dyn HostVerifier>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_max_lifetime(DEFAULT_MAX_LIFETIME)
    }

    /// Backend treating records idle for more than `secs` as expired.
    pub fn with_max_lifetime(secs: i64) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            max_lifetime: secs,
            clock: clock::system(),
            verifier: OnceLock::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the DNS verifier used by the blacklist sweep.
    pub fn with_verifier(mut self, verifier: Arc<dyn HostVerifier>) -> Self {
        self.verifier = OnceLock::from(verifier);
        self
    }

    fn verifier(&self) -> &Arc<dyn HostVerifier> {
        self.verifier
            .get_or_init(|| Arc::new(DnsVerifier::new()) as Arc<dyn HostVerifier>)
    }

    fn now(&self) -> i64 {
        self.clock.now_secs()
    }

    /// Apply `f` to a live record after refreshing its access time.
    fn with_live<T>(
        &self,
        sid: &str,
        f: impl FnOnce(&mut SessionData) -> T,
    ) -> Result<T, BackendError> {
        let now = self.now();
        let mut store = self.store.lock();
        let idx = store
            .live(sid, now, self.max_lifetime)
            .ok_or_else(|| BackendError::NotFound(sid.to_string()))?;
        store.touch(idx, now);
        let node = store
            .slot_mut(idx)
            .ok_or_else(|| BackendError::NotFound(sid.to_string()))?;
        Ok(f(&mut node.attrs))
    }

    /// Number of records stored (including expired).
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.store.lock().index.len()
    }

    /// Ids from most to least recently accessed.
    #[cfg(test)]
    fn recency_order(&self) -> Vec<String> {
        let store = self.store.lock();
        let mut out = Vec::new();
        let mut cursor = store.head;
        while let Some(idx) = cursor {
            let node = store.slot(idx).unwrap();
            out.push(node.id.clone());
            cursor = node.next;
        }
        out
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for InMemoryBackend {
    async fn new_session(&self, sid: &str) -> Result<Session, BackendError> {
        let session = Session::new(sid, self.now());
        self.store.lock().insert(&session);
        Ok(session)
    }

    async fn find_or_create(&self, sid: &str) -> Result<Session, BackendError> {
        let now = self.now();
        let mut store = self.store.lock();
        if let Some(idx) = store.live(sid, now, self.max_lifetime) {
            store.touch(idx, now);
            if let Some(node) = store.slot(idx) {
                return Ok(node.snapshot());
            }
        }
        tracing::debug!(sid, "session not found, recreating under the same id");
        let session = Session::new(sid, now);
        store.insert(&session);
        Ok(session)
    }

    async fn exists(&self, sid: &str) -> bool {
        let now = self.now();
        self.store.lock().live(sid, now, self.max_lifetime).is_some()
    }

    async fn destroy_sid(&self, sid: &str) -> Result<(), BackendError> {
        let mut store = self.store.lock();
        if let Some(&idx) = store.index.get(sid) {
            store.remove(idx);
        }
        Ok(())
    }

    async fn session_gc(&self, max_lifetime: i64) {
        let now = self.now();
        let mut store = self.store.lock();
        let mut reaped = 0usize;
        while let Some(idx) = store.tail {
            let expired = store
                .slot(idx)
                .is_some_and(|n| n.last_accessed + max_lifetime < now);
            if !expired {
                break;
            }
            store.remove(idx);
            reaped += 1;
        }
        if reaped > 0 {
            tracing::debug!(reaped, "expired sessions removed");
        }
    }

    async fn update_time_accessed(&self, sid: &str) -> Result<(), BackendError> {
        let now = self.now();
        let mut store = self.store.lock();
        if let Some(idx) = store.live(sid, now, self.max_lifetime) {
            store.touch(idx, now);
        }
        Ok(())
    }

    async fn update_session_state(&self, sid: &str, state: &str) -> Result<(), BackendError> {
        self.with_live(sid, |attrs| attrs.set(keys::STATE, state.into()))
    }

    async fn update_code_verifier(&self, sid: &str, verifier: &str) -> Result<(), BackendError> {
        self.with_live(sid, |attrs| attrs.set(keys::CODE_VERIFIER, verifier.into()))
    }

    async fn save_code_challenge_and_method(
        &self,
        sid: &str,
        challenge: &str,
        method: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<(), BackendError> {
        let expire = self.now() + AUTH_CODE_TTL_SECS;
        self.with_live(sid, |attrs| {
            attrs.apply_code_challenge(challenge, method, code, redirect_uri, expire)
        })
    }

    async fn get_auth_code(&self, sid: &str) -> AuthCode {
        let now = self.now();
        self.with_live(sid, |attrs| attrs.auth_code_at(now))
            .unwrap_or_default()
    }

    async fn update_auth_session(
        &self,
        sid: &str,
        at: &str,
        rt: &str,
        uid: &str,
    ) -> Result<(), BackendError> {
        self.with_live(sid, |attrs| attrs.apply_tokens(at, rt, uid))
    }

    async fn active_sessions(&self) -> usize {
        let now = self.now();
        let store = self.store.lock();
        store
            .index
            .values()
            .filter_map(|&idx| store.slot(idx))
            .filter(|n| now - n.last_accessed <= self.max_lifetime)
            .count()
    }

    async fn flush(&self) -> Result<(), BackendError> {
        self.store.lock().clear_sessions();
        Ok(())
    }

    async fn get_attribute(
        &self,
        sid: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, BackendError> {
        self.with_live(sid, |attrs| attrs.get(key).cloned())
    }

    async fn set_attribute(
        &self,
        sid: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.with_live(sid, |attrs| attrs.set(key, value))
    }

    async fn delete_attribute(&self, sid: &str, key: &str) -> Result<(), BackendError> {
        self.with_live(sid, |attrs| attrs.remove(key))
    }

    async fn blacklisting(&self, ip: &str, path: &str, details: serde_json::Value) -> bool {
        let entry = BlacklistEntry::new(self.now(), path, details);
        self.store.lock().blacklist.insert(ip.to_string(), entry);
        tracing::info!(ip, path, "ip listed in the blacklist");
        true
    }

    async fn is_ip_exist_in_bl(&self, ip: &str) -> bool {
        self.store.lock().blacklist.contains_key(ip)
    }

    async fn bl_clean(&self) {
        let now = self.now();
        // DNS lookups happen outside the lock
        let candidates: Vec<(String, i64)> = self
            .store
            .lock()
            .blacklist
            .iter()
            .filter(|(_, entry)| entry.is_quarantine_over(now))
            .map(|(ip, entry)| (ip.clone(), entry.created))
            .collect();

        let reviewed = candidates.len();
        let mut deleted = 0usize;
        for (ip, created) in candidates {
            if !self.verifier().verify(&ip).await {
                continue;
            }
            let mut store = self.store.lock();
            // Skip entries re-listed while we were resolving
            if store.blacklist.get(&ip).is_some_and(|e| e.created == created) {
                store.blacklist.remove(&ip);
                deleted += 1;
                crate::ocsf::blacklist_event(&ip, false, "IP rehabilitated after DNS verification");
            }
        }
        tracing::info!(reviewed, deleted, "blacklist clean summary");
    }
}
