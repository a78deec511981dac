//! DynamoDB session backend for production deployments.
//!
//! Session table (`{project}-{sessions}`):
//! - `Sid` (S): partition key
//! - `TimeAccessed` (N): Unix seconds of the last access
//! - `Value` (M): session attributes, one map entry per key
//!
//! Blacklist table (`{project}-{blacklist}`):
//! - `ip` (S): partition key
//! - `created` (N), `requestURI` (S), `details` (S, JSON-encoded)
//!
//! Single-attribute writes address `Value.<key>` directly so concurrent
//! writers to different keys never overwrite each other.

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, Select};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use super::{AUTH_CODE_TTL_SECS, AuthCode, Session, SessionBackend, SessionData, keys};
use crate::blacklist::{BlacklistEntry, DnsVerifier, HostVerifier, QUARANTINE_SECS};
use crate::clock::{self, SharedClock};
use crate::error::BackendError;

const SID: &str = "Sid";
const TIME_ACCESSED: &str = "TimeAccessed";
const VALUE: &str = "Value";

const BL_IP: &str = "ip";
const BL_CREATED: &str = "created";
const BL_REQUEST_URI: &str = "requestURI";
const BL_DETAILS: &str = "details";

const DEFAULT_MAX_LIFETIME: i64 = 3600;

type Item = HashMap<String, AttributeValue>;

/// DynamoDB session backend.
pub struct DynamoDbBackend {
    client: Client,
    session_table: String,
    blacklist_table: String,
    max_lifetime: i64,
    clock: SharedClock,
    verifier: OnceLock<Arc<dyn HostVerifier>>,
}

impl DynamoDbBackend {
    pub fn new(client: Client, session_table: String, blacklist_table: String) -> Self {
        Self {
            client,
            session_table,
            blacklist_table,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            clock: clock::system(),
            verifier: OnceLock::new(),
        }
    }

    /// Seconds of inactivity after which a record is treated as absent.
    pub fn with_max_lifetime(mut self, secs: i64) -> Self {
        self.max_lifetime = secs;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

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

    /// Fetch a record that has not outlived the configured lifetime.
    async fn load_live(&self, sid: &str) -> Result<Option<Session>, BackendError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.session_table)
            .key(SID, key(sid))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| storage_err("get_item", e))?;

        let Some(item) = output.item() else {
            return Ok(None);
        };
        let session = session_from_item(item)?;
        if session.is_expired(self.now(), self.max_lifetime) {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// `SET` the given `Value` fields and the access time on a live record.
    async fn update_fields(
        &self,
        op: &'static str,
        sid: &str,
        fields: Vec<(&str, AttributeValue)>,
    ) -> Result<(), BackendError> {
        let now = self.now();
        let mut request = self
            .client
            .update_item()
            .table_name(&self.session_table)
            .key(SID, key(sid))
            .update_expression(set_expression(fields.len()))
            .condition_expression(LIVE_CONDITION)
            .expression_attribute_names("#sid", SID)
            .expression_attribute_names("#t", TIME_ACCESSED)
            .expression_attribute_names("#v", VALUE)
            .expression_attribute_values(":now", number(now))
            .expression_attribute_values(":cutoff", number(now - self.max_lifetime));
        for (i, (name, value)) in fields.into_iter().enumerate() {
            request = request
                .expression_attribute_names(format!("#f{i}"), name)
                .expression_attribute_values(format!(":f{i}"), value);
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Err(BackendError::NotFound(sid.to_string()))
            }
            Err(e) => Err(storage_err(op, e)),
        }
    }

    async fn put_session(&self, session: &Session) -> Result<(), BackendError> {
        self.client
            .put_item()
            .table_name(&self.session_table)
            .set_item(Some(session_item(session)))
            .send()
            .await
            .map_err(|e| storage_err("put_item", e))?;
        Ok(())
    }

    /// All items of `table` matching the scan, following pagination.
    async fn scan_all(
        &self,
        table: &str,
        filter: &str,
        names: &[(&str, &str)],
        values: &[(&str, AttributeValue)],
    ) -> Result<Vec<Item>, BackendError> {
        let mut items = Vec::new();
        let mut start_key: Option<Item> = None;
        loop {
            let mut request = self
                .client
                .scan()
                .table_name(table)
                .filter_expression(filter)
                .set_exclusive_start_key(start_key.take());
            for (placeholder, name) in names {
                request = request.expression_attribute_names(*placeholder, *name);
            }
            for (placeholder, value) in values {
                request = request.expression_attribute_values(*placeholder, value.clone());
            }

            let page = request.send().await.map_err(|e| storage_err("scan", e))?;
            items.extend(page.items().iter().cloned());
            match page.last_evaluated_key() {
                Some(last) => start_key = Some(last.clone()),
                None => break,
            }
        }
        Ok(items)
    }

    async fn delete_session(&self, sid: &str) -> Result<(), BackendError> {
        self.client
            .delete_item()
            .table_name(&self.session_table)
            .key(SID, key(sid))
            .send()
            .await
            .map_err(|e| storage_err("delete_item", e))?;
        Ok(())
    }

    /// Delete every session id in `items`, returning the number of failures.
    async fn delete_items(&self, op: &'static str, items: &[Item]) -> usize {
        let mut failures = 0usize;
        for item in items {
            let Some(sid) = item.get(SID).and_then(|v| v.as_s().ok()) else {
                tracing::warn!(op, "session item without a string Sid");
                failures += 1;
                continue;
            };
            if let Err(e) = self.delete_session(sid).await {
                tracing::error!(op, sid = %sid, error = %e, "failed to delete session");
                failures += 1;
            }
        }
        failures
    }
}

/// Record exists and has not expired.
const LIVE_CONDITION: &str = "attribute_exists(#sid) AND #t >= :cutoff";

impl SessionBackend for DynamoDbBackend {
    async fn new_session(&self, sid: &str) -> Result<Session, BackendError> {
        let session = Session::new(sid, self.now());
        self.put_session(&session).await?;
        Ok(session)
    }

    async fn find_or_create(&self, sid: &str) -> Result<Session, BackendError> {
        match self.load_live(sid).await? {
            Some(mut session) => {
                self.update_time_accessed(sid).await?;
                session.last_accessed = session.last_accessed.max(self.now());
                Ok(session)
            }
            None => {
                tracing::debug!(sid, "session not found, recreating under the same id");
                self.new_session(sid).await
            }
        }
    }

    async fn exists(&self, sid: &str) -> bool {
        match self.load_live(sid).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!(sid, error = %e, "session lookup failed");
                false
            }
        }
    }

    async fn destroy_sid(&self, sid: &str) -> Result<(), BackendError> {
        self.delete_session(sid).await
    }

    async fn session_gc(&self, max_lifetime: i64) {
        let cutoff = self.now() - max_lifetime;
        let expired = match self
            .scan_all(
                &self.session_table,
                "#t < :cutoff",
                &[("#t", TIME_ACCESSED)],
                &[(":cutoff", number(cutoff))],
            )
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "session GC scan failed");
                return;
            }
        };

        let failures = self.delete_items("session_gc", &expired).await;
        tracing::debug!(
            reaped = expired.len() - failures,
            failures,
            "expired sessions removed"
        );
    }

    async fn update_time_accessed(&self, sid: &str) -> Result<(), BackendError> {
        let now = self.now();
        let result = self
            .client
            .update_item()
            .table_name(&self.session_table)
            .key(SID, key(sid))
            .update_expression("SET #t = :now")
            .condition_expression("attribute_exists(#sid) AND #t <= :now")
            .expression_attribute_names("#sid", SID)
            .expression_attribute_names("#t", TIME_ACCESSED)
            .expression_attribute_values(":now", number(now))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            // Absent record, or already touched at a later time
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(())
            }
            Err(e) => Err(storage_err("update_time_accessed", e)),
        }
    }

    async fn update_session_state(&self, sid: &str, state: &str) -> Result<(), BackendError> {
        self.update_fields(
            "update_session_state",
            sid,
            vec![(keys::STATE, AttributeValue::S(state.into()))],
        )
        .await
    }

    async fn update_code_verifier(&self, sid: &str, verifier: &str) -> Result<(), BackendError> {
        self.update_fields(
            "update_code_verifier",
            sid,
            vec![(keys::CODE_VERIFIER, AttributeValue::S(verifier.into()))],
        )
        .await
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
        self.update_fields(
            "save_code_challenge_and_method",
            sid,
            vec![
                (keys::CODE_CHALLENGER, AttributeValue::S(challenge.into())),
                (keys::CODE_CHALLENGER_METHOD, AttributeValue::S(method.into())),
                (keys::AUTH_CODE, AttributeValue::S(code.into())),
                (keys::CODE_EXPIRE, number(expire)),
                (keys::REDIRECT_URI, AttributeValue::S(redirect_uri.into())),
                (keys::STATE, AttributeValue::S("InAuth".into())),
            ],
        )
        .await
    }

    async fn get_auth_code(&self, sid: &str) -> AuthCode {
        match self.load_live(sid).await {
            Ok(Some(session)) => session.attrs.auth_code_at(self.now()),
            Ok(None) => AuthCode::new(),
            Err(e) => {
                tracing::warn!(sid, error = %e, "auth code lookup failed");
                AuthCode::new()
            }
        }
    }

    async fn update_auth_session(
        &self,
        sid: &str,
        at: &str,
        rt: &str,
        uid: &str,
    ) -> Result<(), BackendError> {
        self.update_fields(
            "update_auth_session",
            sid,
            vec![
                (keys::ACCESS_TOKEN, AttributeValue::S(at.into())),
                (keys::REFRESH_TOKEN, AttributeValue::S(rt.into())),
                (keys::USER_ID, AttributeValue::S(uid.into())),
                (keys::STATE, AttributeValue::S("Authed".into())),
            ],
        )
        .await
    }

    async fn active_sessions(&self) -> usize {
        let cutoff = self.now() - self.max_lifetime;
        let mut total = 0usize;
        let mut start_key: Option<Item> = None;
        loop {
            let page = self
                .client
                .scan()
                .table_name(&self.session_table)
                .select(Select::Count)
                .filter_expression("#t >= :cutoff")
                .expression_attribute_names("#t", TIME_ACCESSED)
                .expression_attribute_values(":cutoff", number(cutoff))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await;
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(error = %DisplayErrorContext(e), "active session count failed");
                    return total;
                }
            };
            total += usize::try_from(page.count()).unwrap_or_default();
            match page.last_evaluated_key() {
                Some(last) => start_key = Some(last.clone()),
                None => return total,
            }
        }
    }

    async fn flush(&self) -> Result<(), BackendError> {
        let items = self
            .scan_all(
                &self.session_table,
                "attribute_exists(#sid)",
                &[("#sid", SID)],
                &[],
            )
            .await?;
        match self.delete_items("flush", &items).await {
            0 => Ok(()),
            failures => Err(BackendError::storage(
                "flush",
                format!("{failures} of {} deletions failed", items.len()),
            )),
        }
    }

    async fn get_attribute(&self, sid: &str, key: &str) -> Result<Option<Value>, BackendError> {
        let session = self
            .load_live(sid)
            .await?
            .ok_or_else(|| BackendError::NotFound(sid.to_string()))?;
        self.update_time_accessed(sid).await?;
        Ok(session.attrs.get(key).cloned())
    }

    async fn set_attribute(&self, sid: &str, key: &str, value: Value) -> Result<(), BackendError> {
        self.update_fields("set_attribute", sid, vec![(key, to_attr(&value))])
            .await
    }

    async fn delete_attribute(&self, sid: &str, key: &str) -> Result<(), BackendError> {
        let now = self.now();
        let result = self
            .client
            .update_item()
            .table_name(&self.session_table)
            .key(SID, self::key(sid))
            .update_expression("SET #t = :now REMOVE #v.#f0")
            .condition_expression(LIVE_CONDITION)
            .expression_attribute_names("#sid", SID)
            .expression_attribute_names("#t", TIME_ACCESSED)
            .expression_attribute_names("#v", VALUE)
            .expression_attribute_names("#f0", key)
            .expression_attribute_values(":now", number(now))
            .expression_attribute_values(":cutoff", number(now - self.max_lifetime))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Err(BackendError::NotFound(sid.to_string()))
            }
            Err(e) => Err(storage_err("delete_attribute", e)),
        }
    }

    async fn blacklisting(&self, ip: &str, path: &str, details: Value) -> bool {
        let entry = BlacklistEntry::new(self.now(), path, details);
        let result = self
            .client
            .put_item()
            .table_name(&self.blacklist_table)
            .set_item(Some(blacklist_item(ip, &entry)))
            .send()
            .await;
        match result {
            Ok(_) => {
                tracing::info!(ip, path, "ip listed in the blacklist");
                true
            }
            Err(e) => {
                tracing::error!(ip, error = %DisplayErrorContext(e), "failed to blacklist ip");
                false
            }
        }
    }

    async fn is_ip_exist_in_bl(&self, ip: &str) -> bool {
        let result = self
            .client
            .get_item()
            .table_name(&self.blacklist_table)
            .key(BL_IP, key(ip))
            .projection_expression("#ip")
            .expression_attribute_names("#ip", BL_IP)
            .send()
            .await;
        match result {
            Ok(output) => output.item().is_some(),
            Err(e) => {
                tracing::warn!(ip, error = %DisplayErrorContext(e), "blacklist lookup failed");
                false
            }
        }
    }

    async fn bl_clean(&self) {
        let cutoff = self.now() - QUARANTINE_SECS;
        let items = match self
            .scan_all(
                &self.blacklist_table,
                "#c < :cutoff",
                &[("#c", BL_CREATED)],
                &[(":cutoff", number(cutoff))],
            )
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "blacklist scan failed");
                return;
            }
        };

        let reviewed = items.len();
        let mut deleted = 0usize;
        for item in &items {
            let (ip, entry) = match blacklist_from_item(item) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed blacklist item");
                    continue;
                }
            };
            if !self.verifier().verify(&ip).await {
                continue;
            }

            // Skip entries re-listed while we were resolving
            let result = self
                .client
                .delete_item()
                .table_name(&self.blacklist_table)
                .key(BL_IP, key(&ip))
                .condition_expression("#c = :created")
                .expression_attribute_names("#c", BL_CREATED)
                .expression_attribute_values(":created", number(entry.created))
                .send()
                .await;
            match result {
                Ok(_) => {
                    deleted += 1;
                    crate::ocsf::blacklist_event(&ip, false, "IP rehabilitated after DNS verification");
                }
                Err(e)
                    if e.as_service_error()
                        .is_some_and(|se| se.is_conditional_check_failed_exception()) => {}
                Err(e) => {
                    tracing::error!(ip = %ip, error = %DisplayErrorContext(e), "failed to remove blacklist entry");
                }
            }
        }
        tracing::info!(reviewed, deleted, "blacklist clean summary");
    }
}

fn key(id: &str) -> AttributeValue {
    AttributeValue::S(id.to_string())
}

fn number(n: i64) -> AttributeValue {
    AttributeValue::N(n.to_string())
}

fn storage_err<E: std::error::Error>(op: &'static str, err: E) -> BackendError {
    BackendError::storage(op, DisplayErrorContext(err).to_string())
}

/// `SET` clause for the access time plus `n` nested `Value` fields.
fn set_expression(n: usize) -> String {
    let mut clauses = vec!["#t = :now".to_string()];
    clauses.extend((0..n).map(|i| format!("#v.#f{i} = :f{i}")));
    format!("SET {}", clauses.join(", "))
}

/// Convert a JSON value to its DynamoDB representation.
pub fn to_attr(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attr).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_attr(v)))
                .collect(),
        ),
    }
}

/// Convert a DynamoDB attribute back to JSON.
pub fn from_attr(attr: &AttributeValue) -> Result<Value, BackendError> {
    match attr {
        AttributeValue::Null(_) => Ok(Value::Null),
        AttributeValue::Bool(b) => Ok(Value::Bool(*b)),
        AttributeValue::S(s) => Ok(Value::String(s.clone())),
        AttributeValue::N(n) => parse_number(n),
        AttributeValue::Ss(items) => Ok(Value::Array(
            items.iter().cloned().map(Value::String).collect(),
        )),
        AttributeValue::Ns(items) => items
            .iter()
            .map(|n| parse_number(n))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        AttributeValue::L(items) => items
            .iter()
            .map(from_attr)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        AttributeValue::M(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), from_attr(v)?)))
            .collect::<Result<serde_json::Map<_, _>, BackendError>>()
            .map(Value::Object),
        other => Err(BackendError::Serialization(format!(
            "unsupported attribute type {other:?}"
        ))),
    }
}

fn parse_number(raw: &str) -> Result<Value, BackendError> {
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::from(i));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| BackendError::Serialization(format!("invalid number {raw:?}")))
}

fn session_item(session: &Session) -> Item {
    let value = session
        .attrs
        .data
        .iter()
        .map(|(k, v)| (k.clone(), to_attr(v)))
        .collect();
    HashMap::from([
        (SID.to_string(), key(&session.id)),
        (TIME_ACCESSED.to_string(), number(session.last_accessed)),
        (VALUE.to_string(), AttributeValue::M(value)),
    ])
}

/// Decode a session table item.
pub fn session_from_item(item: &Item) -> Result<Session, BackendError> {
    let sid = item
        .get(SID)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| BackendError::Serialization("missing Sid".into()))?;
    let accessed = item
        .get(TIME_ACCESSED)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
        .ok_or_else(|| BackendError::Serialization(format!("session {sid}: bad TimeAccessed")))?;

    let mut attrs = SessionData::new();
    match item.get(VALUE) {
        Some(AttributeValue::M(map)) => {
            for (k, v) in map {
                attrs.set(k, from_attr(v)?);
            }
        }
        None => {}
        Some(_) => {
            return Err(BackendError::Serialization(format!(
                "session {sid}: Value is not a map"
            )));
        }
    }
    Ok(Session::existing(sid.clone(), accessed, attrs))
}

fn blacklist_item(ip: &str, entry: &BlacklistEntry) -> Item {
    HashMap::from([
        (BL_IP.to_string(), key(ip)),
        (BL_CREATED.to_string(), number(entry.created)),
        (BL_REQUEST_URI.to_string(), AttributeValue::S(entry.request_uri.clone())),
        (BL_DETAILS.to_string(), AttributeValue::S(entry.details.to_string())),
    ])
}

/// Decode a blacklist table item into its ip and entry.
pub fn blacklist_from_item(item: &Item) -> Result<(String, BlacklistEntry), BackendError> {
    let ip = item
        .get(BL_IP)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| BackendError::Serialization("blacklist item without ip".into()))?;
    let created = item
        .get(BL_CREATED)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
        .ok_or_else(|| BackendError::Serialization(format!("blacklist {ip}: bad created")))?;
    let request_uri = item
        .get(BL_REQUEST_URI)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .unwrap_or_default();
    let details = match item.get(BL_DETAILS) {
        Some(AttributeValue::S(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => from_attr(other)?,
        None => Value::Null,
    };
    Ok((
        ip.clone(),
        BlacklistEntry {
            created,
            request_uri,
            details,
        },
    ))
}
