//! Backend providers and the registry the manager resolves them from.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::AnyBackend;
use crate::error::SessionError;

/// Storage provider identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Memory,
    DocumentStore,
    /// Reserved; no backend ships for it.
    RemoteKv,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Memory => "memory",
            Provider::DocumentStore => "dynamodb",
            Provider::RemoteKv => "remote-kv",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Provider::Memory),
            "dynamodb" | "document-store" => Ok(Provider::DocumentStore),
            "remote-kv" => Ok(Provider::RemoteKv),
            _ => Err(SessionError::UnknownProvider(s.to_string())),
        }
    }
}

impl TryFrom<u8> for Provider {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Provider::Memory),
            1 => Ok(Provider::DocumentStore),
            2 => Ok(Provider::RemoteKv),
            other => Err(SessionError::UnknownProvider(other.to_string())),
        }
    }
}

/// Registered backends, keyed by provider.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<Provider, Arc<AnyBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the backend for `provider`.
    ///
    /// # Panics
    ///
    /// Panics if `provider` already has a backend.
    pub fn register(&mut self, provider: Provider, backend: impl Into<Arc<AnyBackend>>) {
        if self.backends.contains_key(&provider) {
            panic!("session backend already registered for provider {provider}");
        }
        self.backends.insert(provider, backend.into());
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<AnyBackend>> {
        self.backends.get(&provider).cloned()
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.backends.contains_key(&provider)
    }
}
