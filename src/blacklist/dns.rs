//! Reverse-then-forward DNS verification.
//!
//! Resolve the PTR names of an address, resolve each name back to A/AAAA
//! records, and accept only if the original address comes back. This is the
//! check crawler operators document for proving a bot is theirs.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use std::net::IpAddr;

use super::HostVerifier;

/// DNS-backed [`HostVerifier`].
pub struct DnsVerifier {
    resolver: TokioAsyncResolver,
}

impl DnsVerifier {
    /// Resolver configured from the host's resolv.conf.
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    /// Resolver using the library's default upstreams.
    pub fn with_defaults() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    /// System configuration, falling back to the defaults.
    pub fn new() -> Self {
        Self::from_system_conf().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "system resolver config unavailable, using defaults");
            Self::with_defaults()
        })
    }
}

impl Default for DnsVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostVerifier for DnsVerifier {
    async fn verify(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            tracing::debug!(ip, "blacklist key is not an IP literal");
            return false;
        };

        let names = match self.resolver.reverse_lookup(addr).await {
            Ok(names) => names,
            Err(e) => {
                tracing::debug!(ip, error = %e, "reverse lookup failed");
                return false;
            }
        };

        for ptr in names.iter() {
            let host = ptr.to_utf8();
            match self.resolver.lookup_ip(host.as_str()).await {
                Ok(addrs) => {
                    if addrs.iter().any(|a| a == addr) {
                        tracing::debug!(ip, host = %host, "forward lookup confirmed");
                        return true;
                    }
                }
                Err(e) => {
                    tracing::debug!(ip, host = %host, error = %e, "forward lookup failed");
                    return false;
                }
            }
        }
        false
    }
}
