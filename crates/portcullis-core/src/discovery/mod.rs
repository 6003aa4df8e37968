//! Service discovery abstraction.
//!
//! The dispatcher only needs one thing from discovery: a backend base URL
//! for a `(service, tag)` handle. [`DnsResolver`] derives DNS names of the
//! `[<tag>.]<service>.<domain>` form, which is how Consul exposes services.

use crate::config::ConsulConfig;

/// Resolves a discovery handle to a backend base URL.
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, service: &str, tag: Option<&str>) -> String;
}

/// DNS-based resolver.
pub struct DnsResolver {
    domain: String,
}

impl DnsResolver {
    pub const DEFAULT_DOMAIN: &'static str = "service.consul";

    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into() }
    }

    /// Builds a resolver from the optional consul section. Without one, the
    /// default `service.consul` domain is used.
    #[must_use]
    pub fn from_config(config: Option<&ConsulConfig>) -> Self {
        let domain = match config.and_then(|c| c.datacenter.as_deref()) {
            Some(dc) => format!("service.{dc}.consul"),
            None => Self::DEFAULT_DOMAIN.to_string(),
        };
        Self::new(domain)
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DOMAIN)
    }
}

impl ServiceResolver for DnsResolver {
    fn resolve(&self, service: &str, tag: Option<&str>) -> String {
        match tag {
            Some(tag) => format!("http://{tag}.{service}.{}", self.domain),
            None => format!("http://{service}.{}", self.domain),
        }
    }
}
