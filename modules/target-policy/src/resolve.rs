use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::PolicyError;

/// Hostname → addresses. Every address returned is re-checked against the
/// blocklist before the target is accepted.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, PolicyError>;
}

/// The operating system resolver, via tokio's blocking-pool lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, PolicyError> {
        let addrs = tokio::net::lookup_host((host, 443u16))
            .await
            .map_err(|_| PolicyError::Unresolvable(host.to_string()))?;
        let mut ips: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
        ips.sort();
        ips.dedup();
        if ips.is_empty() {
            return Err(PolicyError::Unresolvable(host.to_string()));
        }
        Ok(ips)
    }
}

/// Fixed answers, for tests and offline runs.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    answers: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        StaticResolver::default()
    }

    pub fn with(mut self, host: &str, addrs: &[&str]) -> Self {
        let ips = addrs.iter().filter_map(|a| a.parse().ok()).collect();
        self.answers.insert(host.to_ascii_lowercase(), ips);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, PolicyError> {
        match self.answers.get(&host.to_ascii_lowercase()) {
            Some(ips) if !ips.is_empty() => Ok(ips.clone()),
            _ => Err(PolicyError::Unresolvable(host.to_string())),
        }
    }
}
