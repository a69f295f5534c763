//! Target URL policy: what a customer may ask us to scan.
//!
//! Syntax checks, IDN handling and blocklists run first and never touch the
//! network. DNS resolution follows, and every resolved address is checked
//! again so a public name pointing at a private address is still refused.

mod blocklist;
mod error;
mod normalize;
mod resolve;

pub use blocklist::{is_blocked_hostname, is_blocked_ip, reserved_tld};
pub use error::PolicyError;
pub use normalize::{canonical_str, canonical_url, registrable_domain, same_site, url_registrable_domain};
pub use resolve::{Resolver, StaticResolver, SystemResolver};

use audit_core::config::PolicyConfig;
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;
use url::{Host, Url};

pub const MAX_URL_LEN: usize = 2048;

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+(?:[a-z](?:[a-z0-9-]{0,61}[a-z0-9])?)$")
            .expect("domain regex")
    })
}

/// A target that passed the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTarget {
    pub url: Url,
    pub normalized_url: String,
    pub host: String,
    pub registrable_domain: String,
    /// Resolved addresses; empty until `resolve_and_check` ran.
    pub addrs: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct UrlPolicy {
    extra_hostnames: Vec<String>,
    extra_tlds: Vec<String>,
}

impl UrlPolicy {
    pub fn new(cfg: &PolicyConfig) -> Self {
        UrlPolicy {
            extra_hostnames: cfg.extra_blocked_hostnames.iter().map(|h| h.to_ascii_lowercase()).collect(),
            extra_tlds: cfg.extra_blocked_tlds.iter().map(|t| t.trim_start_matches('.').to_ascii_lowercase()).collect(),
        }
    }

    /// Network-free checks: parse, scheme, length, credentials, IDN → punycode,
    /// domain syntax, hostname/TLD/literal-address blocklists.
    pub fn check_syntax(&self, raw: &str) -> Result<ValidatedTarget, PolicyError> {
        let raw = raw.trim();
        if raw.len() > MAX_URL_LEN {
            return Err(PolicyError::TooLong { max: MAX_URL_LEN });
        }
        let url = Url::parse(raw).map_err(|e| PolicyError::Unparseable(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PolicyError::Scheme(url.scheme().to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(PolicyError::Credentials);
        }
        let host = match url.host() {
            None => return Err(PolicyError::MissingHost),
            Some(Host::Ipv4(ip)) => {
                self.check_addr(IpAddr::V4(ip))?;
                ip.to_string()
            }
            Some(Host::Ipv6(ip)) => {
                self.check_addr(IpAddr::V6(ip))?;
                ip.to_string()
            }
            // The parser has already applied IDNA, so this is ASCII/punycode.
            Some(Host::Domain(d)) => {
                let d = d.trim_end_matches('.').to_ascii_lowercase();
                self.check_domain(&d)?;
                d
            }
        };
        Ok(ValidatedTarget {
            normalized_url: canonical_url(&url),
            registrable_domain: registrable_domain(&host),
            url,
            host,
            addrs: Vec::new(),
        })
    }

    fn check_domain(&self, d: &str) -> Result<(), PolicyError> {
        if is_blocked_hostname(d, &self.extra_hostnames) {
            return Err(PolicyError::BlockedHostname(d.to_string()));
        }
        if let Some(tld) = reserved_tld(d, &self.extra_tlds) {
            return Err(PolicyError::ReservedTld(tld));
        }
        if d.len() > 253 || !domain_re().is_match(d) {
            return Err(PolicyError::InvalidDomain(d.to_string()));
        }
        Ok(())
    }

    fn check_addr(&self, ip: IpAddr) -> Result<(), PolicyError> {
        if is_blocked_ip(ip) {
            return Err(PolicyError::BlockedAddress(ip));
        }
        Ok(())
    }

    /// Resolve the host and re-check every address.
    pub async fn resolve_and_check(&self, mut target: ValidatedTarget, resolver: &dyn Resolver) -> Result<ValidatedTarget, PolicyError> {
        let literal: Option<IpAddr> = target.host.parse().ok();
        let addrs = match literal {
            Some(ip) => vec![ip],
            None => resolver.resolve(&target.host).await?,
        };
        for addr in &addrs {
            if is_blocked_ip(*addr) {
                tracing::warn!(host = %target.host, %addr, "target resolves to a blocked address");
                return Err(PolicyError::ResolvesToBlocked { host: target.host.clone(), addr: *addr });
            }
        }
        target.addrs = addrs;
        Ok(target)
    }

    pub async fn validate(&self, raw: &str, resolver: &dyn Resolver) -> Result<ValidatedTarget, PolicyError> {
        let target = self.check_syntax(raw)?;
        self.resolve_and_check(target, resolver).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> UrlPolicy {
        UrlPolicy::default()
    }

    #[test]
    fn accepts_plain_public_urls() {
        let t = policy().check_syntax("https://Example.com").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.normalized_url, "https://example.com/");
        assert_eq!(t.registrable_domain, "example.com");
    }

    #[test]
    fn rejects_bad_syntax() {
        let p = policy();
        assert!(matches!(p.check_syntax("not a url"), Err(PolicyError::Unparseable(_))));
        assert!(matches!(p.check_syntax("ftp://example.com/"), Err(PolicyError::Scheme(_))));
        assert!(matches!(p.check_syntax("javascript:alert(1)"), Err(PolicyError::Scheme(_))));
        assert!(matches!(p.check_syntax("https://user:pw@example.com/"), Err(PolicyError::Credentials)));
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LEN));
        assert!(matches!(p.check_syntax(&long), Err(PolicyError::TooLong { .. })));
        assert!(p.check_syntax("https://-bad-.com/").is_err());
        assert!(matches!(p.check_syntax("https://intranet/"), Err(PolicyError::InvalidDomain(_))));
    }

    #[test]
    fn idn_is_punycoded() {
        let t = policy().check_syntax("https://bücher.de/").unwrap();
        assert_eq!(t.host, "xn--bcher-kva.de");
    }

    #[test]
    fn blocks_private_literals_and_reserved_names() {
        let p = policy();
        let e = p.check_syntax("https://192.168.1.1/admin").unwrap_err();
        assert_eq!(e.code(), "url_blocked");
        assert!(matches!(p.check_syntax("http://[::1]/"), Err(PolicyError::BlockedAddress(_))));
        assert!(matches!(p.check_syntax("http://localhost:8080/"), Err(PolicyError::BlockedHostname(_))));
        assert!(matches!(p.check_syntax("https://shop.test/"), Err(PolicyError::ReservedTld(_))));
        assert!(matches!(p.check_syntax("https://hidden.onion/"), Err(PolicyError::ReservedTld(_))));
    }

    #[test]
    fn extra_config_entries_apply() {
        let p = UrlPolicy::new(&PolicyConfig {
            extra_blocked_hostnames: vec!["Intranet.Corp.com".into()],
            extra_blocked_tlds: vec![".corp".into()],
        });
        assert!(matches!(p.check_syntax("https://intranet.corp.com/"), Err(PolicyError::BlockedHostname(_))));
        assert!(matches!(p.check_syntax("https://a.corp/"), Err(PolicyError::ReservedTld(_))));
    }

    #[tokio::test]
    async fn dns_rebinding_is_caught() {
        let r = StaticResolver::new()
            .with("example.com", &["93.184.216.34"])
            .with("rebind.example.net", &["93.184.216.34", "10.0.0.5"]);
        let p = policy();
        let ok = p.validate("https://example.com", &r).await.unwrap();
        assert_eq!(ok.addrs.len(), 1);
        let e = p.validate("https://rebind.example.net/", &r).await.unwrap_err();
        assert!(matches!(e, PolicyError::ResolvesToBlocked { .. }));
        let e = p.validate("https://nxdomain.example.org/", &r).await.unwrap_err();
        assert_eq!(e.code(), "url_unresolvable");
    }
}
