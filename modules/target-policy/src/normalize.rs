//! Canonical URL forms and registrable-domain scoping.

use url::{Host, Url};

/// Canonical form used for dedupe and as the audit's `normalized_url`:
/// lowercased host (the parser does this), default port stripped, fragment
/// removed, empty path becomes `/`, a trailing slash on a non-root path
/// dropped, query pairs sorted by key.
pub fn canonical_url(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);
    if u.port() == default_port(u.scheme()) {
        let _ = u.set_port(None);
    }
    let path = u.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        u.set_path(path.trim_end_matches('/'));
    }
    if let Some(q) = u.query() {
        if q.is_empty() {
            u.set_query(None);
        } else {
            let mut pairs: Vec<(String, String)> = u.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
            pairs.sort();
            u.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }
    u.to_string()
}

pub fn canonical_str(raw: &str) -> Option<String> {
    Url::parse(raw).ok().map(|u| canonical_url(&u))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// The registrable domain ("eTLD+1") of a host per the public suffix list.
/// IP literals, and hosts that are themselves a public suffix, are their
/// own scope.
pub fn registrable_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<std::net::IpAddr>().is_ok() || host.starts_with('[') {
        return host;
    }
    match psl::domain_str(&host) {
        Some(domain) => domain.to_string(),
        None => host,
    }
}

pub fn url_registrable_domain(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(d) => Some(registrable_domain(d)),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

/// Whether `url` is in scope for a crawl rooted at `root_domain`.
pub fn same_site(url: &Url, root_domain: &str) -> bool {
    matches!(url.scheme(), "http" | "https") && url_registrable_domain(url).as_deref() == Some(root_domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(s: &str) -> String {
        canonical_str(s).unwrap()
    }

    #[test]
    fn canonical_forms_collapse() {
        assert_eq!(canon("HTTPS://Example.COM:443"), "https://example.com/");
        assert_eq!(canon("https://example.com/a/#top"), "https://example.com/a");
        assert_eq!(canon("https://example.com/a?b=2&a=1"), "https://example.com/a?a=1&b=2");
        assert_eq!(canon("http://example.com:8080/"), "http://example.com:8080/");
        assert_eq!(canon("https://example.com/?"), "https://example.com/");
    }

    #[test]
    fn registrable_domains() {
        assert_eq!(registrable_domain("www.example.com"), "example.com");
        assert_eq!(registrable_domain("a.b.shop.co.uk"), "shop.co.uk");
        assert_eq!(registrable_domain("example.com"), "example.com");
        assert_eq!(registrable_domain("93.184.216.34"), "93.184.216.34");
        assert_eq!(registrable_domain("WWW.Example.COM."), "example.com");
    }

    #[test]
    fn registrable_domains_follow_the_suffix_list() {
        assert_eq!(registrable_domain("news.example.com.au"), "example.com.au");
        assert_eq!(registrable_domain("shop.example.org.za"), "example.org.za");
        assert_eq!(registrable_domain("alice.github.io"), "alice.github.io");
        assert_eq!(registrable_domain("co.uk"), "co.uk");
        assert!(!same_site(&Url::parse("https://bob.github.io/").unwrap(), "alice.github.io"));
    }

    #[test]
    fn scope_follows_registrable_domain() {
        let root = "example.com";
        assert!(same_site(&Url::parse("https://cdn.example.com/x.js").unwrap(), root));
        assert!(!same_site(&Url::parse("https://example.org/").unwrap(), root));
        assert!(!same_site(&Url::parse("mailto:a@example.com").unwrap(), root));
    }
}
