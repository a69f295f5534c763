//! Address, TLD and hostname blocklists.

use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const BLOCKED_V4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

const BLOCKED_V6: &[&str] = &["::/128", "::1/128", "fc00::/7", "fe80::/10", "ff00::/8", "64:ff9b::/96"];

pub const RESERVED_TLDS: &[&str] = &["test", "example", "invalid", "localhost", "local", "onion", "internal", "lan", "home.arpa"];

pub const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "metadata",
    "metadata.google.internal",
    "instance-data",
];

fn v4_nets() -> impl Iterator<Item = Ipv4Net> {
    BLOCKED_V4.iter().filter_map(|s| s.parse().ok())
}

fn v6_nets() -> impl Iterator<Item = Ipv6Net> {
    BLOCKED_V6.iter().filter_map(|s| s.parse().ok())
}

pub fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    ip.is_broadcast() || v4_nets().any(|n| n.contains(&ip))
}

pub fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_v4(v4);
    }
    v6_nets().any(|n| n.contains(&ip))
}

/// True for any address a scan must never reach.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

/// The reserved suffix the host falls under, if any.
pub fn reserved_tld(host: &str, extra: &[String]) -> Option<String> {
    let host = host.trim_end_matches('.');
    RESERVED_TLDS
        .iter()
        .copied()
        .chain(extra.iter().map(String::as_str))
        .find(|tld| host == *tld || host.ends_with(&format!(".{tld}")))
        .map(str::to_string)
}

pub fn is_blocked_hostname(host: &str, extra: &[String]) -> bool {
    let host = host.trim_end_matches('.');
    BLOCKED_HOSTNAMES.iter().any(|h| *h == host) || extra.iter().any(|h| h.eq_ignore_ascii_case(host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_and_special_ranges_are_blocked() {
        for ip in ["10.1.2.3", "172.16.0.1", "172.31.255.255", "192.168.1.1", "127.0.0.1", "169.254.169.254", "224.0.0.1", "255.255.255.255", "0.0.0.0"] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["::1", "fc00::1", "fd12::1", "fe80::1", "ff02::1", "::ffff:10.0.0.1"] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn public_addresses_pass() {
        for ip in ["93.184.216.34", "172.32.0.1", "8.8.8.8", "2606:2800:220:1::1"] {
            assert!(!is_blocked_ip(ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn reserved_tlds_match_whole_labels() {
        assert_eq!(reserved_tld("shop.test", &[]).as_deref(), Some("test"));
        assert_eq!(reserved_tld("foo.onion", &[]).as_deref(), Some("onion"));
        assert!(reserved_tld("example.com", &[]).is_none());
        assert!(reserved_tld("contest", &[]).is_none());
        assert_eq!(reserved_tld("a.corp", &["corp".to_string()]).as_deref(), Some("corp"));
    }

    #[test]
    fn hostnames() {
        assert!(is_blocked_hostname("localhost", &[]));
        assert!(is_blocked_hostname("broadcasthost.", &[]));
        assert!(!is_blocked_hostname("example.com", &[]));
    }
}
