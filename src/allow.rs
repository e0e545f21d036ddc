//! Source address admission.
//!
//! The check runs before any routing: a connection whose peer is not listed
//! gets `403 Forbidden` and never reaches a controller.

use crate::http::PeerAddr;

/// Entries that admit every address.
const WILDCARDS: [&str; 2] = ["*", "all"];

/// An ordered list of admitted source addresses.
///
/// Entries are IP literals compared textually against the client address, or
/// one of the wildcard tokens `"*"` and `"all"` (exact, case-sensitive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Whether the textual address `ip` is admitted.
    pub fn permits(&self, ip: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| WILDCARDS.contains(&entry.as_str()) || entry == ip)
    }

    /// Whether the peer is admitted. A peer without an IP address never is.
    pub fn permits_peer(&self, peer: &PeerAddr) -> bool {
        match client_ip(peer) {
            Some(ip) => self.permits(&ip),
            None => false,
        }
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(["*"])
    }
}

/// Renders the peer's IP address in its textual form.
///
/// Only IPv4 and IPv6 peers have one; any other family yields `None`.
pub fn client_ip(peer: &PeerAddr) -> Option<String> {
    match peer {
        PeerAddr::Inet(addr) => Some(addr.ip().to_string()),
        PeerAddr::Unix | PeerAddr::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(addr: &str) -> PeerAddr {
        PeerAddr::Inet(addr.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn test_default_admits_everyone() {
        let list = AllowList::default();
        for ip in ["10.0.0.1", "192.168.1.20", "::1", "fe80::1"] {
            assert!(list.permits(ip), "{} should be admitted", ip);
        }
    }

    #[test]
    fn test_all_token_is_a_wildcard() {
        let list = AllowList::new(["10.0.0.1", "all"]);
        assert!(list.permits("172.16.0.9"));
    }

    #[test]
    fn test_wildcards_are_case_sensitive() {
        let list = AllowList::new(["ALL", "**"]);
        assert!(!list.permits("10.0.0.1"));
        assert!(list.permits("ALL"));
    }

    #[test]
    fn test_exact_match_only() {
        let list = AllowList::new(["10.0.0.1"]);
        assert!(list.permits("10.0.0.1"));
        assert!(!list.permits("10.0.0.2"));
        assert!(!list.permits("10.0.0.10"));
        assert!(!list.permits(" 10.0.0.1"));
    }

    #[test]
    fn test_empty_list_denies() {
        let list = AllowList::new(Vec::<String>::new());
        assert!(!list.permits("127.0.0.1"));
    }

    #[test]
    fn test_client_ip_formats_both_families() {
        assert_eq!(client_ip(&peer("10.0.0.2:5555")).as_deref(), Some("10.0.0.2"));
        assert_eq!(client_ip(&peer("[2001:db8::1]:443")).as_deref(), Some("2001:db8::1"));
        assert_eq!(
            client_ip(&peer("[::ffff:10.0.0.2]:80")).as_deref(),
            Some("::ffff:10.0.0.2")
        );
    }

    #[test]
    fn test_other_families_are_denied_even_with_wildcard() {
        let list = AllowList::default();
        assert_eq!(client_ip(&PeerAddr::Unix), None);
        assert!(!list.permits_peer(&PeerAddr::Unix));
        assert!(!list.permits_peer(&PeerAddr::Unknown));
    }

    #[test]
    fn test_permits_peer_by_address_not_port() {
        let list = AllowList::new(["::1"]);
        assert!(list.permits_peer(&peer("[::1]:1234")));
        assert!(!list.permits_peer(&peer("127.0.0.1:1234")));
    }
}
