//! Relay URL canonicalization and public-address filtering.
//!
//! Relay addresses reach the gateway from configuration, from relay hints in
//! `p`/`e`/`a` tags and from NIP-65 relay lists. They are compared and stored
//! in one canonical form:
//!
//! - scheme must be `ws://` or `wss://`
//! - scheme and host lowercased, default ports dropped (nostr-sdk's parser)
//! - trailing slashes removed, paths kept
//!
//! Addresses discovered from the network are additionally rejected when they
//! point at hosts the gateway should never dial: loopback, private and CGNAT
//! ranges, link-local, IPv6 unique-local and IPv4-mapped addresses, `.local`
//! and `.onion` names.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use nostr_sdk::RelayUrl;

/// Result of URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid, public and canonical.
    Ok(String),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL is valid but points somewhere the gateway must not connect to.
    Blocked(&'static str),
}

impl NormalizeResult {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Canonical form of a relay URL without any address filtering.
///
/// Used to compare configured addresses (the local relay may well live on
/// localhost) against addresses found in events.
pub fn canonicalize(url: &str) -> Option<String> {
    let url = url.trim();
    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return None;
    }

    let mut canonical = RelayUrl::parse(url).ok()?.to_string();
    while canonical.ends_with('/') {
        canonical.pop();
    }
    Some(canonical)
}

/// Normalize a relay URL found on the network and reject internal hosts.
///
/// ```ignore
/// use agora_ingest::relay::url::normalize_relay_url;
///
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").ok(),
///     Some("wss://relay.example.com".to_string())
/// );
/// assert!(normalize_relay_url("ws://192.168.1.4:7777").ok().is_none());
/// ```
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    let trimmed = url.trim();
    if !trimmed.starts_with("wss://") && !trimmed.starts_with("ws://") {
        return NormalizeResult::Invalid("URL must start with wss:// or ws://".to_string());
    }

    let Some(canonical) = canonicalize(trimmed) else {
        return NormalizeResult::Invalid(format!("unparseable relay URL: {trimmed}"));
    };

    match blocked_reason(&canonical) {
        Some(reason) => NormalizeResult::Blocked(reason),
        None => NormalizeResult::Ok(canonical),
    }
}

fn blocked_reason(url: &str) -> Option<&'static str> {
    let host = host_of(url);

    if host.is_empty() {
        return Some("empty host");
    }
    if host == "localhost" || host.ends_with(".localhost") {
        return Some("localhost");
    }
    if host.ends_with(".local") {
        return Some("mDNS .local name");
    }
    if host.ends_with(".onion") {
        return Some("onion address");
    }
    if host.contains("umbrel") {
        return Some("home-server address");
    }

    match host.parse::<IpAddr>() {
        Ok(ip) if is_internal_ip(&ip) => Some("non-public IP address"),
        _ => None,
    }
}

/// Host part of a canonical websocket URL, without brackets or port.
fn host_of(url: &str) -> &str {
    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);

    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next().unwrap_or(v6);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// True for addresses that are not reachable on the public internet.
pub fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => {
            // ::ffff:a.b.c.d is never dialled, whatever a.b.c.d is.
            v6.to_ipv4_mapped().is_some()
                || v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_v6_prefix(v6, 0xfe80, 0xffc0)
                || is_v6_prefix(v6, 0xfc00, 0xfe00)
        }
    }
}

fn is_internal_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_link_local()
        || ip.is_private()
        || ip.is_multicast()
        // 100.64.0.0/10 shared address space
        || (a == 100 && (64..=127).contains(&b))
        // 240.0.0.0/4 reserved
        || a >= 240
}

fn is_v6_prefix(ip: &Ipv6Addr, prefix: u16, mask: u16) -> bool {
    ip.segments()[0] & mask == prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form() {
        assert_eq!(
            normalize_relay_url("wss://Relay.Example.COM///").ok(),
            Some("wss://relay.example.com".to_string())
        );
        assert_eq!(
            normalize_relay_url("  wss://relay.example.com/nostr/ ").ok(),
            Some("wss://relay.example.com/nostr".to_string())
        );
        // Default port is dropped by the parser.
        assert_eq!(
            normalize_relay_url("wss://relay.example.com:443").ok(),
            Some("wss://relay.example.com".to_string())
        );
        assert_eq!(
            normalize_relay_url("wss://relay.example.com:4848").ok(),
            Some("wss://relay.example.com:4848".to_string())
        );
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(matches!(
            normalize_relay_url("https://relay.example.com"),
            NormalizeResult::Invalid(_)
        ));
        assert!(matches!(
            normalize_relay_url("relay.example.com"),
            NormalizeResult::Invalid(_)
        ));
        assert_eq!(canonicalize("http://relay.example.com"), None);
    }

    #[test]
    fn test_blocks_internal_hosts() {
        for url in [
            "ws://localhost:7777",
            "ws://127.0.0.1:7777",
            "wss://10.0.0.8",
            "wss://172.20.1.1",
            "wss://192.168.1.1",
            "wss://100.64.0.1",
            "wss://169.254.1.1",
            "wss://0.0.0.0",
            "wss://[::1]:8080",
            "wss://[fd12:3456::1]",
            "wss://[fe80::1]",
            "wss://[::ffff:8.8.8.8]",
            "wss://myserver.local",
            "wss://abcdef.onion",
            "wss://umbrel.example.com",
        ] {
            assert!(
                matches!(normalize_relay_url(url), NormalizeResult::Blocked(_)),
                "{url} should be blocked"
            );
        }
    }

    #[test]
    fn test_allows_public_hosts() {
        assert!(normalize_relay_url("wss://relay.damus.io").is_ok());
        assert!(normalize_relay_url("wss://nos.lol").is_ok());
        assert!(normalize_relay_url("wss://100.63.0.1").is_ok());
        assert!(normalize_relay_url("wss://8.8.8.8").is_ok());
    }

    #[test]
    fn test_canonicalize_keeps_local_addresses() {
        assert_eq!(
            canonicalize("ws://localhost:7777/"),
            Some("ws://localhost:7777".to_string())
        );
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("wss://relay.example.com:8080/path"), "relay.example.com");
        assert_eq!(host_of("wss://[::1]:8080"), "::1");
        assert_eq!(host_of("ws://10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_is_internal_ip() {
        assert!(is_internal_ip(&IpAddr::V4(Ipv4Addr::new(100, 127, 255, 255))));
        assert!(!is_internal_ip(&IpAddr::V4(Ipv4Addr::new(100, 63, 0, 1))));
        assert!(!is_internal_ip(&IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
        assert!(is_internal_ip(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_internal_ip(&IpAddr::V6(Ipv6Addr::new(
            0x2607, 0xf8b0, 0x4004, 0x800, 0, 0, 0, 0x200e
        ))));
    }
}
