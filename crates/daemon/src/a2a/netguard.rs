//! RFC-1918 admissibility
//!
//! The bridge never talks to the public internet: bind addresses, peer
//! addresses, agent endpoint hosts, and CORS origins must all fall inside
//! the private IPv4 ranges or loopback. Everything else - including
//! link-local and multicast - is refused.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::StartupError;

/// Whether an address is admissible: 10/8, 172.16/12, 192.168/16, 127/8,
/// or ::1.
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if *v6 == Ipv6Addr::LOCALHOST {
                return true;
            }
            // IPv4-mapped addresses are judged by their embedded v4.
            match v6.to_ipv4_mapped() {
                Some(v4) => is_private_v4(&v4),
                None => false,
            }
        }
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || o[0] == 127
}

/// Validate a configured bind host. The error names the violating address
/// so startup failures are self-explanatory.
pub fn validate_bind_host(host: &str) -> Result<IpAddr, StartupError> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| StartupError::UnparsableBind(host.to_string()))?;
    if is_private(&ip) {
        Ok(ip)
    } else {
        Err(StartupError::NonPrivateBind(ip))
    }
}

/// Whether a `a.b.c.d/len` CIDR lies entirely inside the private ranges.
pub fn cidr_is_private(cidr: &str) -> bool {
    let Some((addr, len)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(base): Result<Ipv4Addr, _> = addr.parse() else {
        return false;
    };
    let Ok(len) = len.parse::<u8>() else {
        return false;
    };
    if len > 32 {
        return false;
    }
    // The base and the top of the range must both be private; the private
    // blocks are aligned, so the prefix must be at least as long.
    let o = base.octets();
    match o[0] {
        10 => len >= 8 && is_private_v4(&base),
        127 => len >= 8 && is_private_v4(&base),
        172 => len >= 12 && is_private_v4(&base),
        192 => len >= 16 && is_private_v4(&base),
        _ => false,
    }
}

/// Extract and validate the host of an `https://` or `wss://` endpoint URL.
/// Only IP-literal hosts can pass; DNS names cannot be proven private.
pub fn url_host_is_private(url: &str) -> bool {
    parse_url_host(url).map(|ip| is_private(&ip)).unwrap_or(false)
}

/// Host portion of a URL, as an IP literal.
pub fn parse_url_host(url: &str) -> Option<IpAddr> {
    let rest = url.split_once("://").map(|(_, r)| r)?;
    let authority = rest.split(['/', '?', '#']).next()?;
    // Strip userinfo if present.
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = if let Some(stripped) = authority.strip_prefix('[') {
        // Bracketed IPv6.
        stripped.split(']').next()?
    } else {
        authority.rsplit_once(':').map_or(authority, |(h, port)| {
            // Only treat the suffix as a port when it is numeric.
            if port.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                authority
            }
        })
    };
    host.parse().ok()
}

/// Origin header check for CORS: scheme://host[:port] with a private host.
pub fn origin_is_private(origin: &str) -> bool {
    url_host_is_private(origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_private_ranges() {
        assert!(is_private(&ip("10.0.0.1")));
        assert!(is_private(&ip("10.255.255.254")));
        assert!(is_private(&ip("172.16.0.1")));
        assert!(is_private(&ip("172.31.255.1")));
        assert!(is_private(&ip("192.168.1.10")));
        assert!(is_private(&ip("127.0.0.1")));
        assert!(is_private(&ip("::1")));
    }

    #[test]
    fn test_public_and_special_ranges_refused() {
        assert!(!is_private(&ip("8.8.8.8")));
        assert!(!is_private(&ip("172.15.0.1")));
        assert!(!is_private(&ip("172.32.0.1")));
        assert!(!is_private(&ip("192.167.1.1")));
        // Link-local and multicast are forbidden, not merely non-private.
        assert!(!is_private(&ip("169.254.10.10")));
        assert!(!is_private(&ip("224.0.0.1")));
        assert!(!is_private(&ip("fe80::1")));
        assert!(!is_private(&ip("2001:db8::1")));
    }

    #[test]
    fn test_ipv4_mapped_v6() {
        assert!(is_private(&ip("::ffff:192.168.0.5")));
        assert!(!is_private(&ip("::ffff:8.8.8.8")));
    }

    #[test]
    fn test_validate_bind_host() {
        assert!(validate_bind_host("192.168.0.2").is_ok());
        let err = validate_bind_host("8.8.8.8").unwrap_err();
        assert!(err.to_string().contains("8.8.8.8"));
        assert!(validate_bind_host("not-an-ip").is_err());
    }

    #[test]
    fn test_cidr_validation() {
        assert!(cidr_is_private("10.0.0.0/8"));
        assert!(cidr_is_private("192.168.1.0/24"));
        assert!(cidr_is_private("172.16.0.0/12"));
        assert!(!cidr_is_private("0.0.0.0/0"));
        assert!(!cidr_is_private("10.0.0.0/4"));
        assert!(!cidr_is_private("203.0.113.0/24"));
        assert!(!cidr_is_private("garbage"));
    }

    #[test]
    fn test_url_host_extraction() {
        assert_eq!(
            parse_url_host("https://192.168.1.10:3500/a2a"),
            Some(ip("192.168.1.10"))
        );
        assert_eq!(parse_url_host("wss://[::1]:3500/a2a/ws"), Some(ip("::1")));
        assert_eq!(parse_url_host("https://example.com/a2a"), None);
        assert!(url_host_is_private("https://10.1.2.3/a2a"));
        assert!(!url_host_is_private("https://8.8.8.8/a2a"));
    }

    #[test]
    fn test_origin_check() {
        assert!(origin_is_private("https://192.168.1.4"));
        assert!(origin_is_private("https://192.168.1.4:8443"));
        assert!(!origin_is_private("https://evil.example"));
        assert!(!origin_is_private("*"));
    }
}
