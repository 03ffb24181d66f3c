//! Immutable session identity
//!
//! A [`Session`] is the authorization record produced by registration:
//! who the client is, where it lives inside the tunnel, and which inner
//! source addresses it may emit. Everything is normalized at construction
//! (IPv4-mapped IPv6 collapsed to IPv4) so the hot-path checks are plain
//! hash lookups.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

/// Collapse IPv4-mapped IPv6 addresses to their IPv4 form.
pub fn canonical_ip(addr: IpAddr) -> IpAddr {
    addr.to_canonical()
}

/// Canonicalize the IP half of a socket address.
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(canonical_ip(addr.ip()), addr.port())
}

/// Immutable identity/authorization record for one client.
#[derive(Debug)]
pub struct Session {
    internal_addr: IpAddr,
    external_addr: SocketAddr,
    pub_key: Vec<u8>,
    /// Single-host allowed sources, O(1) membership.
    allowed_addrs: HashMap<IpAddr, ()>,
    /// Non-host allowed prefixes; typically empty.
    allowed_subnets: Vec<IpNet>,
}

impl Session {
    /// Build a session. `allowed` mixes host and prefix entries; host
    /// entries land in the O(1) set, the rest in the prefix list. The
    /// internal address is implicitly an allowed source.
    pub fn new(
        internal_addr: IpAddr,
        external_addr: SocketAddr,
        pub_key: Vec<u8>,
        allowed: &[IpNet],
    ) -> Self {
        let mut allowed_addrs = HashMap::new();
        let mut allowed_subnets = Vec::new();
        for net in allowed {
            if net.prefix_len() == net.max_prefix_len() {
                allowed_addrs.insert(canonical_ip(net.addr()), ());
            } else {
                allowed_subnets.push(*net);
            }
        }

        Self {
            internal_addr: canonical_ip(internal_addr),
            external_addr: canonical_addr(external_addr),
            pub_key,
            allowed_addrs,
            allowed_subnets,
        }
    }

    /// Tunnel-internal address, unique per live session.
    pub fn internal_addr(&self) -> IpAddr {
        self.internal_addr
    }

    /// The external address observed at registration time.
    pub fn external_addr(&self) -> SocketAddr {
        self.external_addr
    }

    /// Client static public key; may be empty for anonymous sessions.
    pub fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }

    /// Single-host allowed sources (for the egress routing index).
    pub fn allowed_addrs(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.allowed_addrs.keys().copied()
    }

    /// AllowedIPs enforcement for inner packets.
    pub fn is_source_allowed(&self, src: IpAddr) -> bool {
        let src = canonical_ip(src);
        if src == self.internal_addr {
            return true;
        }
        if self.allowed_addrs.contains_key(&src) {
            return true;
        }
        self.allowed_subnets.iter().any(|net| net.contains(&src))
    }

    /// Prefix-only membership check used by egress routing fallback.
    pub fn subnet_contains(&self, addr: IpAddr) -> bool {
        let addr = canonical_ip(addr);
        self.allowed_subnets.iter().any(|net| net.contains(&addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn session(allowed: &[&str]) -> Session {
        let nets: Vec<IpNet> = allowed.iter().map(|s| s.parse().unwrap()).collect();
        Session::new(
            "10.0.0.2".parse().unwrap(),
            SocketAddr::new(Ipv4Addr::new(192, 168, 1, 51).into(), 5050),
            b"pk".to_vec(),
            &nets,
        )
    }

    #[test]
    fn test_internal_addr_implicitly_allowed() {
        let s = session(&[]);
        assert!(s.is_source_allowed("10.0.0.2".parse().unwrap()));
        assert!(!s.is_source_allowed("10.0.0.99".parse().unwrap()));
    }

    #[test]
    fn test_host_entries_are_exact() {
        let s = session(&["10.0.0.7/32", "fd00::7/128"]);
        assert!(s.is_source_allowed("10.0.0.7".parse().unwrap()));
        assert!(s.is_source_allowed("fd00::7".parse().unwrap()));
        assert!(!s.is_source_allowed("10.0.0.8".parse().unwrap()));
    }

    #[test]
    fn test_subnet_entries_match_prefix() {
        let s = session(&["172.16.0.0/16"]);
        assert!(s.is_source_allowed("172.16.5.9".parse().unwrap()));
        assert!(!s.is_source_allowed("172.17.0.1".parse().unwrap()));
        assert!(s.subnet_contains("172.16.200.1".parse().unwrap()));
        assert!(!s.subnet_contains("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_source_collapses() {
        let s = session(&["10.0.0.7/32"]);
        let mapped: IpAddr = "::ffff:10.0.0.7".parse().unwrap();
        assert!(s.is_source_allowed(mapped));

        let mapped_internal: IpAddr = "::ffff:10.0.0.2".parse().unwrap();
        assert!(s.is_source_allowed(mapped_internal));
    }

    #[test]
    fn test_mapped_host_entry_normalized_at_construction() {
        let s = session(&["::ffff:10.0.0.7/128"]);
        assert!(s.is_source_allowed("10.0.0.7".parse().unwrap()));
    }

    #[test]
    fn test_canonical_addr() {
        let mapped: SocketAddr = "[::ffff:192.168.1.51]:5050".parse().unwrap();
        let plain: SocketAddr = "192.168.1.51:5050".parse().unwrap();
        assert_eq!(canonical_addr(mapped), plain);
    }
}
