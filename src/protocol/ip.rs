//! Inner IP header inspection
//!
//! The dataplane only ever needs two fields from the tunneled packets:
//! the source address on ingress (AllowedIPs enforcement) and the
//! destination address on egress (session routing). Anything else in the
//! header is opaque.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Minimum IPv4 header length.
const IPV4_HEADER_LEN: usize = 20;

/// Fixed IPv6 header length.
const IPV6_HEADER_LEN: usize = 40;

/// Parse the source address of a raw IPv4/IPv6 packet.
///
/// Returns `None` for anything malformed; the caller drops silently.
pub fn source_addr(packet: &[u8]) -> Option<IpAddr> {
    match version(packet)? {
        4 if packet.len() >= IPV4_HEADER_LEN => Some(IpAddr::V4(ipv4_at(packet, 12))),
        6 if packet.len() >= IPV6_HEADER_LEN => Some(IpAddr::V6(ipv6_at(packet, 8))),
        _ => None,
    }
}

/// Parse the destination address of a raw IPv4/IPv6 packet.
pub fn destination_addr(packet: &[u8]) -> Option<IpAddr> {
    match version(packet)? {
        4 if packet.len() >= IPV4_HEADER_LEN => Some(IpAddr::V4(ipv4_at(packet, 16))),
        6 if packet.len() >= IPV6_HEADER_LEN => Some(IpAddr::V6(ipv6_at(packet, 24))),
        _ => None,
    }
}

fn version(packet: &[u8]) -> Option<u8> {
    Some(packet.first()? >> 4)
}

fn ipv4_at(packet: &[u8], offset: usize) -> Ipv4Addr {
    let bytes: [u8; 4] = packet[offset..offset + 4].try_into().expect("bounds checked");
    Ipv4Addr::from(bytes)
}

fn ipv6_at(packet: &[u8], offset: usize) -> Ipv6Addr {
    let bytes: [u8; 16] = packet[offset..offset + 16]
        .try_into()
        .expect("bounds checked");
    Ipv6Addr::from(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut packet = vec![0u8; IPV4_HEADER_LEN];
        packet[0] = 0x45; // Version 4, IHL 5
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    fn ipv6_packet(src: [u8; 16], dst: [u8; 16]) -> Vec<u8> {
        let mut packet = vec![0u8; IPV6_HEADER_LEN];
        packet[0] = 0x60;
        packet[8..24].copy_from_slice(&src);
        packet[24..40].copy_from_slice(&dst);
        packet
    }

    #[test]
    fn test_ipv4_addresses() {
        let packet = ipv4_packet([10, 0, 0, 2], [192, 168, 1, 100]);

        assert_eq!(source_addr(&packet), Some("10.0.0.2".parse().unwrap()));
        assert_eq!(
            destination_addr(&packet),
            Some("192.168.1.100".parse().unwrap())
        );
    }

    #[test]
    fn test_ipv6_addresses() {
        let mut src = [0u8; 16];
        src[0] = 0xfd;
        src[15] = 2;
        let mut dst = [0u8; 16];
        dst[0] = 0xfd;
        dst[15] = 9;
        let packet = ipv6_packet(src, dst);

        assert_eq!(source_addr(&packet), Some("fd00::2".parse().unwrap()));
        assert_eq!(destination_addr(&packet), Some("fd00::9".parse().unwrap()));
    }

    #[test]
    fn test_truncated_packets() {
        assert_eq!(source_addr(&[]), None);
        assert_eq!(source_addr(&[0x45u8; 10]), None);
        assert_eq!(destination_addr(&[0x60u8; 39]), None);
    }

    #[test]
    fn test_unknown_version() {
        let packet = vec![0x25u8; 40]; // version nibble 2
        assert_eq!(source_addr(&packet), None);
        assert_eq!(destination_addr(&packet), None);
    }
}
