//! Outer UDP data-packet layout
//!
//! Every established-session datagram carries a fixed 20-byte prefix in
//! front of the AEAD ciphertext:
//!
//! ```text
//! [ route_id: u64 BE (8) | nonce (12) | ciphertext | tag (16) ]
//!                          nonce = [ epoch: u16 BE (2) | zero (2) | counter: u64 BE (8) ]
//! ```
//!
//! The route id gives O(1) session lookup without touching key material,
//! and the full prefix doubles as the AEAD nonce container so encryption
//! can run in place over a single buffer.

/// Length of the route-id field.
pub const ROUTE_ID_LEN: usize = 8;

/// Length of the ChaCha20-Poly1305 nonce.
pub const NONCE_LEN: usize = 12;

/// Reserved outer prefix: route id followed by the nonce.
pub const UDP_PREFIX_LEN: usize = ROUTE_ID_LEN + NONCE_LEN;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Total per-packet framing overhead of a data packet.
pub const UDP_OVERHEAD: usize = UDP_PREFIX_LEN + TAG_LEN;

/// Byte offset of the epoch within a datagram (first two nonce bytes).
pub const EPOCH_OFFSET: usize = ROUTE_ID_LEN;

/// Byte offset of the send counter within a datagram.
pub const COUNTER_OFFSET: usize = EPOCH_OFFSET + 4;

/// Extract the route id from a datagram prefix.
pub fn route_id(datagram: &[u8]) -> Option<u64> {
    let bytes = datagram.get(..ROUTE_ID_LEN)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

/// Extract the key epoch from a datagram prefix.
pub fn epoch(datagram: &[u8]) -> Option<u16> {
    let bytes = datagram.get(EPOCH_OFFSET..EPOCH_OFFSET + 2)?;
    Some(u16::from_be_bytes(bytes.try_into().ok()?))
}

/// Extract the send counter from a datagram prefix.
pub fn counter(datagram: &[u8]) -> Option<u64> {
    let bytes = datagram.get(COUNTER_OFFSET..COUNTER_OFFSET + 8)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

/// Write the outer prefix (route id + nonce) into the head of `buf`.
///
/// `buf` must be at least [`UDP_PREFIX_LEN`] bytes.
pub fn write_prefix(buf: &mut [u8], route_id: u64, epoch: u16, counter: u64) {
    buf[..ROUTE_ID_LEN].copy_from_slice(&route_id.to_be_bytes());
    buf[EPOCH_OFFSET..EPOCH_OFFSET + 2].copy_from_slice(&epoch.to_be_bytes());
    buf[EPOCH_OFFSET + 2..COUNTER_OFFSET].fill(0);
    buf[COUNTER_OFFSET..COUNTER_OFFSET + 8].copy_from_slice(&counter.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_roundtrip() {
        let mut buf = [0u8; UDP_PREFIX_LEN];
        write_prefix(&mut buf, 0x1122334455667788, 7, 42);

        assert_eq!(route_id(&buf), Some(0x1122334455667788));
        assert_eq!(epoch(&buf), Some(7));
        assert_eq!(counter(&buf), Some(42));
        // Reserved nonce bytes stay zero
        assert_eq!(&buf[EPOCH_OFFSET + 2..COUNTER_OFFSET], &[0, 0]);
    }

    #[test]
    fn test_short_packet_yields_none() {
        let buf = [0u8; ROUTE_ID_LEN]; // too short for the epoch
        assert!(route_id(&buf).is_some());
        assert_eq!(epoch(&buf), None);
        assert_eq!(counter(&buf), None);
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(UDP_PREFIX_LEN, 20);
        assert_eq!(UDP_OVERHEAD, 36);
        assert_eq!(EPOCH_OFFSET, 8);
    }
}
