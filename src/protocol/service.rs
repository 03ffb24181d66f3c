//! In-band service packets
//!
//! Control traffic rides inside the encrypted channel, distinguished from
//! tunneled IP packets by a magic first byte: real IPv4/IPv6 packets start
//! with version nibble 4 or 6, never 0xF. A service packet is a three-byte
//! header `{0xFF, version, type}` followed by a type-specific payload.
//!
//! The legacy version (0x00) carries only `SessionReset`, which is also
//! the one frame allowed to travel unencrypted (toward addresses that have
//! no session keys yet). Everything else is version 0x01.

use crate::crypto::x25519::KEY_LEN;

/// First byte of every service packet.
pub const SERVICE_MAGIC: u8 = 0xFF;

/// Legacy header version.
pub const VERSION_LEGACY: u8 = 0x00;

/// Current header version.
pub const VERSION_V1: u8 = 0x01;

/// Service header length.
pub const HEADER_LEN: usize = 3;

const TYPE_SESSION_RESET: u8 = 0x01;

const TYPE_PING: u8 = 0x01;
const TYPE_PONG: u8 = 0x02;
const TYPE_REKEY_INIT: u8 = 0x03;
const TYPE_REKEY_ACK: u8 = 0x04;
const TYPE_EPOCH_EXHAUSTED: u8 = 0x05;

/// A parsed service packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServicePacket {
    /// Legacy: tear down session state and re-handshake.
    SessionReset,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Client ephemeral public key opening a rekey exchange.
    RekeyInit { client_public: [u8; KEY_LEN] },
    /// Server ephemeral public key completing a rekey exchange.
    RekeyAck { server_public: [u8; KEY_LEN] },
    /// The epoch counter cannot advance; reconnect with a fresh handshake.
    EpochExhausted,
    /// Recognized header, reserved type. Swallowed by the handler.
    Reserved { version: u8, kind: u8 },
}

/// Cheap pre-check: does this decrypted payload claim to be a service
/// packet? Inner IP traffic can never match (version nibble 4/6).
pub fn is_service(payload: &[u8]) -> bool {
    payload.first() == Some(&SERVICE_MAGIC)
}

impl ServicePacket {
    /// Parse a decrypted payload. Returns `None` when the payload is not a
    /// well-formed service packet (the caller swallows those).
    pub fn parse(payload: &[u8]) -> Option<ServicePacket> {
        if payload.len() < HEADER_LEN || payload[0] != SERVICE_MAGIC {
            return None;
        }
        let version = payload[1];
        let kind = payload[2];
        let body = &payload[HEADER_LEN..];

        match (version, kind) {
            (VERSION_LEGACY, TYPE_SESSION_RESET) => Some(ServicePacket::SessionReset),
            (VERSION_V1, TYPE_PING) => Some(ServicePacket::Ping),
            (VERSION_V1, TYPE_PONG) => Some(ServicePacket::Pong),
            (VERSION_V1, TYPE_REKEY_INIT) => Some(ServicePacket::RekeyInit {
                client_public: body.get(..KEY_LEN)?.try_into().ok()?,
            }),
            (VERSION_V1, TYPE_REKEY_ACK) => Some(ServicePacket::RekeyAck {
                server_public: body.get(..KEY_LEN)?.try_into().ok()?,
            }),
            (VERSION_V1, TYPE_EPOCH_EXHAUSTED) => Some(ServicePacket::EpochExhausted),
            (VERSION_LEGACY | VERSION_V1, kind) => {
                Some(ServicePacket::Reserved { version, kind })
            }
            _ => None,
        }
    }

    /// Serialize for transmission.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServicePacket::SessionReset => vec![SERVICE_MAGIC, VERSION_LEGACY, TYPE_SESSION_RESET],
            ServicePacket::Ping => vec![SERVICE_MAGIC, VERSION_V1, TYPE_PING],
            ServicePacket::Pong => vec![SERVICE_MAGIC, VERSION_V1, TYPE_PONG],
            ServicePacket::RekeyInit { client_public } => {
                let mut out = vec![SERVICE_MAGIC, VERSION_V1, TYPE_REKEY_INIT];
                out.extend_from_slice(client_public);
                out
            }
            ServicePacket::RekeyAck { server_public } => {
                let mut out = vec![SERVICE_MAGIC, VERSION_V1, TYPE_REKEY_ACK];
                out.extend_from_slice(server_public);
                out
            }
            ServicePacket::EpochExhausted => {
                vec![SERVICE_MAGIC, VERSION_V1, TYPE_EPOCH_EXHAUSTED]
            }
            ServicePacket::Reserved { version, kind } => vec![SERVICE_MAGIC, *version, *kind],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_roundtrip() {
        let packets = [
            ServicePacket::SessionReset,
            ServicePacket::Ping,
            ServicePacket::Pong,
            ServicePacket::RekeyInit {
                client_public: [7u8; KEY_LEN],
            },
            ServicePacket::RekeyAck {
                server_public: [9u8; KEY_LEN],
            },
            ServicePacket::EpochExhausted,
        ];

        for packet in packets {
            let encoded = packet.encode();
            assert!(is_service(&encoded));
            assert_eq!(ServicePacket::parse(&encoded), Some(packet));
        }
    }

    #[test]
    fn test_ip_traffic_is_not_service() {
        assert!(!is_service(&[0x45, 0, 0, 20])); // IPv4
        assert!(!is_service(&[0x60, 0, 0, 0])); // IPv6
        assert!(!is_service(&[]));
    }

    #[test]
    fn test_reserved_type_is_recognized() {
        let parsed = ServicePacket::parse(&[SERVICE_MAGIC, VERSION_V1, 0x7E]);
        assert_eq!(
            parsed,
            Some(ServicePacket::Reserved {
                version: VERSION_V1,
                kind: 0x7E
            })
        );
    }

    #[test]
    fn test_unknown_version_is_malformed() {
        assert_eq!(ServicePacket::parse(&[SERVICE_MAGIC, 0x42, 0x01]), None);
    }

    #[test]
    fn test_truncated_rekey_init() {
        let mut encoded = ServicePacket::RekeyInit {
            client_public: [1u8; KEY_LEN],
        }
        .encode();
        encoded.truncate(HEADER_LEN + KEY_LEN - 1);
        assert_eq!(ServicePacket::parse(&encoded), None);
    }
}
