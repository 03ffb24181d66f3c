//! Per-session transport encryption
//!
//! [`TunnelCipher`] owns the symmetric key material for one session and
//! seals/opens data packets in place over the outer layout described in
//! [`crate::protocol::wire`]. Two key generations are retained: the
//! current epoch plus the previous one, which stays alive until the peer
//! demonstrates the new epoch and the send side is promoted.

use std::sync::{Mutex, PoisonError};

use chacha20poly1305::{aead::KeyInit, AeadInPlace, ChaCha20Poly1305, Key, Nonce, Tag};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::protocol::wire::{self, ROUTE_ID_LEN, TAG_LEN, UDP_OVERHEAD, UDP_PREFIX_LEN};

/// Symmetric key length.
pub const KEY_LEN: usize = 32;

/// Per-session AEAD capability consumed by the dataplane.
///
/// Both directions run in place over a single buffer with the outer prefix
/// and tag slots reserved, so the hot path does not allocate. `route_id`
/// and `zeroize_keys` are optional capabilities; the default
/// implementations advertise "not supported".
pub trait SessionCipher: Send + Sync {
    /// Encrypt a frame laid out as `[prefix | payload | tag slot]`,
    /// writing the outer prefix and the tag. Returns the datagram length
    /// (always `frame.len()`).
    fn seal_in_place(&self, frame: &mut [u8]) -> Result<usize, CryptoError>;

    /// Decrypt a full datagram in place. On success the plaintext occupies
    /// `datagram[UDP_PREFIX_LEN..UDP_PREFIX_LEN + n]` where `n` is the
    /// returned length. The ciphertext region is clobbered on failure.
    fn open_in_place(&self, datagram: &mut [u8]) -> Result<usize, CryptoError>;

    /// Stable per-session route id, if this cipher carries one.
    fn route_id(&self) -> Option<u64> {
        None
    }

    /// Overwrite key material. Subsequent seal/open calls fail.
    fn zeroize_keys(&self) {}
}

/// One-shot AEAD seal with a counter nonce (4 zero bytes + counter LE).
///
/// Handshake-scoped: transport traffic uses the in-place paths on
/// [`TunnelCipher`] instead.
pub fn seal_once(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use chacha20poly1305::aead::{Aead, Payload};

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// One-shot AEAD open matching [`seal_once`].
pub fn open_once(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use chacha20poly1305::aead::{Aead, Payload};

    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// One generation of directional keys.
struct KeyGeneration {
    epoch: u16,
    send: [u8; KEY_LEN],
    recv: [u8; KEY_LEN],
}

impl KeyGeneration {
    fn wipe(&mut self) {
        self.send.zeroize();
        self.recv.zeroize();
    }
}

struct CipherState {
    current: KeyGeneration,
    previous: Option<KeyGeneration>,
    /// Epoch used for outbound packets; trails `current.epoch` until the
    /// peer demonstrates the new generation.
    send_epoch: u16,
    counter: u64,
    wiped: bool,
}

impl CipherState {
    fn generation(&self, epoch: u16) -> Option<&KeyGeneration> {
        if self.current.epoch == epoch {
            return Some(&self.current);
        }
        self.previous.as_ref().filter(|g| g.epoch == epoch)
    }
}

/// ChaCha20-Poly1305 session cipher with epoch-tagged key generations.
pub struct TunnelCipher {
    route_id: u64,
    state: Mutex<CipherState>,
}

impl TunnelCipher {
    /// Build a cipher from handshake-derived keys at epoch 0.
    pub fn new(route_id: u64, send_key: [u8; KEY_LEN], recv_key: [u8; KEY_LEN]) -> Self {
        Self {
            route_id,
            state: Mutex::new(CipherState {
                current: KeyGeneration {
                    epoch: 0,
                    send: send_key,
                    recv: recv_key,
                },
                previous: None,
                send_epoch: 0,
                counter: 0,
                wiped: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CipherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a new key generation. Outbound traffic keeps the previous
    /// generation until [`TunnelCipher::activate_send_epoch`] promotes the
    /// new one; inbound accepts either epoch in the interim.
    pub fn install_keys(&self, send_key: [u8; KEY_LEN], recv_key: [u8; KEY_LEN], epoch: u16) {
        let mut state = self.lock();
        if state.wiped {
            return;
        }
        if let Some(mut old) = state.previous.take() {
            old.wipe();
        }
        let superseded = std::mem::replace(
            &mut state.current,
            KeyGeneration {
                epoch,
                send: send_key,
                recv: recv_key,
            },
        );
        state.previous = Some(superseded);
    }

    /// Promote `epoch` for outbound encryption and retire the superseded
    /// generation. Idempotent; unknown epochs are ignored.
    pub fn activate_send_epoch(&self, epoch: u16) {
        let mut state = self.lock();
        if state.wiped || state.current.epoch != epoch || state.send_epoch == epoch {
            return;
        }
        state.send_epoch = epoch;
        // Fresh key generation, fresh nonce space.
        state.counter = 0;
        if let Some(mut old) = state.previous.take() {
            old.wipe();
        }
    }

    /// Epoch currently used for outbound packets.
    pub fn send_epoch(&self) -> u16 {
        self.lock().send_epoch
    }
}

impl SessionCipher for TunnelCipher {
    fn seal_in_place(&self, frame: &mut [u8]) -> Result<usize, CryptoError> {
        if frame.len() < UDP_OVERHEAD {
            return Err(CryptoError::TruncatedPacket { got: frame.len() });
        }

        let mut state = self.lock();
        if state.wiped {
            return Err(CryptoError::Encryption);
        }
        let send_epoch = state.send_epoch;
        let key = match state.generation(send_epoch) {
            Some(generation) => generation.send,
            None => return Err(CryptoError::UnknownEpoch { epoch: send_epoch }),
        };
        state.counter += 1;
        let counter = state.counter;

        wire::write_prefix(frame, self.route_id, send_epoch, counter);

        let (head, body) = frame.split_at_mut(UDP_PREFIX_LEN);
        let payload_len = body.len() - TAG_LEN;
        let (payload, tag_slot) = body.split_at_mut(payload_len);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let tag = cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&head[ROUTE_ID_LEN..]),
                &head[..ROUTE_ID_LEN],
                payload,
            )
            .map_err(|_| CryptoError::Encryption)?;
        tag_slot.copy_from_slice(&tag);

        Ok(UDP_PREFIX_LEN + payload_len + TAG_LEN)
    }

    fn open_in_place(&self, datagram: &mut [u8]) -> Result<usize, CryptoError> {
        if datagram.len() < UDP_OVERHEAD {
            return Err(CryptoError::TruncatedPacket {
                got: datagram.len(),
            });
        }
        let epoch = wire::epoch(datagram).ok_or(CryptoError::Decryption)?;

        let state = self.lock();
        if state.wiped {
            return Err(CryptoError::Decryption);
        }
        let key = match state.generation(epoch) {
            Some(generation) => generation.recv,
            None => return Err(CryptoError::UnknownEpoch { epoch }),
        };
        drop(state);

        let (head, body) = datagram.split_at_mut(UDP_PREFIX_LEN);
        let payload_len = body.len() - TAG_LEN;
        let (ciphertext, tag) = body.split_at_mut(payload_len);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&head[ROUTE_ID_LEN..]),
                &head[..ROUTE_ID_LEN],
                ciphertext,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::Decryption)?;

        Ok(payload_len)
    }

    fn route_id(&self) -> Option<u64> {
        Some(self.route_id)
    }

    fn zeroize_keys(&self) {
        let mut state = self.lock();
        state.current.wipe();
        if let Some(mut old) = state.previous.take() {
            old.wipe();
        }
        state.wiped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::UDP_PREFIX_LEN;

    fn pair(route_id: u64) -> (TunnelCipher, TunnelCipher) {
        let c2s = [1u8; 32];
        let s2c = [2u8; 32];
        // Client sends with c2s, server receives with it, and vice versa.
        (
            TunnelCipher::new(route_id, c2s, s2c),
            TunnelCipher::new(route_id, s2c, c2s),
        )
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; UDP_PREFIX_LEN + payload.len() + TAG_LEN];
        buf[UDP_PREFIX_LEN..UDP_PREFIX_LEN + payload.len()].copy_from_slice(payload);
        buf
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (client, server) = pair(0x1122334455667788);

        let mut buf = frame(b"inner ip packet");
        let sent = client.seal_in_place(&mut buf).unwrap();
        assert_eq!(sent, buf.len());
        assert_eq!(wire::route_id(&buf), Some(0x1122334455667788));
        assert_eq!(wire::epoch(&buf), Some(0));

        let n = server.open_in_place(&mut buf).unwrap();
        assert_eq!(&buf[UDP_PREFIX_LEN..UDP_PREFIX_LEN + n], b"inner ip packet");
    }

    #[test]
    fn test_open_rejects_tampered_tag() {
        let (client, server) = pair(1);

        let mut buf = frame(b"payload");
        client.seal_in_place(&mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        assert!(matches!(
            server.open_in_place(&mut buf),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn test_counters_produce_distinct_nonces() {
        let (client, _) = pair(1);

        let mut a = frame(b"first");
        let mut b = frame(b"first");
        client.seal_in_place(&mut a).unwrap();
        client.seal_in_place(&mut b).unwrap();

        assert_ne!(wire::counter(&a), wire::counter(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_rekey_keeps_previous_generation_until_activation() {
        let (client, server) = pair(9);

        let new_c2s = [3u8; 32];
        let new_s2c = [4u8; 32];
        client.install_keys(new_c2s, new_s2c, 1);
        server.install_keys(new_s2c, new_c2s, 1);

        // Client has not activated epoch 1: still seals with epoch 0.
        let mut old_epoch = frame(b"old generation");
        client.seal_in_place(&mut old_epoch).unwrap();
        assert_eq!(wire::epoch(&old_epoch), Some(0));
        assert!(server.open_in_place(&mut old_epoch).is_ok());

        // After activation the new generation carries the traffic.
        client.activate_send_epoch(1);
        let mut new_epoch = frame(b"new generation");
        client.seal_in_place(&mut new_epoch).unwrap();
        assert_eq!(wire::epoch(&new_epoch), Some(1));
        assert!(server.open_in_place(&mut new_epoch).is_ok());

        // Once the server also promotes epoch 1, epoch 0 keys are gone.
        server.activate_send_epoch(1);
        let mut stale = frame(b"stale");
        wire::write_prefix(&mut stale, 9, 0, 7);
        assert!(matches!(
            server.open_in_place(&mut stale),
            Err(CryptoError::UnknownEpoch { epoch: 0 })
        ));
    }

    #[test]
    fn test_zeroized_cipher_refuses_traffic() {
        let (client, server) = pair(2);

        let mut buf = frame(b"payload");
        client.seal_in_place(&mut buf).unwrap();

        server.zeroize_keys();
        assert!(server.open_in_place(&mut buf).is_err());

        let mut out = frame(b"payload");
        assert!(matches!(
            server.seal_in_place(&mut out),
            Err(CryptoError::Encryption)
        ));
    }

    #[test]
    fn test_short_datagram_is_truncated_error() {
        let (_, server) = pair(3);
        let mut short = vec![0u8; UDP_OVERHEAD - 1];
        assert!(matches!(
            server.open_in_place(&mut short),
            Err(CryptoError::TruncatedPacket { .. })
        ));
    }
}
