//! Rekey state machine
//!
//! Each session carries a [`RekeyFsm`] guarding its epoch counter and the
//! ephemeral private key of an in-flight rekey. Epochs are strictly
//! monotonic and never wrap: when the counter tops out, rekeying fails
//! with `EpochExhausted` and the session lives on under its current keys
//! until the client reconnects with a fresh handshake.
//!
//! Key installation and send-side promotion are split on purpose. The
//! server installs the new generation as soon as the rekey exchange
//! completes (so it can *receive* under the new epoch immediately) but
//! keeps *sending* under the old epoch until the client demonstrates the
//! new one on the wire.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use zeroize::Zeroize;

use crate::crypto::x25519::{self, KEY_LEN};
use crate::crypto::{kdf, TunnelCipher};
use crate::error::SessionError;

/// How long a pending rekey private key survives without the client
/// demonstrating the new epoch.
pub const PENDING_REKEY_TTL: Duration = Duration::from_secs(30);

/// Which side of the tunnel this FSM governs; decides how the directional
/// c2s/s2c keys map onto send/recv.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyRole {
    Server,
    Client,
}

/// Ephemeral state of one in-flight rekey exchange.
struct PendingRekey {
    private_key: [u8; KEY_LEN],
    client_public: [u8; KEY_LEN],
    deadline: Instant,
}

impl Drop for PendingRekey {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

struct RekeyState {
    last_epoch: u16,
    send_activated: bool,
    pending: Option<PendingRekey>,
}

/// Per-session rekey FSM. All mutation happens under its own lock; the
/// cipher it feeds has its own.
pub struct RekeyFsm {
    cipher: Arc<TunnelCipher>,
    role: RekeyRole,
    inner: Mutex<RekeyState>,
}

impl RekeyFsm {
    /// Epoch 0 is the handshake generation, already live in `cipher`.
    pub fn new(cipher: Arc<TunnelCipher>, role: RekeyRole) -> Self {
        Self {
            cipher,
            role,
            inner: Mutex::new(RekeyState {
                last_epoch: 0,
                send_activated: true,
                pending: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RekeyState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install directional keys for `epoch`. Rejects any epoch at or below
    /// the last accepted one.
    pub fn apply_keys(
        &self,
        c2s_key: [u8; KEY_LEN],
        s2c_key: [u8; KEY_LEN],
        epoch: u16,
    ) -> Result<(), SessionError> {
        let mut state = self.lock();
        self.apply_keys_locked(&mut state, c2s_key, s2c_key, epoch)
    }

    fn apply_keys_locked(
        &self,
        state: &mut RekeyState,
        c2s_key: [u8; KEY_LEN],
        s2c_key: [u8; KEY_LEN],
        epoch: u16,
    ) -> Result<(), SessionError> {
        if epoch <= state.last_epoch {
            return Err(SessionError::StaleEpoch {
                epoch,
                last: state.last_epoch,
            });
        }
        let (send_key, recv_key) = match self.role {
            RekeyRole::Server => (s2c_key, c2s_key),
            RekeyRole::Client => (c2s_key, s2c_key),
        };
        self.cipher.install_keys(send_key, recv_key, epoch);
        state.last_epoch = epoch;
        state.send_activated = false;
        Ok(())
    }

    /// Called after every successful decryption with the epoch observed on
    /// the wire: once the peer demonstrates the newest epoch, promote it
    /// for outbound traffic. Idempotent; stale epochs are ignored.
    pub fn activate_send_epoch(&self, observed_epoch: u16) {
        let mut state = self.lock();
        if observed_epoch != state.last_epoch || state.send_activated {
            return;
        }
        self.cipher.activate_send_epoch(observed_epoch);
        state.send_activated = true;
        state.pending = None;
    }

    /// Discard an expired pending rekey private key.
    pub fn abort_pending_if_expired(&self, now: Instant) {
        let mut state = self.lock();
        if state
            .pending
            .as_ref()
            .is_some_and(|pending| pending.deadline <= now)
        {
            state.pending = None;
        }
    }

    /// Stash the ephemeral private key of an in-flight exchange.
    pub fn set_pending_private_key(
        &self,
        private_key: [u8; KEY_LEN],
        client_public: [u8; KEY_LEN],
        deadline: Instant,
    ) {
        self.lock().pending = Some(PendingRekey {
            private_key,
            client_public,
            deadline,
        });
    }

    /// The pending ephemeral private key, if one is alive.
    pub fn pending_private_key(&self) -> Option<[u8; KEY_LEN]> {
        self.lock().pending.as_ref().map(|p| p.private_key)
    }

    pub fn clear_pending_private_key(&self) {
        self.lock().pending = None;
    }

    /// Last accepted epoch.
    pub fn last_epoch(&self) -> u16 {
        self.lock().last_epoch
    }

    /// Serve a client `RekeyInit`: derive the next key generation and
    /// return the server ephemeral public key for the ack.
    ///
    /// A retransmitted init from the same client public key inside the
    /// pending window re-derives the same ack instead of consuming another
    /// epoch.
    pub fn server_handle_rekey_init(
        &self,
        client_public: &[u8; KEY_LEN],
        now: Instant,
    ) -> Result<[u8; KEY_LEN], SessionError> {
        let mut state = self.lock();

        if let Some(pending) = &state.pending {
            if pending.client_public == *client_public && pending.deadline > now {
                return Ok(x25519::public_key(&pending.private_key));
            }
        }

        let epoch = match state.last_epoch.checked_add(1) {
            Some(epoch) => epoch,
            None => return Err(SessionError::EpochExhausted),
        };

        let (eph_private, eph_public) = x25519::generate_keypair();
        let shared = x25519::dh(&eph_private, client_public);
        let (c2s_key, s2c_key) = kdf::kdf2(&shared, &epoch.to_be_bytes());

        self.apply_keys_locked(&mut state, c2s_key, s2c_key, epoch)?;
        state.pending = Some(PendingRekey {
            private_key: eph_private,
            client_public: *client_public,
            deadline: now + PENDING_REKEY_TTL,
        });

        Ok(eph_public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm() -> (RekeyFsm, Arc<TunnelCipher>) {
        let cipher = Arc::new(TunnelCipher::new(1, [1u8; 32], [2u8; 32]));
        (RekeyFsm::new(cipher.clone(), RekeyRole::Server), cipher)
    }

    #[test]
    fn test_epoch_monotonicity() {
        let (fsm, _) = fsm();

        assert!(fsm.apply_keys([3u8; 32], [4u8; 32], 1).is_ok());
        assert_eq!(fsm.last_epoch(), 1);

        // Equal and lower epochs are rejected and leave state untouched.
        assert!(matches!(
            fsm.apply_keys([5u8; 32], [6u8; 32], 1),
            Err(SessionError::StaleEpoch { epoch: 1, last: 1 })
        ));
        assert!(matches!(
            fsm.apply_keys([5u8; 32], [6u8; 32], 0),
            Err(SessionError::StaleEpoch { epoch: 0, last: 1 })
        ));
        assert_eq!(fsm.last_epoch(), 1);

        assert!(fsm.apply_keys([5u8; 32], [6u8; 32], 9).is_ok());
        assert_eq!(fsm.last_epoch(), 9);
    }

    #[test]
    fn test_send_epoch_promotion() {
        let (fsm, cipher) = fsm();

        fsm.apply_keys([3u8; 32], [4u8; 32], 1).unwrap();
        // Not yet demonstrated by the peer: outbound stays on epoch 0.
        assert_eq!(cipher.send_epoch(), 0);

        fsm.activate_send_epoch(1);
        assert_eq!(cipher.send_epoch(), 1);

        // Idempotent, and stale observations do nothing.
        fsm.activate_send_epoch(1);
        fsm.activate_send_epoch(0);
        assert_eq!(cipher.send_epoch(), 1);
    }

    #[test]
    fn test_pending_key_expiry() {
        let (fsm, _) = fsm();
        let now = Instant::now();

        fsm.set_pending_private_key([7u8; 32], [8u8; 32], now + Duration::from_secs(5));
        assert!(fsm.pending_private_key().is_some());

        fsm.abort_pending_if_expired(now);
        assert!(fsm.pending_private_key().is_some());

        fsm.abort_pending_if_expired(now + Duration::from_secs(5));
        assert!(fsm.pending_private_key().is_none());
    }

    #[test]
    fn test_rekey_init_advances_epoch() {
        let (fsm, _) = fsm();
        let (_, client_public) = x25519::generate_keypair();

        let server_pub = fsm
            .server_handle_rekey_init(&client_public, Instant::now())
            .unwrap();
        assert_ne!(server_pub, [0u8; 32]);
        assert_eq!(fsm.last_epoch(), 1);
        assert!(fsm.pending_private_key().is_some());
    }

    #[test]
    fn test_rekey_init_retransmit_is_idempotent() {
        let (fsm, _) = fsm();
        let (_, client_public) = x25519::generate_keypair();
        let now = Instant::now();

        let first = fsm.server_handle_rekey_init(&client_public, now).unwrap();
        let second = fsm.server_handle_rekey_init(&client_public, now).unwrap();

        assert_eq!(first, second);
        assert_eq!(fsm.last_epoch(), 1);
    }

    #[test]
    fn test_rekey_init_from_new_key_advances_again() {
        let (fsm, _) = fsm();
        let (_, first_public) = x25519::generate_keypair();
        let (_, second_public) = x25519::generate_keypair();
        let now = Instant::now();

        fsm.server_handle_rekey_init(&first_public, now).unwrap();
        fsm.server_handle_rekey_init(&second_public, now).unwrap();
        assert_eq!(fsm.last_epoch(), 2);
    }

    #[test]
    fn test_epoch_exhaustion() {
        let cipher = Arc::new(TunnelCipher::new(1, [1u8; 32], [2u8; 32]));
        let fsm = RekeyFsm::new(cipher, RekeyRole::Server);
        fsm.apply_keys([3u8; 32], [4u8; 32], u16::MAX).unwrap();

        let (_, client_public) = x25519::generate_keypair();
        assert!(matches!(
            fsm.server_handle_rekey_init(&client_public, Instant::now()),
            Err(SessionError::EpochExhausted)
        ));
        // The session itself stays usable at the terminal epoch.
        assert_eq!(fsm.last_epoch(), u16::MAX);
    }

    #[test]
    fn test_activation_clears_pending() {
        let (fsm, _) = fsm();
        let (_, client_public) = x25519::generate_keypair();

        fsm.server_handle_rekey_init(&client_public, Instant::now())
            .unwrap();
        assert!(fsm.pending_private_key().is_some());

        fsm.activate_send_epoch(1);
        assert!(fsm.pending_private_key().is_none());
    }

    #[test]
    fn test_client_role_swaps_orientation() {
        let cipher = Arc::new(TunnelCipher::new(1, [1u8; 32], [2u8; 32]));
        let fsm = RekeyFsm::new(cipher.clone(), RekeyRole::Client);

        // Applying as a client must still advance the epoch; orientation
        // is covered end-to-end by the cipher tests.
        fsm.apply_keys([3u8; 32], [4u8; 32], 1).unwrap();
        assert_eq!(fsm.last_epoch(), 1);
    }
}
