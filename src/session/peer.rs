//! Runtime peer state
//!
//! A [`Peer`] couples an immutable [`Session`] with the mutable runtime
//! pieces: the session cipher, the optional rekey FSM, the serialized
//! egress, and the lock-free flags the dataplane reads on every packet.
//! Peers are shared (`Arc`) between the repository indexes, in-flight
//! packet handlers, and `AllPeers` snapshots; deletion never invalidates
//! outstanding references, it just flips `closed` and wipes the keys
//! behind the crypto write lock.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::SessionCipher;
use crate::session::egress::Egress;
use crate::session::rekey::RekeyFsm;
use crate::session::session::Session;

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

const ENDPOINT_EMPTY: u64 = 0;
const ENDPOINT_V6: u64 = 1 << 62;
const ENDPOINT_V4: u64 = 1 << 63;

/// Atomic optional socket address.
///
/// IPv4 endpoints pack into a single word (flag | ip | port) so the hot
/// read path is one atomic load; IPv6 takes the read-write-lock detour.
pub struct AtomicEndpoint {
    packed: AtomicU64,
    v6: RwLock<Option<SocketAddr>>,
}

impl AtomicEndpoint {
    pub fn unset() -> Self {
        Self {
            packed: AtomicU64::new(ENDPOINT_EMPTY),
            v6: RwLock::new(None),
        }
    }

    pub fn new(addr: SocketAddr) -> Self {
        let endpoint = Self::unset();
        endpoint.store(addr);
        endpoint
    }

    pub fn store(&self, addr: SocketAddr) {
        match addr {
            SocketAddr::V4(v4) => {
                let packed = ENDPOINT_V4
                    | (u64::from(u32::from(*v4.ip())) << 16)
                    | u64::from(v4.port());
                self.packed.store(packed, Ordering::Release);
            }
            SocketAddr::V6(_) => {
                // Publish the address before the marker so a reader that
                // sees the marker finds it.
                *self
                    .v6
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(addr);
                self.packed.store(ENDPOINT_V6, Ordering::Release);
            }
        }
    }

    pub fn load(&self) -> Option<SocketAddr> {
        match self.packed.load(Ordering::Acquire) {
            ENDPOINT_EMPTY => None,
            ENDPOINT_V6 => *self.v6.read().unwrap_or_else(PoisonError::into_inner),
            packed => {
                let ip = std::net::Ipv4Addr::from(((packed >> 16) & 0xFFFF_FFFF) as u32);
                let port = (packed & 0xFFFF) as u16;
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
        }
    }
}

/// Read-side guard over a peer's crypto; holding one blocks zeroization.
pub struct CryptoReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// One live client session in the dataplane.
pub struct Peer {
    session: Session,
    cipher: Arc<dyn SessionCipher>,
    rekey: Option<Arc<RekeyFsm>>,
    egress: Arc<dyn Egress>,
    closed: AtomicBool,
    /// Unix seconds of the last successful decryption.
    last_activity: AtomicU64,
    crypto_lock: RwLock<()>,
    roamed: AtomicEndpoint,
}

impl Peer {
    pub fn new(
        session: Session,
        cipher: Arc<dyn SessionCipher>,
        rekey: Option<Arc<RekeyFsm>>,
        egress: Arc<dyn Egress>,
    ) -> Self {
        Self {
            session,
            cipher,
            rekey,
            egress,
            closed: AtomicBool::new(false),
            last_activity: AtomicU64::new(unix_now()),
            crypto_lock: RwLock::new(()),
            roamed: AtomicEndpoint::unset(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cipher(&self) -> &Arc<dyn SessionCipher> {
        &self.cipher
    }

    pub fn rekey(&self) -> Option<&Arc<RekeyFsm>> {
        self.rekey.as_ref()
    }

    pub fn egress(&self) -> &Arc<dyn Egress> {
        &self.egress
    }

    /// Route id of this peer's cipher, when it carries one.
    pub fn route_id(&self) -> Option<u64> {
        self.cipher.route_id()
    }

    /// Acquire the crypto read lock. Returns `None` (without holding the
    /// lock) once the peer is closed.
    pub fn crypto_read(&self) -> Option<CryptoReadGuard<'_>> {
        let guard = self
            .crypto_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(CryptoReadGuard { _guard: guard })
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record activity. Called only after a successful decryption, so
    /// garbage traffic cannot keep a session alive.
    pub fn touch_activity(&self) {
        self.last_activity.store(unix_now(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn set_last_activity(&self, unix_secs: u64) {
        self.last_activity.store(unix_secs, Ordering::Relaxed);
    }

    /// Most recently observed external address, falling back to the one
    /// captured at registration.
    pub fn external_addr_port(&self) -> SocketAddr {
        self.roamed.load().unwrap_or(self.session.external_addr())
    }

    pub fn set_external_addr_port(&self, addr: SocketAddr) {
        self.roamed.store(addr);
    }

    /// Wipe key material behind the crypto write lock. Readers that won a
    /// `crypto_read` earlier finish before this runs.
    pub fn zeroize_crypto(&self) {
        let _exclusive = self
            .crypto_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.cipher.zeroize_keys();
    }
}
