//! Session repository
//!
//! The single source of truth for live sessions. One read-write lock
//! covers every index; lookups are O(1), revocation and reaping are O(n).
//! The deletion order is a security invariant (close before unindex
//! before zeroize); see [`SessionRepository::delete`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::session::peer::{unix_now, Peer};
use crate::session::session::{canonical_addr, canonical_ip};

#[derive(Default)]
struct Indexes {
    by_internal: HashMap<IpAddr, Arc<Peer>>,
    by_external: HashMap<SocketAddr, Arc<Peer>>,
    by_route_id: HashMap<u64, Arc<Peer>>,
    /// Ordered peers per identity, for revocation across multiple
    /// sessions of one client key.
    by_pubkey: HashMap<Vec<u8>, Vec<Arc<Peer>>>,
    /// Single-host AllowedIPs entries, for egress routing.
    by_allowed_addr: HashMap<IpAddr, Arc<Peer>>,
}

fn remove_if_same<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Arc<Peer>>,
    key: &K,
    peer: &Arc<Peer>,
) {
    if map.get(key).is_some_and(|held| Arc::ptr_eq(held, peer)) {
        map.remove(key);
    }
}

/// Concurrent multi-index store over peers.
#[derive(Default)]
pub struct SessionRepository {
    inner: RwLock<Indexes>,
}

impl SessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indexes> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Indexes> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a peer into every applicable index. An index that already
    /// holds an entry under the same key keeps it; the registration path
    /// is responsible for deleting a colliding session first.
    pub fn add(&self, peer: Arc<Peer>) {
        let mut idx = self.write();
        let session = peer.session();

        idx.by_internal
            .entry(session.internal_addr())
            .or_insert_with(|| peer.clone());
        idx.by_external
            .entry(canonical_addr(peer.external_addr_port()))
            .or_insert_with(|| peer.clone());
        if let Some(route_id) = peer.route_id() {
            idx.by_route_id
                .entry(route_id)
                .or_insert_with(|| peer.clone());
        }
        if !session.pub_key().is_empty() {
            idx.by_pubkey
                .entry(session.pub_key().to_vec())
                .or_default()
                .push(peer.clone());
        }
        for addr in session.allowed_addrs() {
            idx.by_allowed_addr
                .entry(addr)
                .or_insert_with(|| peer.clone());
        }

        tracing::debug!(
            internal = %session.internal_addr(),
            external = %peer.external_addr_port(),
            route_id = peer.route_id().unwrap_or(0),
            "session added"
        );
    }

    /// O(1) hot-path lookup by the outer-header route id.
    pub fn get_by_route_id(&self, route_id: u64) -> Option<Arc<Peer>> {
        self.read().by_route_id.get(&route_id).cloned()
    }

    pub fn get_by_internal_addr(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.read().by_internal.get(&canonical_ip(addr)).cloned()
    }

    pub fn get_by_external_addr_port(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.read().by_external.get(&canonical_addr(addr)).cloned()
    }

    /// Route an egress packet to its session. Exact internal-address
    /// match first, then the single-host AllowedIPs index, then a linear
    /// scan over prefix entries (an acknowledged timing trade-off;
    /// deployments stay under ~100 peers).
    pub fn find_by_destination_ip(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        let addr = canonical_ip(addr);
        let idx = self.read();

        if let Some(peer) = idx.by_internal.get(&addr) {
            return Some(peer.clone());
        }
        if let Some(peer) = idx.by_allowed_addr.get(&addr) {
            return Some(peer.clone());
        }
        idx.by_internal
            .values()
            .find(|peer| peer.session().subnet_contains(addr))
            .cloned()
    }

    /// Move a roamed peer to its new external address: reindex, update
    /// the peer's observed address, and retarget its egress.
    pub fn update_external_addr(&self, peer: &Arc<Peer>, new_addr: SocketAddr) {
        let mut idx = self.write();
        if peer.is_closed() {
            return;
        }

        let old = canonical_addr(peer.external_addr_port());
        let new = canonical_addr(new_addr);
        if old == new {
            return;
        }

        remove_if_same(&mut idx.by_external, &old, peer);
        idx.by_external.insert(new, peer.clone());
        peer.set_external_addr_port(new);
        peer.egress().set_addr_port(new);

        tracing::debug!(internal = %peer.session().internal_addr(), from = %old, to = %new, "peer roamed");
    }

    /// Tear down one session. The order is load-bearing:
    /// 1. mark closed (future `crypto_read` fails),
    /// 2. close the egress,
    /// 3. drop from every index (new lookups miss),
    /// 4. zeroize keys behind the peer's crypto write lock.
    pub fn delete(&self, peer: &Arc<Peer>) {
        let mut idx = self.write();
        Self::delete_locked(&mut idx, peer);
    }

    fn delete_locked(idx: &mut Indexes, peer: &Arc<Peer>) {
        peer.mark_closed();
        peer.egress().close();

        let session = peer.session();
        remove_if_same(&mut idx.by_internal, &session.internal_addr(), peer);
        remove_if_same(
            &mut idx.by_external,
            &canonical_addr(peer.external_addr_port()),
            peer,
        );
        if let Some(route_id) = peer.route_id() {
            remove_if_same(&mut idx.by_route_id, &route_id, peer);
        }
        if !session.pub_key().is_empty() {
            if let Some(list) = idx.by_pubkey.get_mut(session.pub_key()) {
                list.retain(|held| !Arc::ptr_eq(held, peer));
                if list.is_empty() {
                    idx.by_pubkey.remove(session.pub_key());
                }
            }
        }
        for addr in session.allowed_addrs() {
            remove_if_same(&mut idx.by_allowed_addr, &addr, peer);
        }

        peer.zeroize_crypto();
        tracing::debug!(internal = %session.internal_addr(), "session deleted");
    }

    /// Revoke every session registered under `pub_key`. Returns the
    /// number of sessions terminated; an empty key matches nothing.
    pub fn terminate_by_pub_key(&self, pub_key: &[u8]) -> usize {
        if pub_key.is_empty() {
            return 0;
        }
        let mut idx = self.write();
        let peers = idx.by_pubkey.get(pub_key).cloned().unwrap_or_default();
        for peer in &peers {
            Self::delete_locked(&mut idx, peer);
        }
        if !peers.is_empty() {
            tracing::info!(
                pub_key = %hex::encode(&pub_key[..pub_key.len().min(8)]),
                count = peers.len(),
                "sessions revoked"
            );
        }
        peers.len()
    }

    /// Delete every peer idle longer than `timeout`. Returns the count.
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let mut idx = self.write();
        let now = unix_now();
        let stale: Vec<Arc<Peer>> = idx
            .by_internal
            .values()
            .filter(|peer| now.saturating_sub(peer.last_activity()) > timeout.as_secs())
            .cloned()
            .collect();
        for peer in &stale {
            Self::delete_locked(&mut idx, peer);
        }
        stale.len()
    }

    /// Fresh snapshot of every live peer, for the trial-decrypt roaming
    /// scan.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.read().by_internal.values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.read().by_internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
