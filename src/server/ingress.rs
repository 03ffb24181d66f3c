//! UDP ingress
//!
//! [`UdpIngress`] is the single-reader socket loop; [`Dataplane`] is the
//! per-datagram stage it feeds. Dispatch order per datagram:
//!
//! 1. fast path: route-id index hit, decrypt under the peer's crypto
//!    read lock;
//! 2. roaming fallback: trial-decrypt against every live peer (the AEAD
//!    open is destructive, so each attempt works on a copy);
//! 3. registration: hand the packet to the registrar.
//!
//! Nothing on this path may fail louder than a per-packet drop: bad tags,
//! disallowed sources, and malformed headers all return silently.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::error::{Result, TunnelError};
use crate::protocol::{ip, wire};
use crate::server::control::{ControlHandler, ControlOutcome};
use crate::server::registration::Registrar;
use crate::session::peer::Peer;
use crate::session::repository::SessionRepository;
use crate::session::session::canonical_addr;
use crate::tunnel::TunIo;

/// Per-datagram processing stage, shared by the fast path and the
/// roaming fallback.
pub struct Dataplane {
    repo: Arc<SessionRepository>,
    registrar: Arc<Registrar>,
    control: ControlHandler,
    tun: Arc<dyn TunIo>,
}

impl Dataplane {
    pub fn new(
        repo: Arc<SessionRepository>,
        registrar: Arc<Registrar>,
        tun: Arc<dyn TunIo>,
    ) -> Self {
        Self {
            repo,
            registrar,
            control: ControlHandler::new(),
            tun,
        }
    }

    /// Dispatch one datagram. `datagram` is the receive buffer slice and
    /// is clobbered by in-place decryption.
    pub async fn handle_datagram(
        &self,
        datagram: &mut [u8],
        addr: SocketAddr,
    ) -> Result<()> {
        if datagram.len() < wire::UDP_PREFIX_LEN {
            tracing::trace!(%addr, len = datagram.len(), "short packet dropped");
            return Ok(());
        }

        // Fast path: O(1) by route id.
        if let Some(route_id) = wire::route_id(datagram) {
            if let Some(peer) = self.repo.get_by_route_id(route_id) {
                if !peer.is_closed() {
                    return self.handle_established(&peer, addr, datagram).await;
                }
            }
        }

        // Roaming fallback: trial-decrypt against every live peer.
        if self.try_roaming(addr, datagram).await? {
            return Ok(());
        }

        // Unknown client: registration.
        self.registrar.enqueue_packet(addr, datagram.to_vec());
        Ok(())
    }

    /// Fast-path stage for a peer found by route id.
    async fn handle_established(
        &self,
        peer: &Arc<Peer>,
        addr: SocketAddr,
        datagram: &mut [u8],
    ) -> Result<()> {
        let crypto_guard = match peer.crypto_read() {
            Some(guard) => guard,
            None => return Ok(()),
        };
        let plain_len = match peer.cipher().open_in_place(datagram) {
            Ok(len) => len,
            // Bad tag or malformed ciphertext: silent, never retried.
            Err(_) => return Ok(()),
        };
        drop(crypto_guard);

        if canonical_addr(addr) != peer.external_addr_port() {
            self.repo.update_external_addr(peer, addr);
        }

        let epoch = wire::epoch(datagram).unwrap_or(0);
        let plain = &datagram[wire::UDP_PREFIX_LEN..wire::UDP_PREFIX_LEN + plain_len];
        self.handle_decrypted(peer, epoch, plain).await
    }

    /// Trial-decrypt an unknown-route datagram against every live peer.
    /// Returns true when some peer owned it.
    async fn try_roaming(&self, addr: SocketAddr, datagram: &[u8]) -> Result<bool> {
        for peer in self.repo.all_peers() {
            if peer.is_closed() {
                continue;
            }
            let crypto_guard = match peer.crypto_read() {
                Some(guard) => guard,
                None => continue,
            };
            // The AEAD open clobbers its input; each attempt gets a copy.
            let mut copy = datagram.to_vec();
            let plain_len = match peer.cipher().open_in_place(&mut copy) {
                Ok(len) => len,
                Err(_) => continue,
            };
            drop(crypto_guard);

            self.repo.update_external_addr(&peer, addr);

            let epoch = wire::epoch(&copy).unwrap_or(0);
            let plain = &copy[wire::UDP_PREFIX_LEN..wire::UDP_PREFIX_LEN + plain_len];
            self.handle_decrypted(&peer, epoch, plain).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Shared post-decrypt stage: activity, epoch tracking, control
    /// dispatch, AllowedIPs, TUN delivery.
    async fn handle_decrypted(
        &self,
        peer: &Arc<Peer>,
        epoch: u16,
        plain: &[u8],
    ) -> Result<()> {
        peer.touch_activity();

        if let Some(fsm) = peer.rekey() {
            fsm.activate_send_epoch(epoch);
            fsm.abort_pending_if_expired(Instant::now());
        }

        match self.control.handle(plain, peer).await {
            Ok(ControlOutcome::Handled) => return Ok(()),
            Ok(ControlOutcome::NotControl) => {}
            Err(e) => return Err(e.into()),
        }

        let src = match ip::source_addr(plain) {
            Some(src) => src,
            None => return Ok(()),
        };
        if !peer.session().is_source_allowed(src) {
            return Ok(());
        }

        self.tun
            .send_packet(plain)
            .await
            .map_err(|e| TunnelError::WriteFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// The socket read loop. Single reader; per-peer packets are processed in
/// arrival order.
pub struct UdpIngress {
    socket: Arc<UdpSocket>,
    dataplane: Arc<Dataplane>,
    shutdown: watch::Receiver<bool>,
    mtu: usize,
}

impl UdpIngress {
    pub fn new(
        socket: Arc<UdpSocket>,
        dataplane: Arc<Dataplane>,
        shutdown: watch::Receiver<bool>,
        mtu: usize,
    ) -> Self {
        Self {
            socket,
            dataplane,
            shutdown,
            mtu,
        }
    }

    pub async fn run(self) -> Result<()> {
        // One reusable receive buffer sized MTU + framing overhead.
        let mut buf = vec![0u8; self.mtu + wire::UDP_OVERHEAD];
        let mut shutdown = self.shutdown.clone();
        tracing::info!("UDP ingress loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("UDP ingress loop stopping");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            if let Err(e) = self
                                .dataplane
                                .handle_datagram(&mut buf[..len], addr)
                                .await
                            {
                                tracing::debug!(%addr, "ingress error: {}", e);
                            }
                        }
                        Err(e) => {
                            tracing::error!("UDP recv error: {}", e);
                        }
                    }
                }
            }
        }
    }
}
