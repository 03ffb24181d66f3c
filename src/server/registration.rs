//! Registration pipeline
//!
//! Unknown remote addresses land here. Per address the registrar keeps a
//! bounded packet queue feeding a handshake task; on success the task
//! installs a fully wired peer into the repository. A global cap bounds
//! the number of concurrent registrations; at the cap, new addresses are
//! dropped on the floor.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::crypto::TunnelCipher;
use crate::error::HandshakeError;
use crate::protocol::handshake::{HandshakeOutcome, PacketDuplex, ResponderFactory};
use crate::protocol::service::ServicePacket;
use crate::session::egress::{DatagramSink, UdpEgress};
use crate::session::peer::Peer;
use crate::session::rekey::{RekeyFsm, RekeyRole};
use crate::session::repository::SessionRepository;
use crate::session::session::Session;

/// Registrar resource bounds.
#[derive(Debug, Clone)]
pub struct RegistrationLimits {
    /// Concurrent in-flight registrations; new addresses beyond this are
    /// dropped silently.
    pub max_concurrent: usize,
    /// Per-address packet queue depth; overflow drops silently.
    pub queue_capacity: usize,
    /// Wall-clock budget for one handshake attempt (cookie retry
    /// included).
    pub handshake_timeout: Duration,
}

impl Default for RegistrationLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            queue_capacity: 8,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Adapts a registration queue (read side) and the UDP socket (write
/// side) into the duplex channel the handshake protocol expects.
struct QueueTransport {
    rx: mpsc::Receiver<Vec<u8>>,
    sink: Arc<dyn DatagramSink>,
    addr: SocketAddr,
}

#[async_trait]
impl PacketDuplex for QueueTransport {
    async fn recv_packet(&mut self) -> std::io::Result<Vec<u8>> {
        self.rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "registration queue closed")
        })
    }

    async fn send_packet(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.sink.send_to(packet, self.addr).await.map(|_| ())
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Turns an unknown client's first packets into an established peer.
pub struct Registrar {
    sink: Arc<dyn DatagramSink>,
    repo: Arc<SessionRepository>,
    factory: Arc<dyn ResponderFactory>,
    /// AllowedPeers ACL: client static key to extra AllowedIPs. Empty
    /// means open enrollment.
    acl: HashMap<[u8; 32], Vec<IpNet>>,
    /// Internal allocation pool.
    subnet: Ipv4Net,
    /// The server's own tunnel address, never handed to a client.
    server_addr: Ipv4Addr,
    limits: RegistrationLimits,
    queues: Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
}

impl Registrar {
    pub fn new(
        sink: Arc<dyn DatagramSink>,
        repo: Arc<SessionRepository>,
        factory: Arc<dyn ResponderFactory>,
        acl: HashMap<[u8; 32], Vec<IpNet>>,
        subnet: Ipv4Net,
        server_addr: Ipv4Addr,
        limits: RegistrationLimits,
    ) -> Self {
        Self {
            sink,
            repo,
            factory,
            acl,
            subnet,
            server_addr,
            limits,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of in-flight registrations.
    pub fn inflight(&self) -> usize {
        self.queues().len()
    }

    /// Feed one packet from an unknown address. First packet for an
    /// address spawns its handshake task; queue overflow and the global
    /// cap both drop silently.
    pub fn enqueue_packet(self: &Arc<Self>, addr: SocketAddr, packet: Vec<u8>) {
        let mut queues = self.queues();

        if let Some(tx) = queues.get(&addr) {
            if tx.try_send(packet).is_err() {
                tracing::trace!(%addr, "registration queue full, packet dropped");
            }
            return;
        }

        if queues.len() >= self.limits.max_concurrent {
            tracing::trace!(%addr, "registration cap reached, packet dropped");
            return;
        }

        let (tx, rx) = mpsc::channel(self.limits.queue_capacity.max(1));
        let _ = tx.try_send(packet);
        queues.insert(addr, tx);
        drop(queues);

        let registrar = self.clone();
        tokio::spawn(async move {
            registrar.drive(addr, rx).await;
            registrar.queues().remove(&addr);
        });
    }

    /// Drop every queue; pending handshake reads observe end-of-stream
    /// and their tasks unwind. Used on shutdown.
    pub fn close_all(&self) {
        self.queues().clear();
    }

    async fn drive(&self, addr: SocketAddr, rx: mpsc::Receiver<Vec<u8>>) {
        let mut io = QueueTransport {
            rx,
            sink: self.sink.clone(),
            addr,
        };

        let attempt = timeout(self.limits.handshake_timeout, self.run_handshake(&mut io)).await;
        match attempt {
            Err(_) => {
                tracing::debug!(%addr, "registration timed out");
                self.send_reset(addr).await;
            }
            Ok(Err(e)) => {
                tracing::debug!(%addr, "registration failed: {}", e);
                self.send_reset(addr).await;
            }
            Ok(Ok(outcome)) => match self.install(outcome, addr) {
                Ok(internal) => {
                    tracing::info!(%addr, internal = %internal, "session registered");
                }
                Err(e) => {
                    tracing::debug!(%addr, "registration rejected: {}", e);
                    self.send_reset(addr).await;
                }
            },
        }
    }

    async fn run_handshake(
        &self,
        io: &mut QueueTransport,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let mut responder = self.factory.responder();
        match responder.drive(io).await {
            // One cookie round trip is tolerated, with a fresh responder.
            Err(HandshakeError::CookieRequired) => {
                let mut retry = self.factory.responder();
                retry.drive(io).await
            }
            other => other,
        }
    }

    /// Build and index the peer for a completed handshake.
    fn install(
        &self,
        outcome: HandshakeOutcome,
        addr: SocketAddr,
    ) -> Result<IpAddr, HandshakeError> {
        let allowed: &[IpNet] = if self.acl.is_empty() {
            &[]
        } else {
            self.acl
                .get(&outcome.pub_key)
                .map(|nets| nets.as_slice())
                .ok_or(HandshakeError::UnknownClient)?
        };

        let internal = self.allocate(outcome.client_id)?;

        // Replacement semantics: a re-registration for the same internal
        // address supersedes the old session.
        if let Some(existing) = self.repo.get_by_internal_addr(internal) {
            tracing::info!(internal = %internal, "replacing existing session");
            self.repo.delete(&existing);
        }

        let session = Session::new(internal, addr, outcome.pub_key.to_vec(), allowed);
        let cipher = Arc::new(TunnelCipher::new(
            outcome.route_id,
            outcome.s2c_key,
            outcome.c2s_key,
        ));
        let rekey = Arc::new(RekeyFsm::new(cipher.clone(), RekeyRole::Server));
        let egress = Arc::new(UdpEgress::new(self.sink.clone(), cipher.clone(), addr));
        let peer = Arc::new(Peer::new(session, cipher, Some(rekey), egress));
        self.repo.add(peer);

        Ok(internal)
    }

    /// Map a client id into the tunnel subnet. Ids landing on the
    /// network, broadcast, or server address are refused.
    fn allocate(&self, client_id: u32) -> Result<IpAddr, HandshakeError> {
        let span = 1u64 << (32 - self.subnet.prefix_len());
        let id = u64::from(client_id);
        if id == 0 || id >= span - 1 {
            return Err(HandshakeError::AddressPoolExhausted { client_id });
        }

        let addr = Ipv4Addr::from(u32::from(self.subnet.network()) + client_id);
        if addr == self.server_addr {
            return Err(HandshakeError::AddressPoolExhausted { client_id });
        }
        Ok(IpAddr::V4(addr))
    }

    /// Plaintext legacy reset: the remote has no session keys, so this is
    /// the one frame that travels unencrypted.
    async fn send_reset(&self, addr: SocketAddr) {
        let reset = ServicePacket::SessionReset.encode();
        if let Err(e) = self.sink.send_to(&reset, addr).await {
            tracing::trace!(%addr, "session reset not sent: {}", e);
        }
    }
}
