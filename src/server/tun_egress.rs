//! TUN egress
//!
//! Reads inner IP packets from the TUN device into a frame with the
//! outer prefix and tag slots already reserved, routes them by
//! destination address, and hands them to the owning peer's serialized
//! egress. A failing egress tears the session down: plaintext reset to
//! the client, then deletion.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Result, TunnelError};
use crate::protocol::service::ServicePacket;
use crate::protocol::{ip, wire};
use crate::session::egress::DatagramSink;
use crate::session::repository::SessionRepository;
use crate::tunnel::TunIo;

/// The TUN-to-UDP forwarding loop.
pub struct TunEgress {
    tun: Arc<dyn TunIo>,
    repo: Arc<SessionRepository>,
    /// Raw socket access for the plaintext reset frame.
    sink: Arc<dyn DatagramSink>,
    shutdown: watch::Receiver<bool>,
    mtu: usize,
}

impl TunEgress {
    pub fn new(
        tun: Arc<dyn TunIo>,
        repo: Arc<SessionRepository>,
        sink: Arc<dyn DatagramSink>,
        shutdown: watch::Receiver<bool>,
        mtu: usize,
    ) -> Self {
        Self {
            tun,
            repo,
            sink,
            shutdown,
            mtu,
        }
    }

    pub async fn run(self) -> Result<()> {
        // One frame, laid out [prefix | payload | tag]; the TUN read lands
        // in the payload slot so encryption never copies.
        let mut buf = vec![0u8; self.mtu + wire::UDP_OVERHEAD];
        let mut shutdown = self.shutdown.clone();
        tracing::info!("TUN egress loop started");

        loop {
            let payload_slot =
                wire::UDP_PREFIX_LEN..wire::UDP_PREFIX_LEN + self.mtu;
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("TUN egress loop stopping");
                    return Ok(());
                }
                result = self.tun.recv_packet(&mut buf[payload_slot]) => {
                    match result {
                        Ok(len) => {
                            if let Err(e) = self.forward(&mut buf, len).await {
                                tracing::debug!("egress error: {}", e);
                            }
                        }
                        Err(e) => {
                            tracing::error!("TUN read error: {}", e);
                            return Err(TunnelError::ReadFailed {
                                reason: e.to_string(),
                            }
                            .into());
                        }
                    }
                }
            }
        }
    }

    /// Route and send one packet sitting in the frame's payload slot.
    async fn forward(&self, buf: &mut [u8], len: usize) -> Result<()> {
        let packet = &buf[wire::UDP_PREFIX_LEN..wire::UDP_PREFIX_LEN + len];

        let dst = match ip::destination_addr(packet) {
            Some(dst) => dst,
            None => {
                tracing::debug!(len, "malformed inner packet from TUN");
                return Ok(());
            }
        };
        let peer = match self.repo.find_by_destination_ip(dst) {
            Some(peer) => peer,
            None => {
                tracing::trace!(%dst, "no session for destination");
                return Ok(());
            }
        };

        let frame = &mut buf[..wire::UDP_PREFIX_LEN + len + wire::TAG_LEN];
        if let Err(e) = peer.egress().send_data_ip(frame).await {
            // A dead egress means a dead session: reset and delete.
            tracing::warn!(
                internal = %peer.session().internal_addr(),
                "egress write failed ({}), resetting session",
                e
            );
            let reset = ServicePacket::SessionReset.encode();
            if let Err(e) = self.sink.send_to(&reset, peer.external_addr_port()).await {
                tracing::trace!("session reset not sent: {}", e);
            }
            self.repo.delete(&peer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionCipher;
    use crate::testing::{
        client_cipher, ipv4_packet, test_peer_with_sink, MemorySink, MemoryTun,
    };
    use std::net::SocketAddr;

    fn egress_loop() -> (TunEgress, Arc<SessionRepository>, Arc<MemorySink>) {
        let repo = Arc::new(SessionRepository::new());
        let sink = Arc::new(MemorySink::default());
        let (_, shutdown) = watch::channel(false);
        (
            TunEgress::new(
                Arc::new(MemoryTun::default()),
                repo.clone(),
                sink.clone(),
                shutdown,
                1420,
            ),
            repo,
            sink,
        )
    }

    fn frame_with(packet: &[u8], mtu: usize) -> Vec<u8> {
        let mut buf = vec![0u8; mtu + wire::UDP_OVERHEAD];
        buf[wire::UDP_PREFIX_LEN..wire::UDP_PREFIX_LEN + packet.len()].copy_from_slice(packet);
        buf
    }

    #[tokio::test]
    async fn test_forward_encrypts_to_owning_peer() {
        let (egress, repo, _) = egress_loop();
        let (peer, peer_sink) =
            test_peer_with_sink("10.0.0.2", "192.168.1.51:5050", 21, b"k".to_vec(), &[]);
        repo.add(peer.clone());

        let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        let mut buf = frame_with(&packet, 1420);
        egress.forward(&mut buf, packet.len()).await.unwrap();

        let sent = peer_sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "192.168.1.51:5050".parse::<SocketAddr>().unwrap());

        // The datagram opens on the client side to the original packet.
        let cipher = client_cipher(21);
        let mut datagram = sent[0].0.clone();
        let n = cipher.open_in_place(&mut datagram).unwrap();
        assert_eq!(
            &datagram[wire::UDP_PREFIX_LEN..wire::UDP_PREFIX_LEN + n],
            &packet[..]
        );
    }

    #[tokio::test]
    async fn test_unroutable_destination_is_dropped() {
        let (egress, _, sink) = egress_loop();

        let packet = ipv4_packet([10, 0, 0, 1], [198, 51, 100, 1]);
        let mut buf = frame_with(&packet, 1420);
        egress.forward(&mut buf, packet.len()).await.unwrap();
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped() {
        let (egress, repo, sink) = egress_loop();
        let (peer, peer_sink) =
            test_peer_with_sink("10.0.0.2", "192.168.1.51:5050", 22, b"k".to_vec(), &[]);
        repo.add(peer);

        let mut buf = frame_with(&[0x45, 0x00], 1420);
        egress.forward(&mut buf, 2).await.unwrap();
        assert!(sink.sent().is_empty());
        assert!(peer_sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_egress_failure_resets_and_deletes_session() {
        let (egress, repo, sink) = egress_loop();
        let (peer, peer_sink) =
            test_peer_with_sink("10.0.0.2", "192.168.1.51:5050", 23, b"k".to_vec(), &[]);
        repo.add(peer.clone());
        peer.egress().close();

        let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        let mut buf = frame_with(&packet, 1420);
        egress.forward(&mut buf, packet.len()).await.unwrap();

        assert!(peer_sink.sent().is_empty());
        // Plaintext legacy reset went straight to the socket.
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ServicePacket::SessionReset.encode());
        assert_eq!(sent[0].1, "192.168.1.51:5050".parse::<SocketAddr>().unwrap());

        assert!(peer.is_closed());
        assert!(repo.is_empty());
    }
}
