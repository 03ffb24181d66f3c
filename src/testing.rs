//! In-memory doubles shared by the module tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::IpNet;

use crate::crypto::TunnelCipher;
use crate::protocol::wire::{TAG_LEN, UDP_PREFIX_LEN};
use crate::session::egress::{DatagramSink, UdpEgress};
use crate::session::peer::Peer;
use crate::session::rekey::{RekeyFsm, RekeyRole};
use crate::session::session::Session;

/// Client-to-server test key.
pub const C2S_KEY: [u8; 32] = [0x11; 32];

/// Server-to-client test key.
pub const S2C_KEY: [u8; 32] = [0x22; 32];

/// Records every datagram instead of touching a socket.
#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl MemorySink {
    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatagramSink for MemorySink {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        self.sent.lock().unwrap().push((datagram.to_vec(), target));
        Ok(datagram.len())
    }
}

/// Records written inner packets instead of touching a TUN device.
#[derive(Default)]
pub struct MemoryTun {
    written: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTun {
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::tunnel::TunIo for MemoryTun {
    async fn recv_packet(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
        // The egress-loop tests feed packets directly; nothing reads here.
        std::future::pending().await
    }

    async fn send_packet(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.written.lock().unwrap().push(packet.to_vec());
        Ok(packet.len())
    }
}

/// Server-side peer wired to a [`MemorySink`], keyed with
/// [`C2S_KEY`]/[`S2C_KEY`] at epoch 0.
pub fn test_peer_with_sink(
    internal: &str,
    external: &str,
    route_id: u64,
    pub_key: Vec<u8>,
    allowed: &[IpNet],
) -> (Arc<Peer>, Arc<MemorySink>) {
    let external: SocketAddr = external.parse().unwrap();
    let session = Session::new(internal.parse().unwrap(), external, pub_key, allowed);
    let cipher = Arc::new(TunnelCipher::new(route_id, S2C_KEY, C2S_KEY));
    let rekey = Arc::new(RekeyFsm::new(cipher.clone(), RekeyRole::Server));
    let sink = Arc::new(MemorySink::default());
    let egress = Arc::new(UdpEgress::new(sink.clone(), cipher.clone(), external));
    let peer = Arc::new(Peer::new(session, cipher, Some(rekey), egress));
    (peer, sink)
}

pub fn test_peer_with_pubkey(
    internal: &str,
    external: &str,
    route_id: u64,
    pub_key: Vec<u8>,
    allowed: &[IpNet],
) -> Arc<Peer> {
    test_peer_with_sink(internal, external, route_id, pub_key, allowed).0
}

pub fn test_peer(internal: &str, external: &str, route_id: u64) -> Arc<Peer> {
    test_peer_with_pubkey(internal, external, route_id, b"test-key".to_vec(), &[])
}

/// Delegating cipher that hides its route id, forcing lookups through the
/// trial-decrypt roaming path.
pub struct RoutelessCipher(pub TunnelCipher);

impl crate::crypto::SessionCipher for RoutelessCipher {
    fn seal_in_place(&self, frame: &mut [u8]) -> Result<usize, crate::error::CryptoError> {
        self.0.seal_in_place(frame)
    }

    fn open_in_place(&self, datagram: &mut [u8]) -> Result<usize, crate::error::CryptoError> {
        self.0.open_in_place(datagram)
    }

    fn zeroize_keys(&self) {
        self.0.zeroize_keys();
    }
}

/// Peer whose cipher lacks the route-id capability.
pub fn test_peer_routeless(
    internal: &str,
    external: &str,
    route_id: u64,
) -> (Arc<Peer>, Arc<MemorySink>) {
    let external: SocketAddr = external.parse().unwrap();
    let session = Session::new(
        internal.parse().unwrap(),
        external,
        b"routeless".to_vec(),
        &[],
    );
    let cipher = Arc::new(RoutelessCipher(TunnelCipher::new(route_id, S2C_KEY, C2S_KEY)));
    let sink = Arc::new(MemorySink::default());
    let egress = Arc::new(UdpEgress::new(sink.clone(), cipher.clone(), external));
    let peer = Arc::new(Peer::new(session, cipher, None, egress));
    (peer, sink)
}

/// A client-side cipher able to talk to [`test_peer`] peers.
pub fn client_cipher(route_id: u64) -> TunnelCipher {
    TunnelCipher::new(route_id, C2S_KEY, S2C_KEY)
}

/// Seal `payload` the way a client would, returning the full datagram.
pub fn client_datagram(cipher: &TunnelCipher, payload: &[u8]) -> Vec<u8> {
    use crate::crypto::SessionCipher;

    let mut frame = vec![0u8; UDP_PREFIX_LEN + payload.len() + TAG_LEN];
    frame[UDP_PREFIX_LEN..UDP_PREFIX_LEN + payload.len()].copy_from_slice(payload);
    cipher.seal_in_place(&mut frame).unwrap();
    frame
}

/// Minimal IPv4 packet with the given source and destination.
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet
}
