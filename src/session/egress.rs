//! Per-peer serialized egress
//!
//! All outbound traffic for one session funnels through a single
//! [`UdpEgress`]: a mutex serializes "encrypt, then write", which keeps
//! the cipher's nonce counter race-free and keeps datagrams from
//! interleaving on the shared socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::crypto::SessionCipher;
use crate::error::NetworkError;
use crate::protocol::wire::{TAG_LEN, UDP_PREFIX_LEN};
use crate::session::peer::AtomicEndpoint;

/// Where encrypted datagrams land. Production uses the tokio UDP socket;
/// tests substitute an in-memory recorder.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> std::io::Result<usize>;
}

#[async_trait]
impl DatagramSink for tokio::net::UdpSocket {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, datagram, target).await
    }
}

/// The per-peer encrypt-then-write pipeline.
#[async_trait]
pub trait Egress: Send + Sync {
    /// Encrypt and send one tunneled IP packet. `frame` is laid out as
    /// `[prefix slot | payload | tag slot]`; the egress seals it in place.
    async fn send_data_ip(&self, frame: &mut [u8]) -> Result<(), NetworkError>;

    /// Encrypt and send one service packet.
    async fn send_control(&self, payload: &[u8]) -> Result<(), NetworkError>;

    /// Optional capability: retarget subsequent writes (NAT roaming).
    /// Returns false when unsupported.
    fn set_addr_port(&self, target: SocketAddr) -> bool {
        let _ = target;
        false
    }

    /// Idempotent; refuse all writes from now on.
    fn close(&self);
}

/// UDP egress writing through the shared server socket.
pub struct UdpEgress {
    sink: Arc<dyn DatagramSink>,
    cipher: Arc<dyn SessionCipher>,
    target: AtomicEndpoint,
    write_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl UdpEgress {
    pub fn new(
        sink: Arc<dyn DatagramSink>,
        cipher: Arc<dyn SessionCipher>,
        target: SocketAddr,
    ) -> Self {
        Self {
            sink,
            cipher,
            target: AtomicEndpoint::new(target),
            write_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    async fn seal_and_send(&self, frame: &mut [u8]) -> Result<(), NetworkError> {
        let _serialized = self.write_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::EgressClosed);
        }

        let len = self
            .cipher
            .seal_in_place(frame)
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        let target = self
            .target
            .load()
            .ok_or_else(|| NetworkError::SendFailed {
                reason: "no destination address".to_string(),
            })?;

        self.sink
            .send_to(&frame[..len], target)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl Egress for UdpEgress {
    async fn send_data_ip(&self, frame: &mut [u8]) -> Result<(), NetworkError> {
        self.seal_and_send(frame).await
    }

    async fn send_control(&self, payload: &[u8]) -> Result<(), NetworkError> {
        let mut frame = vec![0u8; UDP_PREFIX_LEN + payload.len() + TAG_LEN];
        frame[UDP_PREFIX_LEN..UDP_PREFIX_LEN + payload.len()].copy_from_slice(payload);
        self.seal_and_send(&mut frame).await
    }

    fn set_addr_port(&self, target: SocketAddr) -> bool {
        self.target.store(target);
        true
    }

    fn close(&self) {
        // The socket itself is shared with every other session; closing an
        // egress only fences off further writes through it.
        self.closed.store(true, Ordering::Release);
    }
}
