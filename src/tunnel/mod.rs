//! TUN device abstraction
//!
//! Wraps the tun-rs async device behind the [`TunIo`] trait so the
//! dataplane loops can run against an in-memory double in tests.

use std::net::Ipv4Addr;
use std::ops::Deref;

use async_trait::async_trait;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::error::{TunWardenError, TunnelError};

/// Raw IP packet I/O against the tunnel interface.
#[async_trait]
pub trait TunIo: Send + Sync {
    /// Read one inner IP packet into `buf`, returning its length.
    async fn recv_packet(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write one inner IP packet.
    async fn send_packet(&self, packet: &[u8]) -> std::io::Result<usize>;
}

/// Async TUN device wrapper
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Create a TUN device addressed as the server side of the tunnel
    /// subnet.
    pub async fn create(
        address: Ipv4Addr,
        prefix_len: u8,
        mtu: u16,
    ) -> Result<Self, TunWardenError> {
        warn_if_unprivileged();

        let device = DeviceBuilder::new()
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device.deref().name().map_err(|e| TunnelError::CreateFailed {
            reason: format!("Failed to get device name: {}", e),
        })?;

        tracing::info!(
            "Created TUN device: {} with address {}/{}",
            name,
            address,
            prefix_len
        );

        Ok(Self { device, name })
    }

    /// Interface name (e.g. "tun0", "utun5").
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl TunIo for TunDevice {
    async fn recv_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn send_packet(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.device.send(packet).await
    }
}

fn warn_if_unprivileged() {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            tracing::warn!("Running without root; TUN creation may fail.");
            tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
            tracing::warn!("  sudo setcap cap_net_admin=eip ./tunwarden");
        }
    }
}
