//! tunwarden - multi-session UDP VPN tunnel server
//!
//! One UDP listener multiplexes many encrypted client sessions; decrypted
//! inner IP packets are forwarded to a TUN device and back.
//!
//! # Layout
//!
//! - [`crypto`]: the session cipher and handshake primitives
//! - [`protocol`]: wire formats, service packets, the registration handshake
//! - [`session`]: sessions, peers, egress, rekeying, and the repository
//! - [`server`]: the dataplane loops and orchestration
//! - [`tunnel`]: the TUN device seam
//!
//! # Usage
//!
//! ```no_run
//! use tunwarden::{ServerConfig, TunnelServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::from_file("tunwarden.conf")?;
//!     let mut server = TunnelServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ServerConfig;
pub use error::TunWardenError;
pub use server::TunnelServer;
pub use session::SessionRepository;
