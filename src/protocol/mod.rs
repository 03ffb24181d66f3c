//! Wire formats and protocol drivers
//!
//! - [`wire`]: the outer UDP data-packet layout (route id, epoch, nonce).
//! - [`service`]: the in-band control-plane packet codec.
//! - [`ip`]: inner IPv4/IPv6 address extraction.
//! - [`handshake`]: the registration exchange and its transport seams.

pub mod handshake;
pub mod ip;
pub mod service;
pub mod wire;

pub use handshake::{HandshakeOutcome, HandshakeResponder, PacketDuplex, ResponderFactory};
pub use service::ServicePacket;
