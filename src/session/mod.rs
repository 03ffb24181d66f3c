//! Session lifecycle core
//!
//! Leaves first: [`session::Session`] is the immutable identity record,
//! [`peer::Peer`] adds the runtime state, [`egress::UdpEgress`] the
//! serialized outbound path, [`rekey::RekeyFsm`] the key-rotation state
//! machine, and [`repository::SessionRepository`] indexes it all.

pub mod egress;
pub mod peer;
pub mod rekey;
pub mod repository;
pub mod session;

pub use egress::{DatagramSink, Egress, UdpEgress};
pub use peer::Peer;
pub use rekey::{RekeyFsm, RekeyRole};
pub use repository::SessionRepository;
pub use session::Session;
