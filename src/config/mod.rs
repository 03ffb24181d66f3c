//! Configuration loading

mod parser;

pub use parser::{InterfaceConfig, PeerAcl, ServerConfig};
