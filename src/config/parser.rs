//! Server configuration parser
//!
//! INI-style config with one `[Interface]` section and any number of
//! `[Peer]` sections:
//!
//! ```text
//! [Interface]
//! PrivateKey = <base64 32-byte key>
//! ListenPort = 5050
//! Subnet = 10.0.0.0/24
//!
//! [Peer]
//! PublicKey = <base64 32-byte key>
//! AllowedIPs = 172.16.0.9/32, 192.0.2.0/24
//! ```

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::ConfigError;

/// Default interface MTU.
pub const DEFAULT_MTU: u16 = 1420;

/// Default idle timeout before a session is reaped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default reaper sweep interval.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Default socket read/write buffer size (4 MiB).
pub const DEFAULT_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// Default cap on concurrent registrations.
pub const DEFAULT_MAX_REGISTRATIONS: usize = 64;

/// Default per-address registration queue depth.
pub const DEFAULT_REGISTRATION_QUEUE: usize = 8;

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub interface: InterfaceConfig,
    /// AllowedPeers ACL; empty means open enrollment.
    pub peers: Vec<PeerAcl>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Our static private key (32 bytes)
    pub private_key: [u8; 32],
    /// UDP listen port
    pub listen_port: u16,
    /// Tunnel subnet; the server takes the first host address.
    pub subnet: Ipv4Net,
    /// Optional IPv6 tunnel prefix
    pub subnet6: Option<Ipv6Net>,
    pub mtu: u16,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub recv_buffer: usize,
    pub send_buffer: usize,
    pub max_registrations: usize,
    pub registration_queue: usize,
}

/// One AllowedPeers entry
#[derive(Debug, Clone)]
pub struct PeerAcl {
    /// Client static public key (32 bytes)
    pub public_key: [u8; 32],
    /// Extra allowed source IPs/prefixes beyond the internal address
    pub allowed_ips: Vec<IpNet>,
}

impl ServerConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceBuilder> = None;
        let mut peers: Vec<PeerAcl> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(InterfaceBuilder::default);
                    iface.set(&key, value, line_num)?;
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;
                    peer.set(&key, value, line_num)?;
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let interface = interface
            .ok_or(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            })?
            .build()?;

        Ok(ServerConfig { interface, peers })
    }

    /// Our public key derived from the private key
    pub fn public_key(&self) -> [u8; 32] {
        crate::crypto::x25519::public_key(&self.interface.private_key)
    }

    /// The server's own tunnel address: first host of the subnet.
    pub fn server_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.interface.subnet.network()) + 1)
    }

    /// The AllowedPeers list as a lookup table for the registrar.
    pub fn acl(&self) -> HashMap<[u8; 32], Vec<IpNet>> {
        self.peers
            .iter()
            .map(|peer| (peer.public_key, peer.allowed_ips.clone()))
            .collect()
    }
}

#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<[u8; 32]>,
    listen_port: Option<u16>,
    subnet: Option<Ipv4Net>,
    subnet6: Option<Ipv6Net>,
    mtu: Option<u16>,
    idle_timeout: Option<u64>,
    reap_interval: Option<u64>,
    recv_buffer: Option<usize>,
    send_buffer: Option<usize>,
    max_registrations: Option<usize>,
    registration_queue: Option<usize>,
}

impl InterfaceBuilder {
    fn set(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "privatekey" => {
                self.private_key = Some(parse_key(value, "PrivateKey")?);
            }
            "listenport" => {
                self.listen_port = Some(parse_number(value, "ListenPort", line)?);
            }
            "subnet" => {
                let subnet: Ipv4Net = value.parse().map_err(|_| ConfigError::InvalidCidr {
                    value: value.to_string(),
                })?;
                if subnet.prefix_len() > 30 {
                    return Err(ConfigError::InvalidCidr {
                        value: format!("{} (no room for clients)", value),
                    });
                }
                self.subnet = Some(subnet.trunc());
            }
            "subnet6" => {
                let subnet: Ipv6Net = value.parse().map_err(|_| ConfigError::InvalidCidr {
                    value: value.to_string(),
                })?;
                self.subnet6 = Some(subnet.trunc());
            }
            "mtu" => {
                self.mtu = Some(parse_number(value, "MTU", line)?);
            }
            "idletimeout" => {
                self.idle_timeout = Some(parse_number(value, "IdleTimeout", line)?);
            }
            "reapinterval" => {
                self.reap_interval = Some(parse_number(value, "ReapInterval", line)?);
            }
            "recvbuffer" => {
                self.recv_buffer = Some(parse_number(value, "RecvBuffer", line)?);
            }
            "sendbuffer" => {
                self.send_buffer = Some(parse_number(value, "SendBuffer", line)?);
            }
            "maxregistrations" => {
                self.max_registrations = Some(parse_number(value, "MaxRegistrations", line)?);
            }
            "registrationqueue" => {
                self.registration_queue = Some(parse_number(value, "RegistrationQueue", line)?);
            }
            _ => {
                // Unknown key, ignore (forward compatibility)
                tracing::debug!("Unknown interface key: {}", key);
            }
        }
        Ok(())
    }

    fn build(self) -> Result<InterfaceConfig, ConfigError> {
        Ok(InterfaceConfig {
            private_key: self.private_key.ok_or(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            })?,
            listen_port: self.listen_port.ok_or(ConfigError::MissingField {
                field: "ListenPort".to_string(),
            })?,
            subnet: self.subnet.ok_or(ConfigError::MissingField {
                field: "Subnet".to_string(),
            })?,
            subnet6: self.subnet6,
            mtu: self.mtu.unwrap_or(DEFAULT_MTU),
            idle_timeout: self
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            reap_interval: self
                .reap_interval
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REAP_INTERVAL),
            recv_buffer: self.recv_buffer.unwrap_or(DEFAULT_SOCKET_BUFFER),
            send_buffer: self.send_buffer.unwrap_or(DEFAULT_SOCKET_BUFFER),
            max_registrations: self.max_registrations.unwrap_or(DEFAULT_MAX_REGISTRATIONS),
            registration_queue: self
                .registration_queue
                .unwrap_or(DEFAULT_REGISTRATION_QUEUE),
        })
    }
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    allowed_ips: Vec<IpNet>,
}

impl PeerBuilder {
    fn set(&mut self, key: &str, value: &str, _line: usize) -> Result<(), ConfigError> {
        match key {
            "publickey" => {
                self.public_key = Some(parse_key(value, "PublicKey")?);
            }
            "allowedips" => {
                for ip_str in value.split(',') {
                    let ip_str = ip_str.trim();
                    if ip_str.is_empty() {
                        continue;
                    }
                    let net: IpNet = ip_str.parse().map_err(|_| ConfigError::InvalidCidr {
                        value: ip_str.to_string(),
                    })?;
                    self.allowed_ips.push(net);
                }
            }
            _ => {
                tracing::debug!("Unknown peer key: {}", key);
            }
        }
        Ok(())
    }

    fn build(self) -> Result<PeerAcl, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerAcl {
            public_key,
            allowed_ips: self.allowed_ips,
        })
    }
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    field: &str,
    line: usize,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field, value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
# tunwarden server
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
ListenPort = 5050
Subnet = 10.0.0.0/24
Subnet6 = fd00::/64
MTU = 1380
IdleTimeout = 120
MaxRegistrations = 16

[Peer]
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
AllowedIPs = 172.16.0.9/32, 192.0.2.0/24
"#;

    #[test]
    fn test_parse_config() {
        let config = ServerConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.interface.listen_port, 5050);
        assert_eq!(config.interface.subnet.to_string(), "10.0.0.0/24");
        assert_eq!(config.interface.subnet6.unwrap().to_string(), "fd00::/64");
        assert_eq!(config.interface.mtu, 1380);
        assert_eq!(config.interface.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.interface.max_registrations, 16);
        // Untouched knobs fall back to defaults.
        assert_eq!(config.interface.reap_interval, DEFAULT_REAP_INTERVAL);
        assert_eq!(config.interface.recv_buffer, DEFAULT_SOCKET_BUFFER);
        assert_eq!(config.interface.registration_queue, DEFAULT_REGISTRATION_QUEUE);

        assert_eq!(config.server_addr(), Ipv4Addr::new(10, 0, 0, 1));

        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].allowed_ips.len(), 2);
        let acl = config.acl();
        assert_eq!(acl.len(), 1);
        assert!(acl.contains_key(&config.peers[0].public_key));
    }

    #[test]
    fn test_missing_required_fields() {
        assert!(ServerConfig::parse("").is_err());

        let no_port = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nSubnet = 10.0.0.0/24\n";
        assert!(matches!(
            ServerConfig::parse(no_port),
            Err(ConfigError::MissingField { field }) if field == "ListenPort"
        ));

        let no_subnet = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nListenPort = 5050\n";
        assert!(matches!(
            ServerConfig::parse(no_subnet),
            Err(ConfigError::MissingField { field }) if field == "Subnet"
        ));
    }

    #[test]
    fn test_malformed_line_reports_number() {
        let config = "[Interface]\nPrivateKey\n";
        assert!(matches!(
            ServerConfig::parse(config),
            Err(ConfigError::ParseError { line: 2, .. })
        ));
    }

    #[test]
    fn test_subnet_too_small() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nListenPort = 5050\nSubnet = 10.0.0.0/31\n";
        assert!(matches!(
            ServerConfig::parse(config),
            Err(ConfigError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_invalid_key() {
        assert!(parse_key("not-base64!", "TestKey").is_err());
        assert!(parse_key("dG9vIHNob3J0", "TestKey").is_err()); // decodes short
    }

    #[test]
    fn test_peer_requires_public_key() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nListenPort = 5050\nSubnet = 10.0.0.0/24\n\n[Peer]\nAllowedIPs = 10.0.0.0/24\n";
        assert!(matches!(
            ServerConfig::parse(config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_subnet_is_truncated_to_network() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nListenPort = 5050\nSubnet = 10.0.0.5/24\n";
        let parsed = ServerConfig::parse(config).unwrap();
        assert_eq!(parsed.interface.subnet.to_string(), "10.0.0.0/24");
        assert_eq!(parsed.server_addr(), Ipv4Addr::new(10, 0, 0, 1));
    }
}
