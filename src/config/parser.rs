//! Configuration file parser
//!
//! Parses `.conf` files with `[Interface]` and `[Peer]` sections.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::crypto::x25519;
use crate::device::Device;
use crate::error::{ConfigError, NoisetunError};

/// Complete tunnel configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Our private key (32 bytes)
    pub private_key: [u8; 32],
    /// Our tunnel addresses with prefix
    pub address: Vec<IpNet>,
    /// DNS servers (optional)
    pub dns: Vec<IpAddr>,
    /// Listen port (optional)
    pub listen_port: Option<u16>,
    /// MTU (optional, default 1420)
    pub mtu: Option<u16>,
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's public key (32 bytes)
    pub public_key: [u8; 32],
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (IP:port)
    pub endpoint: Option<SocketAddr>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
}

impl TunnelConfig {
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
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
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
                current_peer = Some(PeerBuilder::new());
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
                    let iface = interface.get_or_insert_with(|| InterfaceConfig {
                        private_key: [0u8; 32],
                        address: Vec::new(),
                        dns: Vec::new(),
                        listen_port: None,
                        mtu: None,
                    });

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = parse_key(value, "PrivateKey")?;
                        }
                        "address" => {
                            for addr_str in value.split(',') {
                                let addr_str = addr_str.trim();
                                if addr_str.is_empty() {
                                    continue;
                                }
                                let net: IpNet =
                                    addr_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: addr_str.to_string(),
                                    })?;
                                iface.address.push(net);
                            }
                        }
                        "dns" => {
                            for dns_str in value.split(',') {
                                let dns_str = dns_str.trim();
                                let dns: IpAddr =
                                    dns_str.parse().map_err(|_| ConfigError::InvalidAddress {
                                        value: dns_str.to_string(),
                                    })?;
                                iface.dns.push(dns);
                            }
                        }
                        "listenport" => {
                            iface.listen_port =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid ListenPort: {}", value),
                                })?);
                        }
                        "mtu" => {
                            iface.mtu =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid MTU: {}", value),
                                })?);
                        }
                        _ => {
                            tracing::debug!("unknown interface key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(parse_key(value, "PublicKey")?);
                        }
                        "presharedkey" => {
                            peer.preshared_key = Some(parse_key(value, "PresharedKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        "allowedips" => {
                            for ip_str in value.split(',') {
                                let ip_str = ip_str.trim();
                                if ip_str.is_empty() {
                                    continue;
                                }
                                let net: IpNet =
                                    ip_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: ip_str.to_string(),
                                    })?;
                                peer.allowed_ips.push(net);
                            }
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid PersistentKeepalive: {}", value),
                                })?);
                        }
                        _ => {
                            tracing::debug!("unknown peer key: {}", key);
                        }
                    }
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

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".to_string(),
        })?;

        if interface.private_key == [0u8; 32] {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }

        Ok(TunnelConfig { interface, peers })
    }

    /// Our public key derived from the private key
    pub fn public_key(&self) -> [u8; 32] {
        x25519::public_key(&self.interface.private_key)
    }

    /// Apply the parsed configuration to a device: identity, bind and
    /// the full peer set
    pub fn apply(&self, device: &Device) -> Result<(), NoisetunError> {
        device.set_private_key(self.interface.private_key);
        if let Some(port) = self.interface.listen_port {
            device.set_listen_port(port)?;
        }

        for peer_config in &self.peers {
            let peer = device.add_peer(peer_config.public_key);
            peer.set_psk(peer_config.preshared_key);
            if let Some(endpoint) = peer_config.endpoint {
                peer.set_endpoint(endpoint);
            }
            if let Some(interval) = peer_config.persistent_keepalive {
                peer.set_persistent_keepalive(interval);
            }
            for prefix in &peer_config.allowed_ips {
                device.add_allowed_ip(&peer, *prefix);
            }
        }
        Ok(())
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

/// Builder for PeerConfig during parsing
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn new() -> Self {
        Self {
            public_key: None,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
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

/// Parse an endpoint (IP:port)
fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}
