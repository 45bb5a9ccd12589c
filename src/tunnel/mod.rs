//! Virtual interface abstraction
//!
//! The device encrypts packets read from a [`Tun`] and injects decrypted
//! packets back into it. Two implementations ship: an OS TUN device via
//! the tun-rs crate, and an in-memory channel pair used by tests.

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::error::{NoisetunError, TunnelError};

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 1420;

/// The virtual interface contract: a source and sink of raw IP packets
/// plus an MTU query
#[async_trait]
pub trait Tun: Send + Sync {
    /// Read one inner IP packet
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    /// Inject one inner IP packet
    async fn send(&self, packet: &[u8]) -> Result<(), TunnelError>;

    /// Current interface MTU
    fn mtu(&self) -> u16;

    /// Interface name
    fn name(&self) -> &str;
}

/// OS TUN device
pub struct OsTun {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl OsTun {
    /// Create a TUN device configured with the given addresses
    pub async fn create(addresses: &[IpNet], mtu: u16) -> Result<Self, NoisetunError> {
        check_privileges();

        let mut builder = DeviceBuilder::new().mtu(mtu);
        for addr in addresses {
            match addr {
                IpNet::V4(net) => {
                    builder = builder.ipv4(net.addr(), net.prefix_len(), None);
                }
                IpNet::V6(net) => {
                    builder = builder.ipv6(net.addr(), net.prefix_len());
                }
            }
        }

        let device = builder
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device
            .deref()
            .name()
            .map_err(|e| TunnelError::CreateFailed {
                reason: format!("failed to get device name: {}", e),
            })?;

        tracing::info!("created TUN device {} (mtu {})", name, mtu);

        Ok(Self { device, name, mtu })
    }
}

#[async_trait]
impl Tun for OsTun {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.device
            .recv(buf)
            .await
            .map_err(|e| TunnelError::ReadFailed {
                reason: e.to_string(),
            })
    }

    async fn send(&self, packet: &[u8]) -> Result<(), TunnelError> {
        self.device
            .send(packet)
            .await
            .map(|_| ())
            .map_err(|e| TunnelError::WriteFailed {
                reason: e.to_string(),
            })
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn check_privileges() {
    #[cfg(unix)]
    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("running without root; TUN creation may fail");
    }
}

/// In-memory interface: packets are injected and collected through
/// channels instead of an OS device
pub struct ChannelTun {
    name: String,
    mtu: u16,
    source: async_channel::Receiver<Vec<u8>>,
    sink: async_channel::Sender<Vec<u8>>,
}

/// Test-side handle to a [`ChannelTun`]
pub struct ChannelTunHandle {
    /// Packets pushed here appear as interface reads
    pub inject: async_channel::Sender<Vec<u8>>,
    /// Decrypted packets the device delivered to the interface
    pub delivered: async_channel::Receiver<Vec<u8>>,
}

impl ChannelTun {
    pub fn create(name: &str, mtu: u16) -> (Arc<Self>, ChannelTunHandle) {
        let (inject, source) = async_channel::bounded(1024);
        let (sink, delivered) = async_channel::bounded(1024);
        (
            Arc::new(Self {
                name: name.to_string(),
                mtu,
                source,
                sink,
            }),
            ChannelTunHandle { inject, delivered },
        )
    }
}

#[async_trait]
impl Tun for ChannelTun {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let packet = self
            .source
            .recv()
            .await
            .map_err(|_| TunnelError::ReadFailed {
                reason: "interface closed".to_string(),
            })?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> Result<(), TunnelError> {
        self.sink
            .send(packet.to_vec())
            .await
            .map_err(|_| TunnelError::WriteFailed {
                reason: "interface closed".to_string(),
            })
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tun_roundtrip() {
        let (tun, handle) = ChannelTun::create("test0", 1420);
        assert_eq!(tun.mtu(), 1420);
        assert_eq!(tun.name(), "test0");

        handle.inject.send(vec![1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tun.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        tun.send(&[4, 5, 6]).await.unwrap();
        assert_eq!(handle.delivered.recv().await.unwrap(), vec![4, 5, 6]);
    }
}
