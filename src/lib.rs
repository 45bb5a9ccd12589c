//! noisetun - userspace Noise-IK datagram tunnel
//!
//! A device exposes a virtual network interface; packets written to it
//! are encrypted, authenticated and carried to remote peers over UDP,
//! and authenticated datagrams from peers are decrypted and injected
//! back. Sessions are established with a Noise IKpsk2 handshake and
//! rotated under strict time and message quotas.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use noisetun::{Device, TunnelConfig};
//! use noisetun::tunnel::OsTun;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), noisetun::NoisetunError> {
//!     let config = TunnelConfig::from_file("tunnel.conf")?;
//!     let tun = OsTun::create(&config.interface.address, 1420).await?;
//!     let device = Device::new(Arc::new(tun));
//!     config.apply(&device)?;
//!     tokio::signal::ctrl_c().await?;
//!     device.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod protocol;
pub mod tunnel;

pub use config::TunnelConfig;
pub use device::peer::Peer;
pub use device::Device;
pub use error::NoisetunError;
