//! Configuration handling
//!
//! INI-style `.conf` files with `[Interface]` and `[Peer]` sections and
//! base64-encoded keys, plus the glue that applies a parsed file to a
//! running device.

pub mod parser;

pub use parser::{InterfaceConfig, PeerConfig, TunnelConfig};
