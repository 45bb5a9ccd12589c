//! noisetun CLI
//!
//! Brings up a tunnel device from a configuration file and serves the
//! text control plane on a local socket.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use noisetun::config::TunnelConfig;
use noisetun::device::uapi;
use noisetun::error::{ConfigError, NoisetunError, TunnelError};
use noisetun::tunnel::{OsTun, DEFAULT_MTU};
use noisetun::Device;

/// Userspace Noise-IK datagram tunnel
#[derive(Parser, Debug)]
#[command(name = "noisetun")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the tunnel configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Path for the control socket
    #[arg(short, long)]
    uapi: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), NoisetunError> {
    tracing::info!("loading configuration from {}", args.config.display());
    let config = TunnelConfig::from_file(&args.config)?;

    let mtu = config.interface.mtu.unwrap_or(DEFAULT_MTU);
    let tun = OsTun::create(&config.interface.address, mtu).await?;
    let device = Device::new(Arc::new(tun));
    config.apply(&device)?;

    #[cfg(unix)]
    if let Some(path) = &args.uapi {
        let device = device.clone();
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(e) = uapi::serve_unix(device, &path).await {
                tracing::error!("control socket failed: {}", e);
            }
        });
    }
    #[cfg(not(unix))]
    if args.uapi.is_some() {
        tracing::warn!("control socket is only available on unix");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    device.close();
    Ok(())
}

/// Map an error to a user-facing message with a suggested action
fn user_message(error: &NoisetunError) -> String {
    match error {
        NoisetunError::Tunnel(TunnelError::InsufficientPrivileges { .. }) => {
            "Insufficient privileges to create a TUN device.\n  \
             Run with sudo or grant CAP_NET_ADMIN:\n  \
             sudo setcap cap_net_admin=eip ./noisetun"
                .to_string()
        }

        NoisetunError::Config(ConfigError::FileNotFound { path }) => {
            format!(
                "Configuration file not found: {}\n  Check the path and try again.",
                path
            )
        }

        NoisetunError::Config(ConfigError::InvalidKey { field }) => {
            format!(
                "Invalid {} in configuration.\n  Expected a 32-byte base64-encoded key.",
                field
            )
        }

        NoisetunError::Network(e) => {
            format!("{}\n  Check that the UDP port is free and routable.", e)
        }

        _ => format!("{}", error),
    }
}
