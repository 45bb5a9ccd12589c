//! Text control plane
//!
//! A newline-delimited `key=value` protocol served over a local stream
//! socket. A `set=1` transaction is parsed and validated in full, then
//! committed atomically under the device configuration lock; a `get=1`
//! dumps the configuration plus per-peer counters. Every response ends
//! with `errno=<n>` and a blank line.

use std::net::SocketAddr;
use std::time::UNIX_EPOCH;

use ipnet::IpNet;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::device::Device;
use crate::error::ConfigError;

const EINVAL: i32 = 22;
const EADDRINUSE: i32 = 98;

/// A parsed, not yet applied `set=1` transaction
#[derive(Default)]
struct SetRequest {
    private_key: Option<[u8; 32]>,
    listen_port: Option<u16>,
    fwmark: Option<Option<u32>>,
    replace_peers: bool,
    peers: Vec<PeerSection>,
}

/// One `public_key=` block within a set transaction
struct PeerSection {
    public_key: [u8; 32],
    remove: bool,
    preshared_key: Option<Option<[u8; 32]>>,
    endpoint: Option<SocketAddr>,
    persistent_keepalive: Option<u16>,
    replace_allowed_ips: bool,
    allowed_ips: Vec<IpNet>,
}

impl PeerSection {
    fn new(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            remove: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode_key(value: &str, key: &str) -> Result<[u8; 32], ConfigError> {
    if value.len() != 64 {
        return Err(ConfigError::InvalidKey {
            field: key.to_string(),
        });
    }
    let mut out = [0u8; 32];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&value[2 * i..2 * i + 2], 16).map_err(|_| {
            ConfigError::InvalidKey {
                field: key.to_string(),
            }
        })?;
    }
    Ok(out)
}

fn parse_set_line(request: &mut SetRequest, key: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    };

    // Peer-scoped keys apply to the most recent public_key block
    if key == "public_key" {
        request
            .peers
            .push(PeerSection::new(hex_decode_key(value, key)?));
        return Ok(());
    }

    if let Some(peer) = request.peers.last_mut() {
        match key {
            "remove" => {
                peer.remove = value == "true";
                return Ok(());
            }
            "preshared_key" => {
                let psk = hex_decode_key(value, key)?;
                // An all-zero preshared key clears it
                peer.preshared_key = Some((psk != [0u8; 32]).then_some(psk));
                return Ok(());
            }
            "endpoint" => {
                peer.endpoint = Some(value.parse().map_err(|_| invalid())?);
                return Ok(());
            }
            "persistent_keepalive_interval" => {
                peer.persistent_keepalive = Some(value.parse().map_err(|_| invalid())?);
                return Ok(());
            }
            "replace_allowed_ips" => {
                peer.replace_allowed_ips = value == "true";
                return Ok(());
            }
            "allowed_ip" => {
                peer.allowed_ips
                    .push(value.parse().map_err(|_| ConfigError::InvalidCidr {
                        value: value.to_string(),
                    })?);
                return Ok(());
            }
            "protocol_version" => {
                if value != "1" {
                    return Err(invalid());
                }
                return Ok(());
            }
            _ => {}
        }
    }

    match key {
        "private_key" => request.private_key = Some(hex_decode_key(value, key)?),
        "listen_port" => request.listen_port = Some(value.parse().map_err(|_| invalid())?),
        "fwmark" => {
            let mark: u32 = value.parse().map_err(|_| invalid())?;
            request.fwmark = Some((mark != 0).then_some(mark));
        }
        "replace_peers" => request.replace_peers = value == "true",
        _ => {
            return Err(ConfigError::UnknownKey {
                key: key.to_string(),
            })
        }
    }
    Ok(())
}

/// Commit a validated transaction. Runs under the device config lock so
/// the data path sees either the old or the new configuration, never a
/// mix.
fn apply(device: &Device, request: SetRequest) -> i32 {
    if let Some(private) = request.private_key {
        device.set_private_key(private);
    }
    if let Some(fwmark) = request.fwmark {
        if device.set_fwmark(fwmark).is_err() {
            return EADDRINUSE;
        }
    }
    if let Some(port) = request.listen_port {
        if device.set_listen_port(port).is_err() {
            return EADDRINUSE;
        }
    }
    if request.replace_peers {
        device.clear_peers();
    }

    for section in request.peers {
        if section.remove {
            device.remove_peer(&section.public_key);
            continue;
        }
        let peer = device.add_peer(section.public_key);
        if let Some(psk) = section.preshared_key {
            peer.set_psk(psk);
        }
        if let Some(endpoint) = section.endpoint {
            peer.set_endpoint(endpoint);
        }
        if let Some(interval) = section.persistent_keepalive {
            peer.set_persistent_keepalive(interval);
        }
        if section.replace_allowed_ips {
            device.clear_allowed_ips(&peer);
        }
        for prefix in section.allowed_ips {
            device.add_allowed_ip(&peer, prefix);
        }
    }
    0
}

/// Render the `get=1` dump, without the trailing errno line
fn dump(device: &Device) -> String {
    let mut out = String::new();

    if let Some(private) = device.private_key() {
        out.push_str(&format!("private_key={}\n", hex_encode(&private)));
    }
    if let Some(port) = device.listen_port() {
        out.push_str(&format!("listen_port={}\n", port));
    }
    if let Some(fwmark) = device.fwmark() {
        out.push_str(&format!("fwmark={}\n", fwmark));
    }

    for peer in device.peers() {
        out.push_str(&format!("public_key={}\n", hex_encode(&peer.public_key)));
        out.push_str("protocol_version=1\n");
        if let Some(psk) = *peer.psk.lock().unwrap() {
            out.push_str(&format!("preshared_key={}\n", hex_encode(&psk)));
        }
        if let Some(endpoint) = peer.endpoint() {
            out.push_str(&format!("endpoint={}\n", endpoint));
        }
        out.push_str(&format!(
            "persistent_keepalive_interval={}\n",
            peer.persistent_keepalive()
        ));
        for prefix in peer.allowed_ips() {
            out.push_str(&format!("allowed_ip={}\n", prefix));
        }
        out.push_str(&format!("rx_bytes={}\n", peer.rx_bytes()));
        out.push_str(&format!("tx_bytes={}\n", peer.tx_bytes()));

        let (sec, nsec) = peer
            .last_handshake()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| (d.as_secs(), d.subsec_nanos()))
            .unwrap_or((0, 0));
        out.push_str(&format!("last_handshake_time_sec={}\n", sec));
        out.push_str(&format!("last_handshake_time_nsec={}\n", nsec));
    }
    out
}

/// Serve control-plane transactions on one connection until EOF
pub async fn serve_connection<S>(device: &Device, stream: S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    eprintln!("DEBUG: serve_connection start");
    while let Some(line) = lines.next_line().await? {
        eprintln!("DEBUG: outer line = {:?}", line);
        match line.as_str() {
            "get=1" => {
                // get is terminated by a blank line from the client
                let _ = lines.next_line().await?;
                let _guard = device.inner().config_lock.lock().await;
                let body = dump(device);
                write_half
                    .write_all(format!("{}errno=0\n\n", body).as_bytes())
                    .await?;
            }
            "set=1" => {
                let mut request = SetRequest::default();
                let mut errno = 0;

                while let Some(line) = lines.next_line().await? {
                    if line.is_empty() {
                        break;
                    }
                    let Some((key, value)) = line.split_once('=') else {
                        tracing::debug!("malformed control line: {}", line);
                        errno = EINVAL;
                        continue;
                    };
                    if errno == 0 {
                        if let Err(e) = parse_set_line(&mut request, key, value) {
                            tracing::debug!("control parse error: {}", e);
                            errno = EINVAL;
                        }
                    }
                }

                // Nothing is applied unless the whole transaction parsed
                if errno == 0 {
                    let _guard = device.inner().config_lock.lock().await;
                    errno = apply(device, request);
                }
                eprintln!("DEBUG: writing errno response {}", errno);
                write_half
                    .write_all(format!("errno={}\n\n", errno).as_bytes())
                    .await?;
                eprintln!("DEBUG: wrote errno response");
            }
            "" => {}
            other => {
                tracing::debug!("unknown control operation: {}", other);
                write_half.write_all(b"errno=22\n\n").await?;
            }
        }
    }
    Ok(())
}

/// Listen on a unix socket and serve each connection
#[cfg(unix)]
pub async fn serve_unix(device: Device, path: &std::path::Path) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = tokio::net::UnixListener::bind(path)?;
    tracing::info!("control socket at {}", path.display());

    loop {
        let (stream, _) = listener.accept().await?;
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(&device, stream).await {
                tracing::debug!("control connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::x25519;
    use crate::tunnel::ChannelTun;

    fn test_device() -> Device {
        let (tun, _handle) = ChannelTun::create("uapi0", 1420);
        Device::new(tun)
    }

    async fn transact(device: &Device, input: &str) -> String {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let device = device.clone();
        let task = tokio::spawn(async move {
            let _ = serve_connection(&device, server).await;
        });

        let (mut read, mut write) = tokio::io::split(client);
        tokio::io::AsyncWriteExt::write_all(&mut write, input.as_bytes())
            .await
            .unwrap();
        drop(write);

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut read, &mut out)
            .await
            .unwrap();
        task.await.unwrap();
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_set_then_get() {
        let device = test_device();
        let (private, _) = x25519::generate_keypair();
        let (_, peer_public) = x25519::generate_keypair();

        let set = format!(
            "set=1\n\
             private_key={}\n\
             listen_port=0\n\
             public_key={}\n\
             endpoint=192.0.2.7:51820\n\
             persistent_keepalive_interval=25\n\
             replace_allowed_ips=true\n\
             allowed_ip=10.10.0.0/16\n\
             allowed_ip=fd00::/64\n\n",
            hex_encode(&private),
            hex_encode(&peer_public),
        );
        let response = transact(&device, &set).await;
        assert_eq!(response, "errno=0\n\n");

        let response = transact(&device, "get=1\n\n").await;
        assert!(response.contains(&format!("private_key={}", hex_encode(&private))));
        assert!(response.contains(&format!("public_key={}", hex_encode(&peer_public))));
        assert!(response.contains("endpoint=192.0.2.7:51820"));
        assert!(response.contains("persistent_keepalive_interval=25"));
        assert!(response.contains("allowed_ip=10.10.0.0/16"));
        assert!(response.contains("allowed_ip=fd00::/64"));
        assert!(response.contains("rx_bytes=0"));
        assert!(response.contains("tx_bytes=0"));
        assert!(response.contains("last_handshake_time_sec=0"));
        assert!(response.ends_with("errno=0\n\n"));

        let peer = device.peer(&peer_public).unwrap();
        assert_eq!(peer.persistent_keepalive(), 25);
        assert!(device.route("10.10.1.1".parse().unwrap()).is_some());

        device.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_transaction_commits_nothing() {
        let device = test_device();
        let (_, peer_public) = x25519::generate_keypair();

        // Bad hex length poisons the whole transaction
        let set = format!(
            "set=1\n\
             public_key={}\n\
             allowed_ip=10.0.0.0/8\n\
             preshared_key=abcd\n\n",
            hex_encode(&peer_public),
        );
        let response = transact(&device, &set).await;
        assert_eq!(response, "errno=22\n\n");
        assert!(device.peer(&peer_public).is_none());
        assert!(device.peers().is_empty());

        device.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_key_is_an_error() {
        let device = test_device();
        let response = transact(&device, "set=1\nno_such_key=1\n\n").await;
        assert_eq!(response, "errno=22\n\n");
        device.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_and_replace_peers() {
        let device = test_device();
        let (private, _) = x25519::generate_keypair();
        let (_, pk_a) = x25519::generate_keypair();
        let (_, pk_b) = x25519::generate_keypair();

        let set = format!(
            "set=1\nprivate_key={}\npublic_key={}\nallowed_ip=10.1.0.0/16\npublic_key={}\nallowed_ip=10.2.0.0/16\n\n",
            hex_encode(&private),
            hex_encode(&pk_a),
            hex_encode(&pk_b),
        );
        assert_eq!(transact(&device, &set).await, "errno=0\n\n");
        assert_eq!(device.peers().len(), 2);

        // Remove one peer
        let remove = format!("set=1\npublic_key={}\nremove=true\n\n", hex_encode(&pk_a));
        assert_eq!(transact(&device, &remove).await, "errno=0\n\n");
        assert_eq!(device.peers().len(), 1);
        assert!(device.route("10.1.1.1".parse().unwrap()).is_none());
        assert!(device.route("10.2.1.1".parse().unwrap()).is_some());

        // replace_peers drops everything before the new sections
        let replace = format!(
            "set=1\nreplace_peers=true\npublic_key={}\n\n",
            hex_encode(&pk_a)
        );
        assert_eq!(transact(&device, &replace).await, "errno=0\n\n");
        assert_eq!(device.peers().len(), 1);
        assert!(device.peer(&pk_a).is_some());
        assert!(device.peer(&pk_b).is_none());

        device.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_psk_clears() {
        let device = test_device();
        let (_, pk) = x25519::generate_keypair();

        let set = format!(
            "set=1\npublic_key={}\npreshared_key={}\n\n",
            hex_encode(&pk),
            hex_encode(&[7u8; 32]),
        );
        assert_eq!(transact(&device, &set).await, "errno=0\n\n");
        let peer = device.peer(&pk).unwrap();
        assert!(peer.psk.lock().unwrap().is_some());

        let clear = format!(
            "set=1\npublic_key={}\npreshared_key={}\n\n",
            hex_encode(&pk),
            hex_encode(&[0u8; 32]),
        );
        assert_eq!(transact(&device, &clear).await, "errno=0\n\n");
        let peer = device.peer(&pk).unwrap();
        assert!(peer.psk.lock().unwrap().is_none());

        device.close();
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = [0xABu8; 32];
        let encoded = hex_encode(&key);
        assert_eq!(encoded.len(), 64);
        assert_eq!(hex_decode_key(&encoded, "k").unwrap(), key);
        assert!(hex_decode_key("zz", "k").is_err());
        assert!(hex_decode_key(&encoded[..62], "k").is_err());
    }
}
