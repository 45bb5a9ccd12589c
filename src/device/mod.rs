//! Device controller and packet pipeline
//!
//! A [`Device`] owns one virtual interface, a dual-stack UDP bind, the
//! peer set with its routing trie, and the worker pools. Outbound: the
//! interface reader routes each inner packet to a peer, the encryption
//! pool seals it, and the peer's serialiser puts frames on the wire in
//! submission order. Inbound: the receive loops demux datagrams by
//! session index, the decryption pool opens them, and the peer's
//! serialiser applies replay/promotion/source checks in arrival order
//! before delivering to the interface. Handshake messages short-circuit
//! to a single ordered handshake worker.

pub mod allowed_ips;
pub mod index;
pub mod peer;
pub mod pool;
pub mod timers;
pub mod udp;
pub mod uapi;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::crypto::{aead, x25519};
use crate::device::allowed_ips::AllowedIps;
use crate::device::index::{IndexEntry, IndexTable};
use crate::device::peer::{InboundItem, Peer};
use crate::device::pool::{BufferPool, PooledBuffer, MAX_SEGMENT_SIZE, POOL_BUFFERS};
use crate::device::timers::TimerEvent;
use crate::device::udp::UdpPair;
use crate::error::{NetworkError, NoisetunError};
use crate::protocol::cookie::{CookieChecker, RateLimiter};
use crate::protocol::handshake::{consume_initiation, create_response, timestamp_after};
use crate::protocol::messages::{
    get_message_type, padded_len, CookieReply, HandshakeInitiation, HandshakeResponse,
    MessageType, TransportHeader,
};
use crate::protocol::session::Keypair;
use crate::tunnel::Tun;

/// Outbound staging queue depth per peer
pub const QUEUE_OUTBOUND_SIZE: usize = 1024;

/// Inbound serialiser queue depth per peer
pub const QUEUE_INBOUND_SIZE: usize = 1024;

/// Handshake worker queue depth per device
pub const QUEUE_HANDSHAKE_SIZE: usize = 1024;

/// Queue occupancy at which the device asserts load
const UNDER_LOAD_QUEUE_FRACTION: usize = 8;

/// How long the load assertion outlives its cause
const UNDER_LOAD_STICKY: Duration = Duration::from_secs(1);

/// The device's static identity key
#[derive(Clone, Copy)]
pub(crate) struct Identity {
    pub private: [u8; 32],
    pub public: [u8; 32],
}

/// One packet for the encryption pool
pub(crate) struct EncryptJob {
    pub keypair: Arc<Keypair>,
    pub counter: u64,
    pub packet: Vec<u8>,
    pub mtu: usize,
    pub done: oneshot::Sender<Option<Vec<u8>>>,
}

/// One datagram for the decryption pool
pub(crate) struct DecryptJob {
    pub keypair: Arc<Keypair>,
    pub buf: PacketBuf,
    pub len: usize,
    pub counter: u64,
    pub done: oneshot::Sender<Option<DecryptedFrame>>,
}

/// Result of opening a transport frame
pub(crate) struct DecryptedFrame {
    pub counter: u64,
    pub wire_len: usize,
    pub plaintext: Vec<u8>,
}

/// One handshake datagram with its source endpoint
pub(crate) struct HandshakeJob {
    pub data: Vec<u8>,
    pub src: SocketAddr,
}

/// Backing storage for an in-flight datagram
pub(crate) enum PacketBuf {
    Pooled(PooledBuffer),
    Heap(Vec<u8>),
}

impl PacketBuf {
    fn as_slice(&self) -> &[u8] {
        match self {
            PacketBuf::Pooled(buf) => buf,
            PacketBuf::Heap(buf) => buf,
        }
    }
}

struct NetState {
    port: u16,
    fwmark: Option<u32>,
    pair: Option<Arc<UdpPair>>,
    recv_tasks: Vec<JoinHandle<()>>,
}

/// Shared device state
pub(crate) struct DeviceInner {
    pub tun: Arc<dyn Tun>,
    identity: RwLock<Option<Identity>>,
    pub(crate) peers: RwLock<HashMap<[u8; 32], Arc<Peer>>>,
    pub(crate) allowed_ips: RwLock<AllowedIps<Arc<Peer>>>,
    pub(crate) index_table: IndexTable,
    cookie_checker: RwLock<Option<Arc<CookieChecker>>>,
    limiter: RateLimiter,
    pool: BufferPool,
    pub(crate) encrypt_tx: async_channel::Sender<EncryptJob>,
    encrypt_rx: async_channel::Receiver<EncryptJob>,
    decrypt_tx: async_channel::Sender<DecryptJob>,
    decrypt_rx: async_channel::Receiver<DecryptJob>,
    handshake_tx: async_channel::Sender<HandshakeJob>,
    handshake_rx: async_channel::Receiver<HandshakeJob>,
    under_load_until: Mutex<Option<Instant>>,
    net: Mutex<NetState>,
    /// Serialises control-plane transactions
    pub(crate) config_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    protocol_drops: AtomicU64,
    policy_drops: AtomicU64,
}

impl DeviceInner {
    pub(crate) fn identity(&self) -> Option<Identity> {
        *self.identity.read().unwrap()
    }

    pub(crate) fn mtu(&self) -> usize {
        usize::from(self.tun.mtu())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn note_protocol_drop(&self) {
        self.protocol_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_policy_drop(&self) {
        self.policy_drops.fetch_add(1, Ordering::Relaxed);
    }

    fn set_under_load(&self) {
        *self.under_load_until.lock().unwrap() = Some(Instant::now() + UNDER_LOAD_STICKY);
    }

    fn is_under_load(&self) -> bool {
        self.under_load_until
            .lock()
            .unwrap()
            .is_some_and(|until| Instant::now() < until)
    }

    /// Put raw bytes on the wire towards `target`. Returns whether the
    /// send succeeded.
    pub(crate) async fn send_raw(&self, data: &[u8], target: SocketAddr) -> bool {
        let pair = self.net.lock().unwrap().pair.clone();
        let Some(pair) = pair else {
            return false;
        };
        match pair.send_to(data, target).await {
            Ok(_) => true,
            Err(e) => {
                tracing::trace!("udp send to {} failed: {}", target, e);
                false
            }
        }
    }

    /// Route one received datagram. Transport frames go through the
    /// index table into the decryption pool; handshake messages pass the
    /// rate limiter into the ordered handshake queue.
    async fn demux(self: &Arc<Self>, buffer: PooledBuffer, len: usize, src: SocketAddr) {
        let data = &buffer[..len];
        let Ok(msg_type) = get_message_type(data) else {
            self.note_protocol_drop();
            return;
        };

        match msg_type {
            MessageType::TransportData => {
                let Ok(header) = TransportHeader::from_bytes(data) else {
                    self.note_protocol_drop();
                    return;
                };
                match self.index_table.get(header.receiver_index) {
                    Some(IndexEntry::Session { peer, keypair }) => {
                        let (done_tx, done_rx) = oneshot::channel();
                        let item = InboundItem {
                            rx: done_rx,
                            keypair: keypair.clone(),
                            src,
                        };
                        if peer.enqueue_inbound(item).is_err() {
                            self.note_protocol_drop();
                            return;
                        }
                        let job = DecryptJob {
                            keypair,
                            buf: PacketBuf::Pooled(buffer),
                            len,
                            counter: header.counter,
                            done: done_tx,
                        };
                        if self.decrypt_tx.try_send(job).is_err() {
                            self.note_protocol_drop();
                        }
                    }
                    Some(IndexEntry::Handshake { .. }) => {
                        // The response that completes this session is
                        // still queued; order the frame behind it.
                        let job = HandshakeJob {
                            data: data.to_vec(),
                            src,
                        };
                        if self.handshake_tx.try_send(job).is_err() {
                            self.note_protocol_drop();
                        }
                    }
                    None => self.note_protocol_drop(),
                }
            }
            MessageType::HandshakeInitiation | MessageType::HandshakeResponse => {
                let expected = match msg_type {
                    MessageType::HandshakeInitiation => HandshakeInitiation::SIZE,
                    _ => HandshakeResponse::SIZE,
                };
                if len != expected {
                    self.note_protocol_drop();
                    return;
                }
                if !self.limiter.allow(src.ip()) {
                    self.note_protocol_drop();
                    return;
                }
                let job = HandshakeJob {
                    data: data.to_vec(),
                    src,
                };
                if self.handshake_tx.try_send(job).is_err() {
                    self.note_protocol_drop();
                }
            }
            MessageType::CookieReply => {
                if len != CookieReply::SIZE {
                    self.note_protocol_drop();
                    return;
                }
                let job = HandshakeJob {
                    data: data.to_vec(),
                    src,
                };
                if self.handshake_tx.try_send(job).is_err() {
                    self.note_protocol_drop();
                }
            }
        }
    }

    /// Process a handshake initiation: mac checks, cookie challenge
    /// under load, DH, timestamp monotonicity, then the response and the
    /// confirmation keepalive that drives promotion at the initiator
    async fn handle_initiation(self: &Arc<Self>, job: HandshakeJob, under_load: bool) {
        let Some(identity) = self.identity() else {
            return;
        };
        let checker = self.cookie_checker.read().unwrap().clone();
        let Some(checker) = checker else { return };

        if !checker.verify_mac1(&job.data) {
            self.note_protocol_drop();
            return;
        }
        let Ok(msg) = HandshakeInitiation::from_bytes(&job.data) else {
            return;
        };

        if under_load && !checker.verify_mac2(&job.data, job.src) {
            if let Ok(reply) = checker.create_reply(msg.sender_index, &msg.mac1, job.src) {
                self.send_raw(&reply.to_bytes(), job.src).await;
            }
            return;
        }

        let incoming = match consume_initiation(&msg, &identity.private, &identity.public) {
            Ok(incoming) => incoming,
            Err(_) => {
                self.note_protocol_drop();
                return;
            }
        };

        let peer = self.peers.read().unwrap().get(&incoming.peer_static).cloned();
        let Some(peer) = peer else {
            tracing::trace!("initiation from unknown peer");
            self.note_protocol_drop();
            return;
        };

        // Double-initiation tie-break: when both sides initiate at once,
        // the lower public key keeps its own attempt and the higher
        // abandons its pending one, so both converge on a single session
        if identity.public > peer.public_key {
            if let Some(p) = peer.pending.lock().unwrap().take() {
                self.index_table.remove(p.hs.local_index);
                peer.timers.disarm(TimerEvent::RetransmitHandshake);
                tracing::debug!(peer = %peer.log_key(), "yielding to peer's initiation");
            }
        }

        // Replay defence across handshakes: the timestamp must be
        // strictly newer than anything previously accepted
        {
            let mut greatest = peer.greatest_timestamp.lock().unwrap();
            if let Some(g) = *greatest {
                if !timestamp_after(&incoming.timestamp, &g) {
                    tracing::trace!(peer = %peer.log_key(), "stale handshake timestamp");
                    self.note_protocol_drop();
                    return;
                }
            }
            *greatest = Some(incoming.timestamp);
        }

        let local_index = self.index_table.assign_handshake(peer.clone());
        let psk = *peer.psk.lock().unwrap();
        let response = {
            let mut jar = peer.cookie_jar.lock().unwrap();
            create_response(incoming, local_index, psk, &mut jar)
        };
        let (response, result) = match response {
            Ok(pair) => pair,
            Err(e) => {
                self.index_table.remove(local_index);
                tracing::debug!("failed to build handshake response: {}", e);
                return;
            }
        };

        let keypair = peer.install_keypair(self, &result);
        peer.update_endpoint(job.src);
        self.send_raw(&response.to_bytes(), job.src).await;
        tracing::debug!(peer = %peer.log_key(), "handshake complete (responder)");

        // Immediate keepalive on the fresh session so the initiator sees
        // an authenticated frame and promotes it
        peer.send_keepalive_on(self, &keypair).await;
    }

    /// Process a handshake response addressed to one of our in-flight
    /// initiations
    async fn handle_response(self: &Arc<Self>, job: HandshakeJob, under_load: bool) {
        let checker = self.cookie_checker.read().unwrap().clone();
        let Some(checker) = checker else { return };

        if !checker.verify_mac1(&job.data) {
            self.note_protocol_drop();
            return;
        }
        let Ok(msg) = HandshakeResponse::from_bytes(&job.data) else {
            return;
        };

        if under_load && !checker.verify_mac2(&job.data, job.src) {
            if let Ok(reply) = checker.create_reply(msg.sender_index, &msg.mac1, job.src) {
                self.send_raw(&reply.to_bytes(), job.src).await;
            }
            return;
        }

        let Some(IndexEntry::Handshake { peer }) = self.index_table.get(msg.receiver_index)
        else {
            self.note_protocol_drop();
            return;
        };

        let result = {
            let mut pending = peer.pending.lock().unwrap();
            let Some(mut p) = pending.take() else { return };
            if p.hs.local_index != msg.receiver_index {
                *pending = Some(p);
                return;
            }
            match p.hs.process_response(&msg) {
                Ok(result) => result,
                Err(_) => {
                    // A forged response must not clear the real attempt
                    *pending = Some(p);
                    self.note_protocol_drop();
                    return;
                }
            }
        };

        peer.timers.disarm(TimerEvent::RetransmitHandshake);
        let keypair = peer.install_keypair(self, &result);
        peer.update_endpoint(job.src);
        tracing::debug!(peer = %peer.log_key(), "handshake complete (initiator)");

        // Confirm to the responder so its next slot promotes even if its
        // own keepalive raced past us
        peer.send_keepalive_on(self, &keypair).await;
    }

    async fn handle_cookie_reply(self: &Arc<Self>, job: HandshakeJob) {
        let Ok(reply) = CookieReply::from_bytes(&job.data) else {
            return;
        };
        let peer = match self.index_table.get(reply.receiver_index) {
            Some(IndexEntry::Handshake { peer }) => peer,
            Some(IndexEntry::Session { peer, .. }) => peer,
            None => {
                self.note_protocol_drop();
                return;
            }
        };

        let consumed = peer
            .cookie_jar
            .lock()
            .unwrap()
            .consume_reply(&reply, &peer.public_key);
        match consumed {
            Ok(()) => {
                tracing::debug!(peer = %peer.log_key(), "cookie accepted, will retry with mac2")
            }
            Err(_) => self.note_protocol_drop(),
        }
    }

    /// A transport frame that was queued behind a pending response;
    /// by now its index should name a live session
    async fn redemux_transport(self: &Arc<Self>, job: HandshakeJob) {
        let Ok(header) = TransportHeader::from_bytes(&job.data) else {
            return;
        };
        let Some(IndexEntry::Session { peer, keypair }) = self.index_table.get(header.receiver_index)
        else {
            self.note_protocol_drop();
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let item = InboundItem {
            rx: done_rx,
            keypair: keypair.clone(),
            src: job.src,
        };
        if peer.enqueue_inbound(item).is_err() {
            self.note_protocol_drop();
            return;
        }
        let len = job.data.len();
        let job = DecryptJob {
            keypair,
            buf: PacketBuf::Heap(job.data),
            len,
            counter: header.counter,
            done: done_tx,
        };
        if self.decrypt_tx.try_send(job).is_err() {
            self.note_protocol_drop();
        }
    }
}

/// A userspace tunnel device
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a device over a virtual interface and start its worker
    /// pools. The device is idle until a private key is set and a port
    /// is bound.
    pub fn new(tun: Arc<dyn Tun>) -> Self {
        let (encrypt_tx, encrypt_rx) = async_channel::bounded(QUEUE_OUTBOUND_SIZE);
        let (decrypt_tx, decrypt_rx) = async_channel::bounded(QUEUE_INBOUND_SIZE);
        let (handshake_tx, handshake_rx) = async_channel::bounded(QUEUE_HANDSHAKE_SIZE);

        let inner = Arc::new(DeviceInner {
            tun,
            identity: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            allowed_ips: RwLock::new(AllowedIps::new()),
            index_table: IndexTable::new(),
            cookie_checker: RwLock::new(None),
            limiter: RateLimiter::new(),
            pool: BufferPool::new(POOL_BUFFERS, MAX_SEGMENT_SIZE),
            encrypt_tx,
            encrypt_rx,
            decrypt_tx,
            decrypt_rx,
            handshake_tx,
            handshake_rx,
            under_load_until: Mutex::new(None),
            net: Mutex::new(NetState {
                port: 0,
                fwmark: None,
                pair: None,
                recv_tasks: Vec::new(),
            }),
            config_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            protocol_drops: AtomicU64::new(0),
            policy_drops: AtomicU64::new(0),
        });

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let mut tasks = inner.tasks.lock().unwrap();
        for _ in 0..workers {
            tasks.push(tokio::spawn(encryption_worker(inner.encrypt_rx.clone())));
            tasks.push(tokio::spawn(decryption_worker(inner.decrypt_rx.clone())));
        }
        tasks.push(tokio::spawn(handshake_worker(inner.clone())));
        tasks.push(tokio::spawn(tun_reader(inner.clone())));
        drop(tasks);

        tracing::info!(
            "device created on {} ({} crypto workers)",
            inner.tun.name(),
            workers
        );

        Device { inner }
    }

    /// Replace the device identity. Pending handshakes built on the old
    /// key are abandoned.
    pub fn set_private_key(&self, private: [u8; 32]) {
        let public = x25519::public_key(&private);
        *self.inner.identity.write().unwrap() = Some(Identity { private, public });
        *self.inner.cookie_checker.write().unwrap() = Some(Arc::new(CookieChecker::new(&public)));

        let peers: Vec<Arc<Peer>> = self.inner.peers.read().unwrap().values().cloned().collect();
        for peer in peers {
            if let Some(p) = peer.pending.lock().unwrap().take() {
                self.inner.index_table.remove(p.hs.local_index);
            }
        }
        tracing::info!("device identity updated");
    }

    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.inner.identity().map(|id| id.public)
    }

    pub(crate) fn private_key(&self) -> Option<[u8; 32]> {
        self.inner.identity().map(|id| id.private)
    }

    /// Bind (or rebind) the dual-stack UDP pair. Port zero picks an
    /// ephemeral port. Returns the actual port.
    pub fn set_listen_port(&self, port: u16) -> Result<u16, NoisetunError> {
        let mut net = self.inner.net.lock().unwrap();
        if port != 0 && net.pair.as_ref().map(|p| p.port) == Some(port) {
            return Ok(port);
        }

        for task in net.recv_tasks.drain(..) {
            task.abort();
        }
        net.pair = None;

        let pair = UdpPair::bind(port, net.fwmark).map_err(|e| {
            NoisetunError::Network(NetworkError::BindFailed {
                addr: format!("port {}", port),
                reason: e.to_string(),
            })
        })?;
        let actual = pair.port;
        let pair = Arc::new(pair);

        net.recv_tasks
            .push(tokio::spawn(udp_recv_loop(self.inner.clone(), pair.v4.clone())));
        if let Some(v6) = &pair.v6 {
            net.recv_tasks
                .push(tokio::spawn(udp_recv_loop(self.inner.clone(), v6.clone())));
        }
        net.pair = Some(pair);
        net.port = actual;

        tracing::info!("listening on udp port {}", actual);
        Ok(actual)
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.inner.net.lock().unwrap().pair.as_ref().map(|p| p.port)
    }

    /// Set the routing mark applied to the UDP sockets; rebinds if
    /// already bound
    pub fn set_fwmark(&self, fwmark: Option<u32>) -> Result<(), NoisetunError> {
        let port = {
            let mut net = self.inner.net.lock().unwrap();
            net.fwmark = fwmark;
            let port = net.pair.as_ref().map(|p| p.port);
            if port.is_some() {
                // Drop the old bind so the rebind below is not elided
                for task in net.recv_tasks.drain(..) {
                    task.abort();
                }
                net.pair = None;
            }
            port
        };
        if let Some(port) = port {
            self.set_listen_port(port)?;
        }
        Ok(())
    }

    pub(crate) fn fwmark(&self) -> Option<u32> {
        self.inner.net.lock().unwrap().fwmark
    }

    /// Bring the bind down, preserving peers for a later re-bind
    pub fn down(&self) {
        let mut net = self.inner.net.lock().unwrap();
        for task in net.recv_tasks.drain(..) {
            task.abort();
        }
        net.pair = None;
        tracing::info!("device down");
    }

    /// Re-bind on the stored port after [`Device::down`] or a fatal bind
    /// error
    pub fn up(&self) -> Result<u16, NoisetunError> {
        let port = self.inner.net.lock().unwrap().port;
        self.set_listen_port(port)
    }

    /// Add a peer, or return the existing one with this key
    pub fn add_peer(&self, public_key: [u8; 32]) -> Arc<Peer> {
        if let Some(existing) = self.inner.peers.read().unwrap().get(&public_key) {
            return existing.clone();
        }
        let peer = Peer::new(public_key);
        peer.start(&self.inner);
        self.inner
            .peers
            .write()
            .unwrap()
            .insert(public_key, peer.clone());
        tracing::info!(peer = %peer.log_key(), "peer added");
        peer
    }

    pub fn peer(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        self.inner.peers.read().unwrap().get(public_key).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.read().unwrap().values().cloned().collect()
    }

    /// Remove a peer: cancel its timers, drain its queues, release its
    /// indices and prune its routes
    pub fn remove_peer(&self, public_key: &[u8; 32]) -> bool {
        let Some(peer) = self.inner.peers.write().unwrap().remove(public_key) else {
            return false;
        };
        self.inner
            .allowed_ips
            .write()
            .unwrap()
            .remove_by(&|p| Arc::ptr_eq(p, &peer));

        let dropped = peer.keypairs.write().unwrap().clear();
        let mut indices: Vec<u32> = dropped.iter().map(|kp| kp.local_index).collect();
        if let Some(p) = peer.pending.lock().unwrap().take() {
            indices.push(p.hs.local_index);
        }
        self.inner.index_table.remove_all(&indices);

        peer.stop();
        tracing::info!(peer = %peer.log_key(), "peer removed");
        true
    }

    /// Remove every peer
    pub fn clear_peers(&self) {
        let keys: Vec<[u8; 32]> = self.inner.peers.read().unwrap().keys().copied().collect();
        for key in keys {
            self.remove_peer(&key);
        }
    }

    /// Grant a prefix to a peer. Ownership partitions: the prefix is
    /// taken from any other peer holding it.
    pub fn add_allowed_ip(&self, peer: &Arc<Peer>, prefix: ipnet::IpNet) {
        self.inner
            .allowed_ips
            .write()
            .unwrap()
            .insert(prefix, peer.clone());

        for other in self.inner.peers.read().unwrap().values() {
            if !Arc::ptr_eq(other, peer) {
                other.allowed_ips.lock().unwrap().retain(|p| *p != prefix);
            }
        }
        let mut list = peer.allowed_ips.lock().unwrap();
        if !list.contains(&prefix) {
            list.push(prefix);
        }
    }

    /// Drop all prefixes owned by a peer
    pub fn clear_allowed_ips(&self, peer: &Arc<Peer>) {
        self.inner
            .allowed_ips
            .write()
            .unwrap()
            .remove_by(&|p| Arc::ptr_eq(p, peer));
        peer.allowed_ips.lock().unwrap().clear();
    }

    /// Egress route lookup, mainly for diagnostics and tests
    pub fn route(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.inner.allowed_ips.read().unwrap().lookup(addr).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Shut the device down: close the bind, stop every worker and peer,
    /// drain the queues. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.down();

        self.inner.encrypt_tx.close();
        self.inner.decrypt_tx.close();
        self.inner.handshake_tx.close();

        let peers: Vec<Arc<Peer>> = {
            let mut map = self.inner.peers.write().unwrap();
            map.drain().map(|(_, p)| p).collect()
        };
        for peer in &peers {
            peer.stop();
        }
        self.inner
            .allowed_ips
            .write()
            .unwrap()
            .remove_by(&|_| true);

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        tracing::info!("device closed");
    }

    /// Protocol drops so far (bad MAC/AEAD, replays, unknown indices)
    pub fn protocol_drops(&self) -> u64 {
        self.inner.protocol_drops.load(Ordering::Relaxed)
    }

    /// Policy drops so far (no route, source not allowed)
    pub fn policy_drops(&self) -> u64 {
        self.inner.policy_drops.load(Ordering::Relaxed)
    }

    pub(crate) fn inner(&self) -> &Arc<DeviceInner> {
        &self.inner
    }
}

/// Read inner packets, route by destination, stage per peer
async fn tun_reader(inner: Arc<DeviceInner>) {
    loop {
        if inner.is_closed() {
            break;
        }
        let Some(mut buf) = inner.pool.acquire().await else {
            continue;
        };
        let n = match inner.tun.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                if inner.is_closed() {
                    break;
                }
                tracing::debug!("interface read failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        let packet = &buf[..n];

        let Some(destination) = inner_destination(packet) else {
            inner.note_policy_drop();
            continue;
        };
        let peer = inner
            .allowed_ips
            .read()
            .unwrap()
            .lookup(destination)
            .cloned();
        let Some(peer) = peer else {
            tracing::trace!("no route for {}", destination);
            inner.note_policy_drop();
            continue;
        };

        peer.stage_packet(packet.to_vec());
        peer.flush_staged(&inner).await;
    }
}

/// Pad, seal and frame outbound packets
async fn encryption_worker(rx: async_channel::Receiver<EncryptJob>) {
    while let Ok(job) = rx.recv().await {
        let mut packet = job.packet;
        packet.resize(padded_len(packet.len(), job.mtu), 0);

        let result = aead::encrypt(job.keypair.send_key(), job.counter, &packet, &[])
            .ok()
            .map(|ciphertext| {
                TransportHeader::build_message(job.keypair.remote_index, job.counter, &ciphertext)
            });
        let _ = job.done.send(result);
    }
}

/// Open inbound frames
async fn decryption_worker(rx: async_channel::Receiver<DecryptJob>) {
    while let Ok(job) = rx.recv().await {
        let data = &job.buf.as_slice()[..job.len];
        let payload = &data[TransportHeader::SIZE..];

        let result = aead::decrypt(job.keypair.recv_key(), job.counter, payload, &[])
            .ok()
            .map(|plaintext| DecryptedFrame {
                counter: job.counter,
                wire_len: job.len,
                plaintext,
            });
        let _ = job.done.send(result);
    }
}

/// The single ordered handshake worker
async fn handshake_worker(inner: Arc<DeviceInner>) {
    while let Ok(job) = inner.handshake_rx.recv().await {
        if inner.handshake_rx.len() >= QUEUE_HANDSHAKE_SIZE / UNDER_LOAD_QUEUE_FRACTION {
            inner.set_under_load();
        }
        let under_load = inner.is_under_load();

        match get_message_type(&job.data) {
            Ok(MessageType::HandshakeInitiation) => inner.handle_initiation(job, under_load).await,
            Ok(MessageType::HandshakeResponse) => inner.handle_response(job, under_load).await,
            Ok(MessageType::CookieReply) => inner.handle_cookie_reply(job).await,
            Ok(MessageType::TransportData) => inner.redemux_transport(job).await,
            Err(_) => {}
        }
    }
}

/// One receive loop per address family
async fn udp_recv_loop(inner: Arc<DeviceInner>, socket: Arc<tokio::net::UdpSocket>) {
    loop {
        if inner.is_closed() {
            break;
        }
        let Some(mut buf) = inner.pool.acquire().await else {
            continue;
        };
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                if inner.is_closed() {
                    break;
                }
                tracing::trace!("udp recv failed: {}", e);
                continue;
            }
        };
        inner.demux(buf, len, src).await;
    }
}

/// Inner destination address of a raw IP packet (first nibble selects
/// the family)
pub(crate) fn inner_destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().unwrap();
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().unwrap();
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Inner source address of a raw IP packet
pub(crate) fn inner_source(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[12..16].try_into().unwrap();
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[8..24].try_into().unwrap();
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Strip transport padding using the length declared in the inner IP
/// header
pub(crate) fn truncate_inner(plaintext: &[u8]) -> Option<&[u8]> {
    match plaintext.first()? >> 4 {
        4 => {
            if plaintext.len() < 20 {
                return None;
            }
            let total = usize::from(u16::from_be_bytes(plaintext[2..4].try_into().unwrap()));
            if total < 20 || total > plaintext.len() {
                return None;
            }
            Some(&plaintext[..total])
        }
        6 => {
            if plaintext.len() < 40 {
                return None;
            }
            let payload = usize::from(u16::from_be_bytes(plaintext[4..6].try_into().unwrap()));
            let total = 40 + payload;
            if total > plaintext.len() {
                return None;
            }
            Some(&plaintext[..total])
        }
        _ => None,
    }
}
