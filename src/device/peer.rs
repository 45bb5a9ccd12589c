//! Peer state and per-peer routines
//!
//! A peer owns its endpoint, its three-slot keypair bank, its pending
//! handshake, its timer bank and its bounded staging queues. Two
//! serialiser tasks restore per-peer packet order after the parallel
//! crypto pools: completion handles are drained strictly in submission
//! order.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::device::timers::{TimerBank, TimerEvent};
use crate::device::{
    inner_source, truncate_inner, DecryptedFrame, DeviceInner, EncryptJob, QUEUE_INBOUND_SIZE,
    QUEUE_OUTBOUND_SIZE,
};
use crate::protocol::cookie::CookieJar;
use crate::protocol::handshake::{HandshakeResult, InitiatorHandshake};
use crate::protocol::session::{Keypair, KeypairBank};
use crate::protocol::{
    KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME, REKEY_ATTEMPT_TIME, REKEY_TIMEOUT,
};

/// An initiation in flight
pub(crate) struct PendingHandshake {
    pub hs: InitiatorHandshake,
    /// When the latest attempt was sent
    pub sent_at: Instant,
    /// When the first attempt was sent; retransmission gives up after
    /// REKEY_ATTEMPT_TIME
    pub first_attempt: Instant,
}

/// Ordered completion handle for one outbound packet
pub(crate) struct OutboundItem {
    rx: oneshot::Receiver<Option<Vec<u8>>>,
    is_keepalive: bool,
}

/// Ordered completion handle for one inbound packet
pub(crate) struct InboundItem {
    pub rx: oneshot::Receiver<Option<DecryptedFrame>>,
    pub keypair: Arc<Keypair>,
    pub src: SocketAddr,
}

/// A remote peer, addressed by its static public key
pub struct Peer {
    pub public_key: [u8; 32],
    pub(crate) psk: Mutex<Option<[u8; 32]>>,
    pub(crate) endpoint: RwLock<Option<SocketAddr>>,
    pub(crate) keypairs: RwLock<KeypairBank>,
    pub(crate) pending: Mutex<Option<PendingHandshake>>,
    pub(crate) cookie_jar: Mutex<CookieJar>,
    /// Greatest TAI64N accepted from this peer, for cross-handshake
    /// replay defence
    pub(crate) greatest_timestamp: Mutex<Option<[u8; 12]>>,
    pub(crate) rx_bytes: AtomicU64,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) last_handshake: Mutex<Option<SystemTime>>,
    /// Seconds; zero disables
    pub(crate) persistent_keepalive: AtomicU32,
    /// The peer's configured prefixes; the routing trie is the owner,
    /// this list is the relation used for removal and reporting
    pub(crate) allowed_ips: Mutex<Vec<IpNet>>,
    pub(crate) timers: TimerBank,
    /// Serialises counter assignment against queue submission so the
    /// outbound serialiser sees counters in order
    flush_lock: tokio::sync::Mutex<()>,
    staged: Mutex<VecDeque<Vec<u8>>>,
    outbound_tx: async_channel::Sender<OutboundItem>,
    outbound_rx: async_channel::Receiver<OutboundItem>,
    inbound_tx: async_channel::Sender<InboundItem>,
    inbound_rx: async_channel::Receiver<InboundItem>,
    removed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(public_key: [u8; 32]) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = async_channel::bounded(QUEUE_OUTBOUND_SIZE);
        let (inbound_tx, inbound_rx) = async_channel::bounded(QUEUE_INBOUND_SIZE);
        Arc::new(Self {
            public_key,
            psk: Mutex::new(None),
            endpoint: RwLock::new(None),
            keypairs: RwLock::new(KeypairBank::default()),
            pending: Mutex::new(None),
            cookie_jar: Mutex::new(CookieJar::new()),
            greatest_timestamp: Mutex::new(None),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            last_handshake: Mutex::new(None),
            persistent_keepalive: AtomicU32::new(0),
            allowed_ips: Mutex::new(Vec::new()),
            timers: TimerBank::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            staged: Mutex::new(VecDeque::new()),
            outbound_tx,
            outbound_rx,
            inbound_tx,
            inbound_rx,
            removed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Abbreviated key for logs
    pub fn log_key(&self) -> String {
        BASE64.encode(&self.public_key[..8])
    }

    /// Spawn the per-peer routines: both serialisers and the timer
    /// dispatcher
    pub(crate) fn start(self: &Arc<Self>, device: &Arc<DeviceInner>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(outbound_loop(self.clone(), device.clone())));
        tasks.push(tokio::spawn(inbound_loop(self.clone(), device.clone())));
        tasks.push(tokio::spawn(timer_loop(self.clone(), device.clone())));
    }

    /// Tear the peer down: cancel timers, close queues, zeroise
    /// sessions. Index release is the device's job.
    pub(crate) fn stop(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.timers.stop();
        self.outbound_tx.close();
        self.inbound_tx.close();
        self.staged.lock().unwrap().clear();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read().unwrap()
    }

    pub fn set_endpoint(&self, addr: SocketAddr) {
        *self.endpoint.write().unwrap() = Some(addr);
    }

    /// Endpoint learning on authenticated receive
    pub(crate) fn update_endpoint(&self, addr: SocketAddr) {
        let mut endpoint = self.endpoint.write().unwrap();
        if *endpoint != Some(addr) {
            tracing::info!(peer = %self.log_key(), "endpoint changed to {}", addr);
            *endpoint = Some(addr);
        }
    }

    pub fn set_psk(&self, psk: Option<[u8; 32]>) {
        *self.psk.lock().unwrap() = psk;
    }

    pub fn set_persistent_keepalive(&self, seconds: u16) {
        self.persistent_keepalive
            .store(u32::from(seconds), Ordering::Relaxed);
        if seconds > 0 {
            self.timers.arm(
                TimerEvent::PersistentKeepalive,
                Duration::from_secs(u64::from(seconds)),
            );
        } else {
            self.timers.disarm(TimerEvent::PersistentKeepalive);
        }
    }

    pub fn persistent_keepalive(&self) -> u16 {
        self.persistent_keepalive.load(Ordering::Relaxed) as u16
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn last_handshake(&self) -> Option<SystemTime> {
        *self.last_handshake.lock().unwrap()
    }

    pub fn allowed_ips(&self) -> Vec<IpNet> {
        self.allowed_ips.lock().unwrap().clone()
    }

    /// Queue an inner packet for this peer. The staging queue is
    /// bounded; overflow evicts the oldest packet.
    pub(crate) fn stage_packet(&self, packet: Vec<u8>) {
        let mut staged = self.staged.lock().unwrap();
        if staged.len() >= QUEUE_OUTBOUND_SIZE {
            staged.pop_front();
            tracing::trace!(peer = %self.log_key(), "staging queue full, dropped oldest");
        }
        staged.push_back(packet);
    }

    pub(crate) fn enqueue_inbound(
        &self,
        item: InboundItem,
    ) -> Result<(), async_channel::TrySendError<InboundItem>> {
        self.inbound_tx.try_send(item)
    }

    /// Push staged packets into the encryption pool on the current
    /// keypair, or schedule a handshake when none is usable
    pub(crate) async fn flush_staged(self: &Arc<Self>, device: &Arc<DeviceInner>) {
        let _flush = self.flush_lock.lock().await;
        let current = self.keypairs.read().unwrap().current();
        let usable = current.filter(|kp| !kp.send_exhausted());
        let Some(kp) = usable else {
            if !self.staged.lock().unwrap().is_empty() {
                self.trigger_handshake(device).await;
            }
            return;
        };

        // Past the soft quota a new handshake is scheduled while traffic
        // continues on the old keypair
        if kp.wants_rekey() {
            self.trigger_handshake(device).await;
        }

        loop {
            let packet = self.staged.lock().unwrap().pop_front();
            let Some(packet) = packet else { break };
            self.send_on(device, &kp, packet, false).await;
        }
    }

    /// Hand one packet to the encryption pool and register its
    /// completion handle with the outbound serialiser
    async fn send_on(
        self: &Arc<Self>,
        device: &Arc<DeviceInner>,
        keypair: &Arc<Keypair>,
        packet: Vec<u8>,
        is_keepalive: bool,
    ) {
        let counter = match keypair.next_send_counter() {
            Ok(counter) => counter,
            Err(_) => {
                self.trigger_handshake(device).await;
                return;
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .outbound_tx
            .try_send(OutboundItem {
                rx: done_rx,
                is_keepalive,
            })
            .is_err()
        {
            return;
        }

        let job = EncryptJob {
            keypair: keypair.clone(),
            counter,
            packet,
            mtu: device.mtu(),
            done: done_tx,
        };
        let _ = device.encrypt_tx.send(job).await;
    }

    /// Send an empty transport frame on the current keypair
    pub(crate) async fn send_keepalive(self: &Arc<Self>, device: &Arc<DeviceInner>) {
        let current = self.keypairs.read().unwrap().current();
        match current.filter(|kp| !kp.send_exhausted()) {
            Some(kp) => self.send_on(device, &kp, Vec::new(), true).await,
            None => self.trigger_handshake(device).await,
        }
    }

    /// Send an empty transport frame on a specific keypair. Used right
    /// after handshake completion to drive promotion on the other side.
    pub(crate) async fn send_keepalive_on(
        self: &Arc<Self>,
        device: &Arc<DeviceInner>,
        keypair: &Arc<Keypair>,
    ) {
        self.send_on(device, keypair, Vec::new(), true).await;
    }

    /// Begin (or debounce) a handshake towards this peer
    pub(crate) async fn trigger_handshake(self: &Arc<Self>, device: &Arc<DeviceInner>) {
        if self.is_removed() {
            return;
        }
        let Some(endpoint) = self.endpoint() else {
            tracing::trace!(peer = %self.log_key(), "no endpoint, cannot initiate handshake");
            return;
        };
        let Some(identity) = device.identity() else {
            return;
        };

        let message = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(p) = pending.as_ref() {
                if p.sent_at.elapsed() < REKEY_TIMEOUT {
                    return;
                }
            }
            if let Some(old) = pending.take() {
                device.index_table.remove(old.hs.local_index);
            }

            let index = device.index_table.assign_handshake(self.clone());
            let psk = *self.psk.lock().unwrap();
            let mut hs = InitiatorHandshake::new(
                identity.private,
                identity.public,
                self.public_key,
                psk,
                index,
            );
            let msg = {
                let mut jar = self.cookie_jar.lock().unwrap();
                hs.create_initiation(&mut jar)
            };
            match msg {
                Ok(msg) => {
                    let now = Instant::now();
                    *pending = Some(PendingHandshake {
                        hs,
                        sent_at: now,
                        first_attempt: now,
                    });
                    msg.to_bytes().to_vec()
                }
                Err(e) => {
                    device.index_table.remove(index);
                    tracing::debug!(peer = %self.log_key(), "failed to build initiation: {}", e);
                    return;
                }
            }
        };

        tracing::debug!(peer = %self.log_key(), "sending handshake initiation");
        device.send_raw(&message, endpoint).await;
        self.timers.arm(TimerEvent::RetransmitHandshake, REKEY_TIMEOUT);
    }

    /// Resend an unanswered initiation, or give up after the attempt
    /// window
    async fn retransmit_handshake(self: &Arc<Self>, device: &Arc<DeviceInner>) {
        let Some(endpoint) = self.endpoint() else {
            return;
        };

        let message = {
            let mut pending = self.pending.lock().unwrap();
            let Some(p) = pending.as_mut() else { return };

            if p.first_attempt.elapsed() >= REKEY_ATTEMPT_TIME {
                device.index_table.remove(p.hs.local_index);
                *pending = None;
                self.staged.lock().unwrap().clear();
                tracing::debug!(peer = %self.log_key(), "handshake abandoned, no response");
                return;
            }

            let msg = {
                let mut jar = self.cookie_jar.lock().unwrap();
                p.hs.create_initiation(&mut jar)
            };
            match msg {
                Ok(msg) => {
                    p.sent_at = Instant::now();
                    msg.to_bytes().to_vec()
                }
                Err(_) => return,
            }
        };

        tracing::debug!(peer = %self.log_key(), "retransmitting handshake initiation");
        device.send_raw(&message, endpoint).await;
        self.timers.arm(TimerEvent::RetransmitHandshake, REKEY_TIMEOUT);
    }

    /// Install a freshly derived keypair into the next slot and register
    /// its index
    pub(crate) fn install_keypair(
        self: &Arc<Self>,
        device: &Arc<DeviceInner>,
        result: &HandshakeResult,
    ) -> Arc<Keypair> {
        let keypair = Arc::new(Keypair::new(result));

        let displaced = self
            .keypairs
            .write()
            .unwrap()
            .install_next(keypair.clone());
        if let Some(old) = displaced {
            device.index_table.remove(old.local_index);
        }

        device
            .index_table
            .insert_session(keypair.local_index, self.clone(), keypair.clone());
        *self.last_handshake.lock().unwrap() = Some(SystemTime::now());
        self.timers
            .arm(TimerEvent::ZeroKeyMaterial, REJECT_AFTER_TIME * 3);
        keypair
    }

    /// Timer effects after a frame actually left the socket
    fn on_packet_sent(&self, is_keepalive: bool) {
        self.timers.disarm(TimerEvent::SendKeepalive);
        if !is_keepalive {
            self.timers
                .arm_if_idle(TimerEvent::NewHandshake, KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
        }
        let interval = self.persistent_keepalive();
        if interval > 0 {
            self.timers.arm(
                TimerEvent::PersistentKeepalive,
                Duration::from_secs(u64::from(interval)),
            );
        }
    }

    /// Timer effects after an authenticated frame was accepted
    fn on_authenticated_received(&self, is_data: bool) {
        self.timers.disarm(TimerEvent::NewHandshake);
        if is_data {
            self.timers.arm(TimerEvent::SendKeepalive, KEEPALIVE_TIMEOUT);
        }
        let interval = self.persistent_keepalive();
        if interval > 0 {
            self.timers.arm(
                TimerEvent::PersistentKeepalive,
                Duration::from_secs(u64::from(interval)),
            );
        }
    }

    /// Wipe all session state after prolonged inactivity
    fn zero_key_material(&self, device: &Arc<DeviceInner>) {
        let dropped = self.keypairs.write().unwrap().clear();
        let indices: Vec<u32> = dropped.iter().map(|kp| kp.local_index).collect();
        device.index_table.remove_all(&indices);
        if let Some(p) = self.pending.lock().unwrap().take() {
            device.index_table.remove(p.hs.local_index);
        }
        tracing::debug!(peer = %self.log_key(), "zeroed key material");
    }

    async fn handle_timer_event(self: &Arc<Self>, device: &Arc<DeviceInner>, event: TimerEvent) {
        match event {
            TimerEvent::RetransmitHandshake => self.retransmit_handshake(device).await,
            TimerEvent::SendKeepalive => self.send_keepalive(device).await,
            TimerEvent::NewHandshake => {
                tracing::debug!(peer = %self.log_key(), "data sent without reply, rehandshaking");
                self.trigger_handshake(device).await;
            }
            TimerEvent::ZeroKeyMaterial => self.zero_key_material(device),
            TimerEvent::PersistentKeepalive => {
                self.send_keepalive(device).await;
                let interval = self.persistent_keepalive();
                if interval > 0 {
                    self.timers.arm(
                        TimerEvent::PersistentKeepalive,
                        Duration::from_secs(u64::from(interval)),
                    );
                }
            }
        }
    }
}

/// Drain outbound completion handles in submission order and put the
/// frames on the wire
async fn outbound_loop(peer: Arc<Peer>, device: Arc<DeviceInner>) {
    while let Ok(item) = peer.outbound_rx.recv().await {
        let Ok(Some(message)) = item.rx.await else {
            continue;
        };
        let Some(endpoint) = peer.endpoint() else {
            continue;
        };
        if device.send_raw(&message, endpoint).await {
            peer.tx_bytes
                .fetch_add(message.len() as u64, Ordering::Relaxed);
            peer.on_packet_sent(item.is_keepalive);
        }
    }
}

/// Drain inbound completion handles in arrival order: replay check,
/// promotion, endpoint learning, source filtering, interface delivery
async fn inbound_loop(peer: Arc<Peer>, device: Arc<DeviceInner>) {
    while let Ok(item) = peer.inbound_rx.recv().await {
        let Ok(Some(frame)) = item.rx.await else {
            device.note_protocol_drop();
            continue;
        };
        let keypair = item.keypair;

        if keypair.expired() {
            device.note_protocol_drop();
            continue;
        }
        if !keypair.accept_counter(frame.counter) {
            tracing::trace!(peer = %peer.log_key(), "replayed counter {}", frame.counter);
            device.note_protocol_drop();
            continue;
        }

        keypair.confirm();

        // First authenticated receive on the next slot rotates the bank
        let (promoted, dropped_previous) = {
            let mut bank = peer.keypairs.write().unwrap();
            let is_next = bank
                .next
                .as_ref()
                .is_some_and(|n| Arc::ptr_eq(n, &keypair));
            let dropped = if is_next {
                bank.promote(keypair.local_index)
            } else {
                None
            };
            (is_next, dropped)
        };
        if let Some(old) = dropped_previous {
            device.index_table.remove(old.local_index);
        }

        peer.update_endpoint(item.src);
        peer.rx_bytes
            .fetch_add(frame.wire_len as u64, Ordering::Relaxed);

        if promoted {
            tracing::debug!(peer = %peer.log_key(), "session {} promoted", keypair.local_index);
            peer.flush_staged(&device).await;
        }

        if frame.plaintext.is_empty() {
            // Keepalive: counters and timers only
            peer.on_authenticated_received(false);
            continue;
        }
        peer.on_authenticated_received(true);

        let Some(packet) = truncate_inner(&frame.plaintext) else {
            device.note_policy_drop();
            continue;
        };
        let Some(source) = inner_source(packet) else {
            device.note_policy_drop();
            continue;
        };

        let allowed = device
            .allowed_ips
            .read()
            .unwrap()
            .lookup(source)
            .is_some_and(|owner| Arc::ptr_eq(owner, &peer));
        if !allowed {
            tracing::trace!(peer = %peer.log_key(), "inner source {} not allowed", source);
            device.note_policy_drop();
            continue;
        }

        if let Err(e) = device.tun.send(packet).await {
            tracing::trace!("interface write failed: {}", e);
        }
    }
}

async fn timer_loop(peer: Arc<Peer>, device: Arc<DeviceInner>) {
    while let Some(event) = peer.timers.next_event().await {
        peer.handle_timer_event(&device, event).await;
    }
}
