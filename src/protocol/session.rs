//! Session (keypair) lifecycle
//!
//! A completed handshake yields a [`Keypair`]: two symmetric AEAD keys, a
//! pair of 32-bit session indices and the quota counters that bound its
//! life. Each peer holds up to three keypairs in a [`KeypairBank`] labelled
//! previous / current / next.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use zeroize::Zeroize;

use crate::error::ProtocolError;
use crate::protocol::handshake::HandshakeResult;
use crate::protocol::replay::ReplayWindow;
use crate::protocol::{
    REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME, SEND_REJECT_AFTER_MESSAGES,
};

/// Symmetric session state derived from one completed handshake
pub struct Keypair {
    /// Our session index, unique device-wide
    pub local_index: u32,
    /// The peer's session index, used as receiver index on sent frames
    pub remote_index: u32,
    /// Whether we initiated the handshake that produced this keypair
    pub is_initiator: bool,
    /// When the keypair was derived
    pub created: Instant,
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_counter: AtomicU64,
    /// Cleared once the first authenticated frame arrives on this keypair
    unconfirmed: AtomicBool,
    replay: Mutex<ReplayWindow>,
}

impl Keypair {
    pub fn new(result: &HandshakeResult) -> Self {
        Self {
            local_index: result.local_index,
            remote_index: result.remote_index,
            is_initiator: result.is_initiator,
            created: Instant::now(),
            send_key: result.sending_key,
            recv_key: result.receiving_key,
            send_counter: AtomicU64::new(0),
            unconfirmed: AtomicBool::new(true),
            replay: Mutex::new(ReplayWindow::new()),
        }
    }

    pub fn send_key(&self) -> &[u8; 32] {
        &self.send_key
    }

    pub fn recv_key(&self) -> &[u8; 32] {
        &self.recv_key
    }

    /// Reserve the next send counter. Counters are strictly monotonic and
    /// never reused; past the send quota the keypair is unusable.
    pub fn next_send_counter(&self) -> Result<u64, ProtocolError> {
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        if counter >= SEND_REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::CounterExhausted);
        }
        Ok(counter)
    }

    /// Number of counters handed out so far
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Invalid for both directions
    pub fn expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }

    /// Unusable for sending
    pub fn send_exhausted(&self) -> bool {
        self.expired() || self.send_counter() >= SEND_REJECT_AFTER_MESSAGES
    }

    /// An initiator should schedule a fresh handshake
    pub fn wants_rekey(&self) -> bool {
        self.is_initiator
            && (self.age() >= REKEY_AFTER_TIME || self.send_counter() >= REKEY_AFTER_MESSAGES)
    }

    /// Record the first authenticated receive on this keypair. Returns
    /// true the first time.
    pub fn confirm(&self) -> bool {
        self.unconfirmed.swap(false, Ordering::AcqRel)
    }

    pub fn is_confirmed(&self) -> bool {
        !self.unconfirmed.load(Ordering::Acquire)
    }

    /// Atomic replay check-and-update for a received counter
    pub fn accept_counter(&self, counter: u64) -> bool {
        self.replay.lock().unwrap().check_and_update(counter)
    }

    /// Test hook: jump the send counter to a quota boundary
    #[cfg(test)]
    pub(crate) fn set_send_counter(&self, value: u64) {
        self.send_counter.store(value, Ordering::Relaxed);
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("is_initiator", &self.is_initiator)
            .finish()
    }
}

/// The three keypair slots of a peer.
///
/// Transmission uses *current*. A freshly completed handshake lands in
/// *next*; the first authenticated receive on it rotates the bank. The
/// displaced *previous* drains in-flight packets elsewhere and is dropped
/// here.
#[derive(Default)]
pub struct KeypairBank {
    pub previous: Option<Arc<Keypair>>,
    pub current: Option<Arc<Keypair>>,
    pub next: Option<Arc<Keypair>>,
}

impl KeypairBank {
    /// Install a freshly derived keypair into the next slot. Returns the
    /// keypair it displaced, if any, so its index can be released.
    pub fn install_next(&mut self, keypair: Arc<Keypair>) -> Option<Arc<Keypair>> {
        self.next.replace(keypair)
    }

    /// Rotate on first authenticated receive: next becomes current,
    /// current becomes previous. Returns the dropped old previous, if
    /// any, so its index can be released. No-op unless `local_index`
    /// names the next slot.
    pub fn promote(&mut self, local_index: u32) -> Option<Arc<Keypair>> {
        match &self.next {
            Some(next) if next.local_index == local_index => {
                let next = self.next.take();
                let old_previous = std::mem::replace(&mut self.previous, self.current.take());
                self.current = next;
                old_previous
            }
            _ => None,
        }
    }

    /// The sending keypair
    pub fn current(&self) -> Option<Arc<Keypair>> {
        self.current.clone()
    }

    /// Receive lookup: any slot matching the session index
    pub fn by_index(&self, local_index: u32) -> Option<Arc<Keypair>> {
        [&self.current, &self.previous, &self.next]
            .into_iter()
            .flatten()
            .find(|kp| kp.local_index == local_index)
            .cloned()
    }

    /// All local indices currently held
    pub fn indices(&self) -> Vec<u32> {
        [&self.previous, &self.current, &self.next]
            .into_iter()
            .flatten()
            .map(|kp| kp.local_index)
            .collect()
    }

    /// Drop every slot, returning the keypairs so their indices can be
    /// released. Key material is zeroised when the last reference drops.
    pub fn clear(&mut self) -> Vec<Arc<Keypair>> {
        [
            self.previous.take(),
            self.current.take(),
            self.next.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair(local_index: u32, initiator: bool) -> Arc<Keypair> {
        Arc::new(Keypair::new(&HandshakeResult {
            local_index,
            remote_index: local_index + 1000,
            sending_key: [1u8; 32],
            receiving_key: [2u8; 32],
            is_initiator: initiator,
        }))
    }

    #[test]
    fn test_counters_strictly_increase() {
        let kp = test_keypair(1, true);

        assert_eq!(kp.next_send_counter().unwrap(), 0);
        assert_eq!(kp.next_send_counter().unwrap(), 1);
        assert_eq!(kp.next_send_counter().unwrap(), 2);
        assert_eq!(kp.send_counter(), 3);
    }

    #[test]
    fn test_quota_predicates() {
        let kp = test_keypair(1, true);
        assert!(!kp.expired());
        assert!(!kp.send_exhausted());
        assert!(!kp.wants_rekey());

        // Burning through the soft quota schedules a rekey but leaves
        // the keypair usable
        kp.send_counter
            .store(REKEY_AFTER_MESSAGES, Ordering::Relaxed);
        assert!(kp.wants_rekey());
        assert!(!kp.send_exhausted());

        // The hard cap makes sending fail outright
        kp.send_counter
            .store(SEND_REJECT_AFTER_MESSAGES, Ordering::Relaxed);
        assert!(kp.send_exhausted());
        assert!(kp.next_send_counter().is_err());

        // Responders never schedule rekeys on message count
        let responder = test_keypair(2, false);
        responder
            .send_counter
            .store(REKEY_AFTER_MESSAGES, Ordering::Relaxed);
        assert!(!responder.wants_rekey());
    }

    #[test]
    fn test_confirm_once() {
        let kp = test_keypair(1, false);

        assert!(!kp.is_confirmed());
        assert!(kp.confirm());
        assert!(!kp.confirm());
        assert!(kp.is_confirmed());
    }

    #[test]
    fn test_install_and_promote() {
        let mut bank = KeypairBank::default();

        let a = test_keypair(1, true);
        assert!(bank.install_next(a.clone()).is_none());
        assert!(bank.current().is_none());

        // First authenticated receive on the next slot rotates
        assert!(bank.promote(1).is_none());
        assert_eq!(bank.current().unwrap().local_index, 1);
        assert!(bank.next.is_none());

        // Second handshake
        let b = test_keypair(2, true);
        bank.install_next(b);
        assert_eq!(bank.current().unwrap().local_index, 1);
        bank.promote(2);
        assert_eq!(bank.current().unwrap().local_index, 2);
        assert_eq!(bank.previous.as_ref().unwrap().local_index, 1);

        // Third rotation drops the old previous
        let c = test_keypair(3, true);
        bank.install_next(c);
        let dropped = bank.promote(3);
        assert_eq!(dropped.unwrap().local_index, 1);
        assert_eq!(bank.indices().len(), 2);
    }

    #[test]
    fn test_promote_ignores_other_indices() {
        let mut bank = KeypairBank::default();
        bank.install_next(test_keypair(7, false));

        assert!(bank.promote(8).is_none());
        assert!(bank.current().is_none());
        assert!(bank.next.is_some());
    }

    #[test]
    fn test_by_index_searches_all_slots() {
        let mut bank = KeypairBank::default();
        bank.install_next(test_keypair(1, true));
        bank.promote(1);
        bank.install_next(test_keypair(2, true));
        bank.promote(2);
        bank.install_next(test_keypair(3, true));

        assert!(bank.by_index(1).is_some()); // previous
        assert!(bank.by_index(2).is_some()); // current
        assert!(bank.by_index(3).is_some()); // next
        assert!(bank.by_index(4).is_none());
        assert_eq!(bank.indices().len(), 3);
    }

    #[test]
    fn test_install_next_displaces() {
        let mut bank = KeypairBank::default();
        bank.install_next(test_keypair(1, true));
        let displaced = bank.install_next(test_keypair(2, true));
        assert_eq!(displaced.unwrap().local_index, 1);
    }

    #[test]
    fn test_clear_returns_all() {
        let mut bank = KeypairBank::default();
        bank.install_next(test_keypair(1, true));
        bank.promote(1);
        bank.install_next(test_keypair(2, true));

        let cleared = bank.clear();
        assert_eq!(cleared.len(), 2);
        assert!(bank.current().is_none());
        assert!(bank.next.is_none());
    }
}
