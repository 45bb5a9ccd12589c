//! Per-peer timer bank
//!
//! Each peer holds a bank of named one-shot timers driving the protocol:
//! handshake retransmission, passive and persistent keepalives, stale
//! session recovery and key-material expiry. Re-arming resets the
//! deadline; a stopped bank never fires again.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// The named timers of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Initiation sent, no response yet
    RetransmitHandshake,
    /// Data received, nothing sent since
    SendKeepalive,
    /// Data sent, nothing received since
    NewHandshake,
    /// No fresh handshake for three reject windows
    ZeroKeyMaterial,
    /// Configured wall-clock keepalive
    PersistentKeepalive,
}

const EVENTS: [TimerEvent; 5] = [
    TimerEvent::RetransmitHandshake,
    TimerEvent::SendKeepalive,
    TimerEvent::NewHandshake,
    TimerEvent::ZeroKeyMaterial,
    TimerEvent::PersistentKeepalive,
];

#[derive(Default)]
struct Deadlines {
    slots: [Option<Instant>; 5],
    stopped: bool,
}

impl Deadlines {
    fn slot(&mut self, event: TimerEvent) -> &mut Option<Instant> {
        &mut self.slots[event as usize]
    }
}

/// A bank of resettable one-shot timers with a single dispatch loop
#[derive(Default)]
pub struct TimerBank {
    state: Mutex<Deadlines>,
    notify: Notify,
}

impl TimerBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer, resetting any existing deadline
    pub fn arm(&self, event: TimerEvent, after: Duration) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }
        *state.slot(event) = Some(Instant::now() + after);
        drop(state);
        self.notify.notify_one();
    }

    /// Arm a timer only if it is not already pending
    pub fn arm_if_idle(&self, event: TimerEvent, after: Duration) {
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.slot(event).is_some() {
            return;
        }
        *state.slot(event) = Some(Instant::now() + after);
        drop(state);
        self.notify.notify_one();
    }

    /// Cancel a timer
    pub fn disarm(&self, event: TimerEvent) {
        let mut state = self.state.lock().unwrap();
        *state.slot(event) = None;
        drop(state);
        self.notify.notify_one();
    }

    pub fn is_armed(&self, event: TimerEvent) -> bool {
        self.state.lock().unwrap().slot(event).is_some()
    }

    /// Permanently silence the bank; pending waits return None
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.slots = [None; 5];
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next timer to fire. Returns None once the bank is
    /// stopped. The fired timer is disarmed before being returned.
    pub async fn next_event(&self) -> Option<TimerEvent> {
        loop {
            let (due, nearest) = {
                let mut state = self.state.lock().unwrap();
                if state.stopped {
                    return None;
                }

                let now = Instant::now();
                let mut due = None;
                let mut nearest: Option<Instant> = None;
                for event in EVENTS {
                    if let Some(deadline) = *state.slot(event) {
                        if deadline <= now {
                            due = Some(event);
                            break;
                        }
                        nearest = Some(nearest.map_or(deadline, |n: Instant| n.min(deadline)));
                    }
                }
                if let Some(event) = due {
                    *state.slot(event) = None;
                }
                (due, nearest)
            };

            if let Some(event) = due {
                return Some(event);
            }

            match nearest {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_deadline() {
        let bank = TimerBank::new();
        bank.arm(TimerEvent::SendKeepalive, Duration::from_secs(10));

        let fired = bank.next_event().await;
        assert_eq!(fired, Some(TimerEvent::SendKeepalive));
        assert!(!bank.is_armed(TimerEvent::SendKeepalive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_fires_first() {
        let bank = TimerBank::new();
        bank.arm(TimerEvent::NewHandshake, Duration::from_secs(15));
        bank.arm(TimerEvent::RetransmitHandshake, Duration::from_secs(5));

        assert_eq!(
            bank.next_event().await,
            Some(TimerEvent::RetransmitHandshake)
        );
        assert_eq!(bank.next_event().await, Some(TimerEvent::NewHandshake));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_resets_deadline() {
        let bank = Arc::new(TimerBank::new());
        bank.arm(TimerEvent::SendKeepalive, Duration::from_secs(10));

        let waiter = {
            let bank = bank.clone();
            tokio::spawn(async move { bank.next_event().await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        bank.arm(TimerEvent::SendKeepalive, Duration::from_secs(10));

        // The original deadline passes without firing
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!waiter.is_finished());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(waiter.await.unwrap(), Some(TimerEvent::SendKeepalive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels() {
        let bank = Arc::new(TimerBank::new());
        bank.arm(TimerEvent::NewHandshake, Duration::from_secs(1));
        bank.disarm(TimerEvent::NewHandshake);

        let bank2 = bank.clone();
        let waiter = tokio::spawn(async move { bank2.next_event().await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        bank.stop();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_silences_armed_timers() {
        let bank = TimerBank::new();
        bank.arm(TimerEvent::ZeroKeyMaterial, Duration::from_millis(1));
        bank.stop();

        assert_eq!(bank.next_event().await, None);
        // Arming after stop is ignored
        bank.arm(TimerEvent::SendKeepalive, Duration::from_millis(1));
        assert_eq!(bank.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_if_idle_does_not_reset() {
        let bank = TimerBank::new();
        bank.arm(TimerEvent::NewHandshake, Duration::from_secs(2));
        bank.arm_if_idle(TimerEvent::NewHandshake, Duration::from_secs(50));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(bank.next_event().await, Some(TimerEvent::NewHandshake));
    }
}
